pub mod core;
pub mod marks;
pub mod notifications;
pub mod promotion;
pub mod rankings;
pub mod setup;
pub mod students;
