pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod fees;
pub mod notices;
pub mod setup;
pub mod students;
pub mod transport;
