pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod roster;
pub mod sessions;
pub mod settings;
pub mod students;
