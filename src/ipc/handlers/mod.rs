pub mod backup_exchange;
pub mod catalog;
pub mod core;
pub mod gradebook;
pub mod records;
pub mod students;
