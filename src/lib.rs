//! Backup and restore orchestration for the QiTlalli stack

pub mod core;
pub mod utils;
