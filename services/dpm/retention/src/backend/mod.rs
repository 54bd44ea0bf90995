//! Retention backend implementations

pub mod file;
pub mod mem;
