//! Command implementations.

pub mod init;
pub mod send;
pub mod start;
