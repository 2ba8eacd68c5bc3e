//! pulse filesystem engine and CLI, exposed as a library so the
//! integration tests can drive the format/mount/allocator stack directly.

pub mod cli;
pub mod commands;
pub mod fs;
pub mod hash;
