//! `meson-core` — foundation types shared by every kernel crate.
//!
//! Provides typed physical/virtual addresses, page and frame abstractions,
//! spin-based synchronization primitives, and the kernel debug channel.
//! The crate is `no_std` and has no dependencies, so it compiles (and runs
//! its unit tests) on the host.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod log;
pub mod paging;
pub mod sync;
