//! Utilities shared by the backends and the snapshot store.

pub mod process;
