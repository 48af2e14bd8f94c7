//! Library to backup the datastores of a self-hosted learning platform.
//!
//! Every backup run produces a snapshot: the dumps of all [`backends`]
//! packaged into one tarball, bound to a detached SHA-256 checksum and
//! published to a [`store`] under a sortable UTC timestamp (see [`snapshot`]).
//! Restoring reverses these steps, see [`restore`].

#![forbid(unsafe_code)]

pub mod backends;
pub mod backup;
pub mod cli;
pub mod config;
pub mod platform;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod util;
