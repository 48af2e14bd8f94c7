//! Interaction with the services of the learning platform.
//!
//! Stopping the platform during a backup gives consistent dumps. Restarting
//! it is tied to the lifetime of a [ServiceGuard], so a failing backup never
//! leaves the platform down.

mod services;

pub use services::{ComposeServices, ServiceControl, ServiceGuard};
