//! Shared data model for the jobwire updater.
//!
//! - [`domain`]: job identifiers, states, registry records and scheduler observations.
//! - [`wire`]: application envelope exchanged with collectors once a security context exists.
//! - [`event`]: updater lifecycle events consumed by log/metrics subscribers.

pub mod domain;
pub use domain::*;

pub mod wire;
pub use wire::{Envelope, JobUpdate, WireError};

pub mod event;
pub use event::{EventKind, UpdaterEvent};
