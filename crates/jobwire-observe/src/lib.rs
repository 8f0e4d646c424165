//! Logging setup and the event-log subscriber for jobwire processes.
//!
//! - [`init_logger`]: installs the global `tracing` subscriber (text, json or journald).
//! - [`Journal`] (feature `subscriber`): writes updater events to the log.

mod logger;
pub use logger::*;

#[cfg(feature = "subscriber")]
mod subscriber;
#[cfg(feature = "subscriber")]
pub use subscriber::*;
