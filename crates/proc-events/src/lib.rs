//! Process lifecycle events (fork, exec, credential and session changes,
//! exit) from the Linux kernel's netlink connector, delivered as typed
//! bounded channels.
//!
//! ```no_run
//! use proc_events::{MonitorConfig, ProcessMonitor};
//!
//! # async fn watch() {
//! let mut monitor = ProcessMonitor::connect(MonitorConfig::default()).unwrap();
//! let mut events = monitor.listen_events().unwrap();
//! while let Some(fork) = events.fork.recv().await {
//!     println!("{} forked {}", fork.parent_pid, fork.child_pid);
//! }
//! # }
//! ```

mod channels;
pub mod codec;
mod event;
mod monitor;
mod socket;

#[cfg(feature = "test-suite")]
pub mod test_runner;
#[cfg(feature = "test-suite")]
pub mod test_suite;

pub use channels::EventChannels;
pub use codec::{DecodeError, DecodedEvent, EncodeError};
pub use event::{
    EventAck, EventExec, EventExit, EventFork, EventGid, EventOther, EventSid, EventUid, ProcEvent,
};
pub use monitor::{ConnectError, ListenError, MonitorConfig, MonitorError, ProcessMonitor};
pub use socket::TransportError;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error
/// message, making it much less useful. Instead of re-implementing that,
/// we'll just use anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}
