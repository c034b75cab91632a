//! # plexrpc-client
//!
//! Client side of plexrpc: requests are resolved through the lookup map,
//! sent over non-blocking Unix stream sockets as netstring packets, and
//! their responses collected without a thread per call.
//!
//! Two front ends share one state machine:
//!
//! - [`Client`] - blocking waits (`wait_sent`, `wait_all`, `wait_any`,
//!   `wait_one`, `wait_blocked`). Every client on a thread shares that
//!   thread's dispatcher, so a wait on one client also moves the others.
//! - [`EventClient`] - hands descriptors and timeouts to the caller's own
//!   event loop and is fed readiness back.
//!
//! ```text
//! ClientRequest ──add──▶ Dispatcher ──poll──▶ RequestRecord state machine
//!                         (per thread)         Resolving → Connecting →
//!                                              Writing → Reading → Completed
//! ```

mod condition;
mod config;
mod dispatcher;
mod event;
mod machine;
mod queue;
mod registry;
mod request;
mod socket;
mod timer;

#[cfg(test)]
mod testsvc;

pub use config::{ClientConfig, ConfigError, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT};
pub use event::{EventClient, EventError, EventKind, EventWanted};
pub use machine::Interest;
pub use queue::Client;
pub use registry::{current_thread_id, set_threading_provider, Registry};
pub use request::{ClientRequest, RequestState, ResponseData};
