//! # plexrpc - local RPC over Unix sockets
//!
//! Services publish their socket paths in a memory-mapped lookup map; clients
//! resolve four-part service keys (`application.function.version.serialization`)
//! against it and exchange netstring-framed packets with the service.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use plexrpc::{Client, ClientRequest};
//!
//! let mut client = Client::new("billing");
//! client.initialize(None)?;
//!
//! let request = ClientRequest::new();
//! request.set_request_data(&b"{\"id\":7}"[..]);
//! client.set_timeout(Duration::from_millis(500));
//! client.add_request("accounts.balance.1.j", &request)?;
//! client.wait_all()?;
//!
//! if request.has_fault() {
//!     eprintln!("{}", request.fault());
//! } else {
//!     println!("{:?}", request.response_data()?.as_str());
//! }
//! ```
//!
//! ## Crates
//!
//! - [`core`] - fault codes, service keys, attributes, netstrings, packets
//! - [`lookup`] - the shared lookup map
//! - [`client`] - blocking and event-driven clients

pub use plexrpc_client as client;
pub use plexrpc_core as core;
pub use plexrpc_lookup as lookup;

pub use plexrpc_client::{
    current_thread_id, set_threading_provider, Client, ClientConfig, ClientRequest, ConfigError,
    EventClient, EventError, EventKind, EventWanted, Interest, RequestState, ResponseData,
};
pub use plexrpc_core::{
    Attributes, Context, Fault, FaultCode, FaultResult, OsThreading, Poller, ServiceKey,
    ThreadingProvider,
};
pub use plexrpc_lookup::{LookupReader, LookupWriter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
