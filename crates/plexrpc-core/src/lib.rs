//! # plexrpc-core
//!
//! Platform-neutral pieces shared by the lookup map and the client:
//!
//! - `fault` - wire-stable fault codes and the `Fault` value
//! - `service_key` - four-part service identifiers
//! - `attr` - request attributes and their legal combinations
//! - `netstring` - typed netstring writer, parser and stream buffer
//! - `packet` - request/response assembly, decoding, context blobs
//! - `traits` - threading and poll hooks for host schedulers
//! - `spinlock` - small internal lock
//! - `kprint` - leveled stderr logging macros
//! - `env` - environment variable helpers

pub mod attr;
pub mod env;
pub mod fault;
pub mod kprint;
pub mod netstring;
pub mod packet;
pub mod service_key;
pub mod spinlock;
pub mod traits;

pub use attr::Attributes;
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_path, env_get_str, env_is_set};
pub use fault::{Fault, FaultCode, FaultResult};
pub use netstring::{nt, NetStringBuffer, NetStringError, NetStringParser, NetStringWriter};
pub use packet::{decode_request_packet, Context, DecodedPacket, PacketDecoder, RESERVED_CONTEXT_PREFIX};
pub use service_key::{Serialization, ServiceKey, ServiceKeyError};
pub use spinlock::SpinLock;
pub use traits::{OsThreading, Poller, RawLock, RawLockGuard, SystemPoller, ThreadingProvider};

/// Shared constants
pub mod constants {
    /// Lookup map used when neither an explicit path nor the environment names one
    pub const DEFAULT_LOOKUP_MAP_PATH: &str = "/usr/local/var/plexrpc/lookup.map";

    /// Environment override for the lookup map path
    pub const LOOKUP_MAP_ENV: &str = "PLEXRPC_LOOKUP_MAP";

    /// Bumped whenever the map layout changes
    pub const LOOKUP_MAP_VERSION: u32 = 1001;

    /// First request id handed out, and the value ids wrap back to
    pub const FIRST_REQUEST_ID: u64 = 100;

    /// Ids wrap once they pass this
    pub const MAX_REQUEST_ID: u64 = 10_000_000;
}
