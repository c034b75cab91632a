//! Client configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use plexrpc_core::constants::LOOKUP_MAP_ENV;
use plexrpc_core::{env_get, env_get_bool, env_get_ms, env_get_path, kinfo};

/// Per-request timeout when the caller sets none
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Connection attempts per request, first try included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const MAX_ATTEMPTS_LIMIT: u32 = 8;

pub const DEFAULT_INBOUND_BUFFER: usize = 16 * 1024;
/// Smallest inbound buffer accepted by `validate`
pub const MIN_INBOUND_BUFFER: usize = 64;

/// Configuration shared by every request a client adds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Lookup map; `None` falls back to the environment, then the built-in path
    pub lookup_map_path: Option<PathBuf>,

    /// Timeout stamped on each request at add time
    pub default_timeout: Duration,

    /// Connection attempts before a transient failure becomes final
    pub max_attempts: u32,

    /// Initial size of each request's response buffer
    pub inbound_buffer_size: usize,

    /// Cap on a response packet, 0 for none
    pub max_response_size: usize,

    /// Trace state transitions at debug level
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lookup_map_path: None,
            default_timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            inbound_buffer_size: DEFAULT_INBOUND_BUFFER,
            max_response_size: 0,
            debug: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PLEXRPC_*` environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lookup_map_path: env_get_path(LOOKUP_MAP_ENV),
            default_timeout: env_get_ms("PLEXRPC_TIMEOUT_MS", d.default_timeout),
            max_attempts: env_get("PLEXRPC_MAX_ATTEMPTS", d.max_attempts),
            inbound_buffer_size: env_get("PLEXRPC_INBOUND_BUFFER", d.inbound_buffer_size),
            max_response_size: env_get("PLEXRPC_MAX_RESPONSE", d.max_response_size),
            debug: env_get_bool("PLEXRPC_CLIENT_DEBUG", d.debug),
        }
    }

    pub fn lookup_map_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lookup_map_path = Some(path.into());
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn inbound_buffer_size(mut self, n: usize) -> Self {
        self.inbound_buffer_size = n;
        self
    }

    pub fn max_response_size(mut self, n: usize) -> Self {
        self.max_response_size = n;
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ConfigError::MaxAttempts(self.max_attempts));
        }
        if self.inbound_buffer_size < MIN_INBOUND_BUFFER {
            return Err(ConfigError::InboundBufferTooSmall(self.inbound_buffer_size));
        }
        if self.max_response_size != 0 && self.max_response_size < self.inbound_buffer_size {
            return Err(ConfigError::ResponseCapBelowBuffer {
                cap: self.max_response_size,
                buffer: self.inbound_buffer_size,
            });
        }
        Ok(())
    }

    pub fn print(&self) {
        kinfo!("plexrpc client config:");
        match &self.lookup_map_path {
            Some(p) => kinfo!("  lookup_map_path: {}", p.display()),
            None => kinfo!("  lookup_map_path: (default)"),
        }
        kinfo!("  default_timeout: {:?}", self.default_timeout);
        kinfo!("  max_attempts: {}", self.max_attempts);
        kinfo!("  inbound_buffer_size: {}", self.inbound_buffer_size);
        kinfo!("  max_response_size: {}", self.max_response_size);
        kinfo!("  debug: {}", self.debug);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroTimeout,
    MaxAttempts(u32),
    InboundBufferTooSmall(usize),
    ResponseCapBelowBuffer { cap: usize, buffer: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroTimeout => write!(f, "default_timeout must be non-zero"),
            ConfigError::MaxAttempts(n) => {
                write!(f, "max_attempts {} not in 1..={}", n, MAX_ATTEMPTS_LIMIT)
            }
            ConfigError::InboundBufferTooSmall(n) => {
                write!(f, "inbound_buffer_size {} is below {}", n, MIN_INBOUND_BUFFER)
            }
            ConfigError::ResponseCapBelowBuffer { cap, buffer } => write!(
                f,
                "max_response_size {} is smaller than inbound_buffer_size {}",
                cap, buffer
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = ClientConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.default_timeout, Duration::from_millis(4000));
        assert_eq!(c.max_attempts, 2);
    }

    #[test]
    fn test_builder_and_validate() {
        let c = ClientConfig::new()
            .lookup_map_path("/tmp/x.map")
            .max_attempts(9);
        assert_eq!(c.validate(), Err(ConfigError::MaxAttempts(9)));
        assert_eq!(c.lookup_map_path.as_deref(), Some(std::path::Path::new("/tmp/x.map")));

        let c = ClientConfig::new().default_timeout(Duration::ZERO);
        assert_eq!(c.validate(), Err(ConfigError::ZeroTimeout));

        let c = ClientConfig::new().inbound_buffer_size(1024).max_response_size(512);
        assert!(matches!(c.validate(), Err(ConfigError::ResponseCapBelowBuffer { .. })));
        assert!(c.validate().unwrap_err().to_string().contains("512"));
    }
}
