//! # Service keys
//!
//! A service key names a remote operation with four dot-separated parts:
//!
//! ```text
//! application.function.version.serialization      canonical (on the wire)
//! application.serialization.version[.function]    search (lookup map)
//! ```
//!
//! The search form puts the function last so a lookup can drop it and fall
//! back to an application-wide entry.
//!
//! Application and function are case-insensitive and stored lower-cased.
//! Serialization is a one-character code; the long names (`JSON`, `raw`,
//! ...) are accepted on input and normalized to the code.

use std::cell::OnceCell;
use std::fmt;
use std::str::FromStr;

pub const MAX_APPLICATION_LEN: usize = 32;
pub const MAX_FUNCTION_LEN: usize = 32;
pub const MAX_VERSION_DIGITS: usize = 6;

// ── Serialization ──

/// Payload encoding a service speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serialization {
    Cobol,
    Html,
    Jms,
    Json,
    NetString,
    Php,
    Soap,
    Xml,
    #[default]
    Raw,
}

impl Serialization {
    pub const ALL: [Serialization; 9] = [
        Serialization::Cobol,
        Serialization::Html,
        Serialization::Jms,
        Serialization::Json,
        Serialization::NetString,
        Serialization::Php,
        Serialization::Soap,
        Serialization::Xml,
        Serialization::Raw,
    ];

    /// The one-character tag used in keys
    pub fn code(self) -> char {
        match self {
            Serialization::Cobol => 'c',
            Serialization::Html => 'h',
            Serialization::Jms => 'm',
            Serialization::Json => 'j',
            Serialization::NetString => 'n',
            Serialization::Php => 'p',
            Serialization::Soap => 's',
            Serialization::Xml => 'x',
            Serialization::Raw => 'r',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Serialization::Cobol => "COBOL",
            Serialization::Html => "HTML",
            Serialization::Jms => "JMS",
            Serialization::Json => "JSON",
            Serialization::NetString => "NETSTRING",
            Serialization::Php => "PHP",
            Serialization::Soap => "SOAP",
            Serialization::Xml => "XML",
            Serialization::Raw => "raw",
        }
    }

    /// Accepts the code or the long name, exact case
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| (tag.len() == 1 && tag.starts_with(s.code())) || tag == s.name())
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ── Errors ──

/// Why a key failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceKeyError(&'static str);

impl ServiceKeyError {
    pub const TOO_MANY_TOKENS: Self =
        ServiceKeyError("invalid syntax - more than four dot-separated tokens");
    pub const TOO_FEW_TOKENS: Self = ServiceKeyError("invalid syntax - need four dot-separated tokens");
    pub const APPLICATION_LENGTH: Self =
        ServiceKeyError("Application Name length is not in the range 1-32 characters");
    pub const FUNCTION_EMPTY: Self = ServiceKeyError("Service Function is zero length");
    pub const FUNCTION_LENGTH: Self =
        ServiceKeyError("Service Function length is greater than 32 characters");
    pub const VERSION_LENGTH: Self =
        ServiceKeyError("Service Version length is not in the range 1-6 characters");
    pub const VERSION_LEADING_ZERO: Self = ServiceKeyError("version has ambiguous leading zero");
    pub const VERSION_NOT_NUMERIC: Self = ServiceKeyError("version is not a positive integer");
    pub const SERIALIZATION_EMPTY: Self = ServiceKeyError("serialization is zero length");
    pub const SERIALIZATION_UNKNOWN: Self = ServiceKeyError("serialization type is unrecognized");

    pub fn message(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ServiceKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ServiceKeyError {}

// ── ServiceKey ──

#[derive(Clone, Default)]
pub struct ServiceKey {
    application: String,
    function: String,
    version: u32,
    serialization: Serialization,
    canonical: OnceCell<String>,
}

impl ServiceKey {
    /// Build from parts without validation; lengths are the caller's concern
    pub fn new(application: &str, function: &str, version: u32, serialization: Serialization) -> Self {
        ServiceKey {
            application: application.to_owned(),
            function: function.to_owned(),
            version,
            serialization,
            canonical: OnceCell::new(),
        }
    }

    /// Parse a client-issued key: all four parts required
    pub fn parse(text: &str) -> Result<Self, ServiceKeyError> {
        Self::parse_with(text, true)
    }

    /// Parse a service or configuration key: the function may be empty
    pub fn parse_service(text: &str) -> Result<Self, ServiceKeyError> {
        Self::parse_with(text, false)
    }

    pub fn parse_with(text: &str, client: bool) -> Result<Self, ServiceKeyError> {
        let mut tokens = text.split('.');
        let mut parts = [""; 4];
        for part in parts.iter_mut() {
            *part = tokens.next().ok_or(ServiceKeyError::TOO_FEW_TOKENS)?;
        }
        if tokens.next().is_some() {
            return Err(ServiceKeyError::TOO_MANY_TOKENS);
        }
        let [application, function, version, serialization] = parts;

        if application.is_empty() || application.len() > MAX_APPLICATION_LEN {
            return Err(ServiceKeyError::APPLICATION_LENGTH);
        }
        if client && function.is_empty() {
            return Err(ServiceKeyError::FUNCTION_EMPTY);
        }
        if function.len() > MAX_FUNCTION_LEN {
            return Err(ServiceKeyError::FUNCTION_LENGTH);
        }
        let version = parse_version(version)?;
        if serialization.is_empty() {
            return Err(ServiceKeyError::SERIALIZATION_EMPTY);
        }
        let serialization =
            Serialization::from_tag(serialization).ok_or(ServiceKeyError::SERIALIZATION_UNKNOWN)?;

        Ok(ServiceKey::new(application, function, version, serialization))
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    pub fn set_application(&mut self, application: &str) {
        self.application = application.to_owned();
        self.canonical = OnceCell::new();
    }

    pub fn set_function(&mut self, function: &str) {
        self.function = function.to_owned();
        self.canonical = OnceCell::new();
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
        self.canonical = OnceCell::new();
    }

    pub fn set_serialization(&mut self, serialization: Serialization) {
        self.serialization = serialization;
        self.canonical = OnceCell::new();
    }

    /// `application.function.version.serialization`, computed once per change.
    ///
    /// Names keep the case they were given. The serialization is always the
    /// one-character code, so a key parsed with a long name such as `JSON`
    /// comes back with `j`.
    pub fn canonical(&self) -> &str {
        self.canonical.get_or_init(|| {
            format!(
                "{}.{}.{}.{}",
                self.application,
                self.function,
                self.version,
                self.serialization.code()
            )
        })
    }

    /// `application.serialization.version[.function]`
    pub fn search_key(&self) -> String {
        let mut key = format!(
            "{}.{}.{}",
            self.application,
            self.serialization.code(),
            self.version
        );
        if !self.function.is_empty() {
            key.push('.');
            key.push_str(&self.function);
        }
        key
    }

    pub fn is_empty(&self) -> bool {
        self.application.is_empty()
    }
}

fn parse_version(text: &str) -> Result<u32, ServiceKeyError> {
    if text.is_empty() || text.len() > MAX_VERSION_DIGITS {
        return Err(ServiceKeyError::VERSION_LENGTH);
    }
    if text.len() > 1 && text.starts_with('0') {
        return Err(ServiceKeyError::VERSION_LEADING_ZERO);
    }
    text.bytes().try_fold(0u32, |acc, b| {
        if b.is_ascii_digit() {
            Ok(acc * 10 + u32::from(b - b'0'))
        } else {
            Err(ServiceKeyError::VERSION_NOT_NUMERIC)
        }
    })
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.application == other.application
            && self.function == other.function
            && self.version == other.version
            && self.serialization == other.serialization
    }
}

impl Eq for ServiceKey {}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceKey({})", self.canonical())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

impl FromStr for ServiceKey {
    type Err = ServiceKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKey::parse(s)
    }
}
