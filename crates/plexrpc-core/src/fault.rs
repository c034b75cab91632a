//! Fault codes and the `Fault` value carried by requests and clients.
//!
//! Fault codes travel on the wire (services return them as a decimal field)
//! so their numeric values are fixed. Positive codes are raised by services,
//! negative codes by the client library itself.

use core::fmt;

/// Result type for client operations
pub type FaultResult<T> = Result<T, Fault>;

/// Every fault a request or client can report.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    NoFault = 0,

    // ── Returned by services ─────────────────────────────────────
    DeserializeFailed = 1,
    UnknownFunction = 2,
    RequestTooLarge = 3,
    RemoteConnectFailed = 4,
    RemoteTransferFailed = 5,

    // ── Client API misuse ────────────────────────────────────────
    AlreadyInitialized = -1,
    NotInitialized = -2,
    RequestNotAdded = -3,
    RequestAlreadyAdded = -4,
    RequestInProgress = -5,
    ResponseInProgress = -6,
    Unimplemented = -7,
    BadRequestLength = -8,
    NoAffinity = -9,
    NoWaitNotAllowed = -10,
    NeedNoRetry = -11,

    // ── Transport and protocol ───────────────────────────────────
    OpenSocketFailed = -15,
    ConnectFailed = -16,
    SocketWriteFailed = -17,
    SocketReadFailed = -18,
    ServiceTimeout = -19,
    IncompleteResponse = -20,
    ResponsePacketFormatError = -21,
    ContextFormatError = -22,
    ContextReservedNamespace = -23,
    SetsockoptFailed = -24,
    FcntlFailed = -25,

    // ── Service lookup ───────────────────────────────────────────
    ServiceNotFound = -30,
    ServiceKeyBad = -31,
    MapInitializationFailed = -32,
    OpenForMmapFailed = -33,
    LookupButNoMap = -34,
    PersistentRemapFlag = -35,

    // ── Retry and event plumbing ─────────────────────────────────
    ExceededRetryLimit = -43,
    RetryNotAllowed = -44,
    RemoteNotAllowed = -45,
    WriteEventForWrongFd = -46,
    ReadEventForWrongFd = -47,
    WriteEventWrongState = -48,
    ReadEventWrongState = -49,

    // ── Shared memory ────────────────────────────────────────────
    ShmFstatFailed = -101,
    ShmMmapFailed = -102,
    ShmVersionMisMatch = -103,
    ShmImpossiblySmall = -107,

    // ── Internal ─────────────────────────────────────────────────
    SeriousInternalOsError = -998,
    SeriousInternalRoutingError = -999,
}

impl FaultCode {
    const ALL: [FaultCode; 47] = [
        FaultCode::NoFault,
        FaultCode::DeserializeFailed,
        FaultCode::UnknownFunction,
        FaultCode::RequestTooLarge,
        FaultCode::RemoteConnectFailed,
        FaultCode::RemoteTransferFailed,
        FaultCode::AlreadyInitialized,
        FaultCode::NotInitialized,
        FaultCode::RequestNotAdded,
        FaultCode::RequestAlreadyAdded,
        FaultCode::RequestInProgress,
        FaultCode::ResponseInProgress,
        FaultCode::Unimplemented,
        FaultCode::BadRequestLength,
        FaultCode::NoAffinity,
        FaultCode::NoWaitNotAllowed,
        FaultCode::NeedNoRetry,
        FaultCode::OpenSocketFailed,
        FaultCode::ConnectFailed,
        FaultCode::SocketWriteFailed,
        FaultCode::SocketReadFailed,
        FaultCode::ServiceTimeout,
        FaultCode::IncompleteResponse,
        FaultCode::ResponsePacketFormatError,
        FaultCode::ContextFormatError,
        FaultCode::ContextReservedNamespace,
        FaultCode::SetsockoptFailed,
        FaultCode::FcntlFailed,
        FaultCode::ServiceNotFound,
        FaultCode::ServiceKeyBad,
        FaultCode::MapInitializationFailed,
        FaultCode::OpenForMmapFailed,
        FaultCode::LookupButNoMap,
        FaultCode::PersistentRemapFlag,
        FaultCode::ExceededRetryLimit,
        FaultCode::RetryNotAllowed,
        FaultCode::RemoteNotAllowed,
        FaultCode::WriteEventForWrongFd,
        FaultCode::ReadEventForWrongFd,
        FaultCode::WriteEventWrongState,
        FaultCode::ReadEventWrongState,
        FaultCode::ShmFstatFailed,
        FaultCode::ShmMmapFailed,
        FaultCode::ShmVersionMisMatch,
        FaultCode::ShmImpossiblySmall,
        FaultCode::SeriousInternalOsError,
        FaultCode::SeriousInternalRoutingError,
    ];

    /// Numeric wire value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a wire value back to a code. Unknown values are `None`.
    pub fn from_i32(value: i32) -> Option<FaultCode> {
        Self::ALL.iter().copied().find(|c| c.as_i32() == value)
    }

    /// True for anything other than `NoFault`
    #[inline]
    pub fn is_fault(self) -> bool {
        self != FaultCode::NoFault
    }

    /// Short English description used in logs and fault text
    pub fn english(self) -> &'static str {
        match self {
            FaultCode::NoFault => "no fault",
            FaultCode::DeserializeFailed => "service could not deserialize the request",
            FaultCode::UnknownFunction => "service does not implement the function",
            FaultCode::RequestTooLarge => "request too large for the service",
            FaultCode::RemoteConnectFailed => "remote connect failed",
            FaultCode::RemoteTransferFailed => "remote transfer failed",
            FaultCode::AlreadyInitialized => "client already initialized",
            FaultCode::NotInitialized => "client not initialized",
            FaultCode::RequestNotAdded => "request has not been added",
            FaultCode::RequestAlreadyAdded => "request already added",
            FaultCode::RequestInProgress => "request in progress",
            FaultCode::ResponseInProgress => "response in progress",
            FaultCode::Unimplemented => "unimplemented",
            FaultCode::BadRequestLength => "bad request length",
            FaultCode::NoAffinity => "no affinity connection for this request",
            FaultCode::NoWaitNotAllowed => "noWait is not allowed with keepAffinity",
            FaultCode::NeedNoRetry => "keepAffinity requires noRetry",
            FaultCode::OpenSocketFailed => "socket() failed",
            FaultCode::ConnectFailed => "connect() failed",
            FaultCode::SocketWriteFailed => "socket write failed",
            FaultCode::SocketReadFailed => "socket read failed",
            FaultCode::ServiceTimeout => "service timeout",
            FaultCode::IncompleteResponse => "incomplete response",
            FaultCode::ResponsePacketFormatError => "response packet format error",
            FaultCode::ContextFormatError => "context format error",
            FaultCode::ContextReservedNamespace => "context key uses the reserved namespace",
            FaultCode::SetsockoptFailed => "setsockopt() failed",
            FaultCode::FcntlFailed => "fcntl() failed",
            FaultCode::ServiceNotFound => "service not found",
            FaultCode::ServiceKeyBad => "service key is malformed",
            FaultCode::MapInitializationFailed => "lookup map initialization failed",
            FaultCode::OpenForMmapFailed => "open of lookup map failed",
            FaultCode::LookupButNoMap => "lookup attempted without a map",
            FaultCode::PersistentRemapFlag => "lookup map remap flag persists",
            FaultCode::ExceededRetryLimit => "exceeded retry limit",
            FaultCode::RetryNotAllowed => "retry not allowed",
            FaultCode::RemoteNotAllowed => "remote not allowed",
            FaultCode::WriteEventForWrongFd => "write event for wrong descriptor",
            FaultCode::ReadEventForWrongFd => "read event for wrong descriptor",
            FaultCode::WriteEventWrongState => "write event in wrong state",
            FaultCode::ReadEventWrongState => "read event in wrong state",
            FaultCode::ShmFstatFailed => "fstat of lookup map failed",
            FaultCode::ShmMmapFailed => "mmap of lookup map failed",
            FaultCode::ShmVersionMisMatch => "lookup map version mismatch",
            FaultCode::ShmImpossiblySmall => "lookup map is impossibly small",
            FaultCode::SeriousInternalOsError => "serious internal OS error",
            FaultCode::SeriousInternalRoutingError => "response routed to the wrong client",
        }
    }
}

impl Default for FaultCode {
    fn default() -> Self {
        FaultCode::NoFault
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.english(), self.as_i32())
    }
}

/// A fault code plus free-form detail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fault {
    code: FaultCode,
    text: String,
}

impl Fault {
    pub fn new(code: FaultCode, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    /// Fault with the code's English text as detail
    pub fn from_code(code: FaultCode) -> Self {
        Self { code, text: code.english().to_string() }
    }

    /// Fault whose detail is `"<op> failed: <last OS error>"`
    pub fn last_os(code: FaultCode, op: &str) -> Self {
        let err = std::io::Error::last_os_error();
        Self::from_io(code, op, &err)
    }

    pub fn from_io(code: FaultCode, op: &str, err: &std::io::Error) -> Self {
        Self { code, text: format!("{} failed: {}", op, err) }
    }

    #[inline]
    pub fn code(&self) -> FaultCode {
        self.code
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[inline]
    pub fn is_fault(&self) -> bool {
        self.code.is_fault()
    }

    /// Reset to `NoFault` with empty text
    pub fn clear(&mut self) {
        self.code = FaultCode::NoFault;
        self.text.clear();
    }

    pub fn set(&mut self, code: FaultCode, text: impl Into<String>) {
        self.code = code;
        self.text = text.into();
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.text)
        }
    }
}

impl std::error::Error for Fault {}

impl From<FaultCode> for Fault {
    fn from(code: FaultCode) -> Self {
        Fault::from_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(FaultCode::NoFault.as_i32(), 0);
        assert_eq!(FaultCode::NeedNoRetry.as_i32(), -11);
        assert_eq!(FaultCode::ServiceTimeout.as_i32(), -19);
        assert_eq!(FaultCode::PersistentRemapFlag.as_i32(), -35);
        assert_eq!(FaultCode::ShmImpossiblySmall.as_i32(), -107);
        assert_eq!(FaultCode::SeriousInternalRoutingError.as_i32(), -999);
    }

    #[test]
    fn test_from_i32() {
        assert_eq!(FaultCode::from_i32(2), Some(FaultCode::UnknownFunction));
        assert_eq!(FaultCode::from_i32(-44), Some(FaultCode::RetryNotAllowed));
        assert_eq!(FaultCode::from_i32(-998), Some(FaultCode::SeriousInternalOsError));
        assert_eq!(FaultCode::from_i32(0), Some(FaultCode::NoFault));
        assert_eq!(FaultCode::from_i32(-12), None);
        assert_eq!(FaultCode::from_i32(77), None);
    }

    #[test]
    fn test_fault_display() {
        let f = Fault::new(FaultCode::ConnectFailed, "connect() failed: refused");
        assert_eq!(format!("{}", f), "connect() failed (-16): connect() failed: refused");

        let f = Fault::new(FaultCode::ServiceTimeout, "");
        assert_eq!(format!("{}", f), "service timeout (-19)");
    }

    #[test]
    fn test_fault_clear_and_set() {
        let mut f = Fault::from(FaultCode::NoAffinity);
        assert!(f.is_fault());
        f.clear();
        assert!(!f.is_fault());
        assert!(f.text().is_empty());
        f.set(FaultCode::ServiceNotFound, "app.r.1");
        assert_eq!(f.code(), FaultCode::ServiceNotFound);
        assert_eq!(f.text(), "app.r.1");
    }
}
