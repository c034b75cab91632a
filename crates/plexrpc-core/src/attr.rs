//! Request attributes and their legal combinations

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::fault::{Fault, FaultCode};
use crate::netstring::nt;

/// Bit set of per-request attributes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Attributes(u8);

impl Attributes {
    pub const NONE: Attributes = Attributes(0);
    /// Complete once sent; no response is read
    pub const NO_WAIT: Attributes = Attributes(1 << 0);
    /// Service must not forward to a remote peer
    pub const NO_REMOTE: Attributes = Attributes(1 << 1);
    pub const NO_RETRY: Attributes = Attributes(1 << 2);
    /// Keep the connection bound to the record after success
    pub const KEEP_AFFINITY: Attributes = Attributes(1 << 3);
    /// Send over the connection kept by a previous exchange
    pub const NEED_AFFINITY: Attributes = Attributes(1 << 4);

    /// Wire marker for each attribute, in transmission order
    pub const MARKERS: [(Attributes, u8); 5] = [
        (Attributes::NO_WAIT, nt::NO_WAIT),
        (Attributes::NO_REMOTE, nt::NO_REMOTE),
        (Attributes::NO_RETRY, nt::NO_RETRY),
        (Attributes::KEEP_AFFINITY, nt::KEEP_AFFINITY),
        (Attributes::NEED_AFFINITY, nt::NEED_AFFINITY),
    ];

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Attributes(bits & 0x1f)
    }

    #[inline]
    pub const fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Attributes) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Attributes) {
        self.0 &= !other.0;
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Attribute for a wire marker, if it is one
    pub fn from_marker(marker: u8) -> Option<Attributes> {
        Self::MARKERS
            .iter()
            .find(|(_, m)| *m == marker)
            .map(|(a, _)| *a)
    }

    /// Check the combination rules applied when a request is queued.
    ///
    /// `has_affinity` says whether the record still holds a connection from
    /// an earlier keep-affinity exchange.
    pub fn check_legal(self, has_affinity: bool) -> Result<(), Fault> {
        for rule in RULES {
            if self.contains(rule.when) && rule.broken(self, has_affinity) {
                return Err(Fault::new(rule.code, rule.text));
            }
        }
        Ok(())
    }
}

enum Need {
    Forbid(Attributes),
    Require(Attributes),
    Affinity,
}

struct Rule {
    when: Attributes,
    need: Need,
    code: FaultCode,
    text: &'static str,
}

impl Rule {
    fn broken(&self, attrs: Attributes, has_affinity: bool) -> bool {
        match self.need {
            Need::Forbid(other) => attrs.contains(other),
            Need::Require(other) => !attrs.contains(other),
            Need::Affinity => !has_affinity,
        }
    }
}

const RULES: [Rule; 3] = [
    Rule {
        when: Attributes::KEEP_AFFINITY,
        need: Need::Forbid(Attributes::NO_WAIT),
        code: FaultCode::NoWaitNotAllowed,
        text: "keepAffinity cannot be combined with noWait",
    },
    Rule {
        when: Attributes::KEEP_AFFINITY,
        need: Need::Require(Attributes::NO_RETRY),
        code: FaultCode::NeedNoRetry,
        text: "keepAffinity requires noRetry",
    },
    Rule {
        when: Attributes::NEED_AFFINITY,
        need: Need::Affinity,
        code: FaultCode::NoAffinity,
        text: "needAffinity but no connection was kept by a previous request",
    },
];

impl BitOr for Attributes {
    type Output = Attributes;

    fn bitor(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 | rhs.0)
    }
}

impl BitOrAssign for Attributes {
    fn bitor_assign(&mut self, rhs: Attributes) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 5] = ["noWait", "noRemote", "noRetry", "keepAffinity", "needAffinity"];
        let mut set = f.debug_set();
        for (ix, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << ix) != 0 {
                set.entry(name);
            }
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_affinity_rules() {
        let keep = Attributes::KEEP_AFFINITY;
        assert_eq!(keep.check_legal(false).unwrap_err().code(), FaultCode::NeedNoRetry);
        assert_eq!(
            (keep | Attributes::NO_RETRY | Attributes::NO_WAIT)
                .check_legal(false)
                .unwrap_err()
                .code(),
            FaultCode::NoWaitNotAllowed
        );
        assert!((keep | Attributes::NO_RETRY).check_legal(false).is_ok());
    }

    #[test]
    fn test_need_affinity_requires_connection() {
        let need = Attributes::NEED_AFFINITY;
        assert_eq!(need.check_legal(false).unwrap_err().code(), FaultCode::NoAffinity);
        assert!(need.check_legal(true).is_ok());
        assert!(Attributes::NONE.check_legal(false).is_ok());
    }

    #[test]
    fn test_markers_and_debug() {
        assert_eq!(Attributes::from_marker(b'g'), Some(Attributes::NO_RETRY));
        assert_eq!(Attributes::from_marker(b'k'), None);
        let mut a = Attributes::NO_WAIT | Attributes::NEED_AFFINITY;
        assert_eq!(format!("{:?}", a), r#"{"noWait", "needAffinity"}"#);
        a.remove(Attributes::NO_WAIT);
        assert!(!a.contains(Attributes::NO_WAIT));
        assert!(!a.contains(Attributes::NONE));
    }
}
