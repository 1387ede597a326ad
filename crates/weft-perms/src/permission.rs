//! The three-level permission lattice.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PermsError;

/// Grant level for one resource on one connection.
///
/// Ordered `Reject < Read < Write`. Only `Write` lets local changes flow
/// back upstream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Permission {
    #[default]
    Reject = 0,
    Read = 1,
    Write = 2,
}

impl Permission {
    /// Wire ordinal.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn can_read(self) -> bool {
        self >= Permission::Read
    }

    pub fn can_write(self) -> bool {
        self == Permission::Write
    }

    /// Greatest lower bound.
    pub fn meet(self, other: Permission) -> Permission {
        self.min(other)
    }

    /// Least upper bound.
    pub fn join(self, other: Permission) -> Permission {
        self.max(other)
    }
}

impl TryFrom<u8> for Permission {
    type Error = PermsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Permission::Reject),
            1 => Ok(Permission::Read),
            2 => Ok(Permission::Write),
            other => Err(PermsError::InvalidPermission(other)),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Reject => "reject",
            Permission::Read => "read",
            Permission::Write => "write",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_roundtrip() {
        for p in [Permission::Reject, Permission::Read, Permission::Write] {
            assert_eq!(Permission::try_from(p.ordinal()).unwrap(), p);
        }
        assert!(Permission::try_from(3).is_err());
    }

    #[test]
    fn test_lattice() {
        assert!(Permission::Reject < Permission::Read);
        assert!(Permission::Read < Permission::Write);
        assert_eq!(Permission::Write.meet(Permission::Read), Permission::Read);
        assert_eq!(Permission::Reject.join(Permission::Read), Permission::Read);
        assert!(Permission::Write.can_read());
        assert!(!Permission::Read.can_write());
        assert!(!Permission::Reject.can_read());
    }

    #[test]
    fn test_serde_names() {
        let p: Permission = serde_json::from_str("\"write\"").unwrap();
        assert_eq!(p, Permission::Write);
        assert_eq!(serde_json::to_string(&Permission::Read).unwrap(), "\"read\"");
    }
}
