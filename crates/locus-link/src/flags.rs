//! Bind flags passed through to the transport.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of bind flags. Flags combine with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BindFlags(u32);

impl BindFlags {
    /// Create the service if it is not running.
    pub const AUTO_CREATE: BindFlags = BindFlags(0x01);
    /// Keep diagnostic information about unbinds.
    pub const DEBUG_UNBIND: BindFlags = BindFlags(0x02);
    /// Let the service's priority follow the client's visibility.
    pub const ADJUST_WITH_ACTIVITY: BindFlags = BindFlags(0x80);

    /// No flags.
    #[must_use]
    pub const fn empty() -> Self {
        BindFlags(0)
    }

    /// The flags every shared connection binds with.
    #[must_use]
    pub const fn standard() -> Self {
        BindFlags(Self::AUTO_CREATE.0 | Self::DEBUG_UNBIND.0 | Self::ADJUST_WITH_ACTIVITY.0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: BindFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BindFlags {
    type Output = BindFlags;

    fn bitor(self, rhs: BindFlags) -> BindFlags {
        BindFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BindFlags {
    fn bitor_assign(&mut self, rhs: BindFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BindFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::AUTO_CREATE, "AUTO_CREATE"),
            (Self::DEBUG_UNBIND, "DEBUG_UNBIND"),
            (Self::ADJUST_WITH_ACTIVITY, "ADJUST_WITH_ACTIVITY"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "BindFlags({})", set.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine_with_or() {
        let flags = BindFlags::AUTO_CREATE | BindFlags::DEBUG_UNBIND;
        assert!(flags.contains(BindFlags::AUTO_CREATE));
        assert!(flags.contains(BindFlags::DEBUG_UNBIND));
        assert!(!flags.contains(BindFlags::ADJUST_WITH_ACTIVITY));
        assert_eq!(flags.bits(), 0x03);
    }

    #[test]
    fn test_standard_flags() {
        let standard = BindFlags::standard();
        assert!(standard.contains(BindFlags::AUTO_CREATE | BindFlags::DEBUG_UNBIND));
        assert!(standard.contains(BindFlags::ADJUST_WITH_ACTIVITY));
        assert!(!standard.is_empty());
        assert!(BindFlags::empty().is_empty());
    }

    #[test]
    fn test_flags_debug() {
        let mut flags = BindFlags::empty();
        flags |= BindFlags::AUTO_CREATE;
        assert_eq!(format!("{flags:?}"), "BindFlags(AUTO_CREATE)");
    }
}
