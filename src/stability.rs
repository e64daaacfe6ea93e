//! Interface stability levels and compatibility checks.
//!
//! Every binder object carries a stability level describing which partition
//! boundaries its interface is stable across. A caller compiled against a
//! given requirement may only talk to objects whose declared level covers
//! that requirement, checked bitwise: each set bit in the requirement must
//! also be set in the provided level.

use tracing::warn;

/// Stability level of a binder interface.
///
/// The representation is a bitmask. A level satisfies a requirement when it
/// is a superset of the requirement's bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Level {
    /// No stability declared. Compatible only with in-process callers.
    Undeclared = 0,
    /// Stable within the vendor partition.
    Vendor = 0b0000_0011,
    /// Stable within the system partition.
    System = 0b0000_1100,
    /// Stable across the system/vendor boundary.
    Vintf = 0b0011_1111,
}

impl Level {
    /// Stability of objects constructed in this process.
    #[cfg(not(feature = "vendor"))]
    pub const LOCAL: Level = Level::System;
    /// Stability of objects constructed in this process.
    #[cfg(feature = "vendor")]
    pub const LOCAL: Level = Level::Vendor;

    /// Decodes a raw level received over the wire.
    ///
    /// Returns `None` for values that are not a known level; such objects
    /// never satisfy any requirement.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Level> {
        match raw {
            0 => Some(Level::Undeclared),
            0b0000_0011 => Some(Level::Vendor),
            0b0000_1100 => Some(Level::System),
            0b0011_1111 => Some(Level::Vintf),
            _ => None,
        }
    }

    /// Returns true when this level covers every bit of `required`.
    #[must_use]
    pub fn satisfies(self, required: Level) -> bool {
        (self as i32) & (required as i32) == required as i32
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Level::Undeclared => "undeclared",
            Level::Vendor => "vendor",
            Level::System => "system",
            Level::Vintf => "vintf",
        };
        f.write_str(name)
    }
}

/// Checks a raw declared level against a requirement.
///
/// Unknown declared levels fail every check. Failures are logged; the caller
/// turns them into [`crate::IpcError::BadType`].
#[must_use]
pub fn check(provided_raw: i32, required: Level) -> bool {
    match Level::from_raw(provided_raw) {
        Some(provided) if provided.satisfies(required) => true,
        Some(provided) => {
            warn!(%provided, %required, "object stability does not satisfy requirement");
            false
        }
        None => {
            warn!(provided_raw, %required, "unrecognized stability level");
            false
        }
    }
}
