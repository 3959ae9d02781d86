use crate::error::{Result, TsError};
use crate::format::ts::PID_MAX;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// What a filter extracts from its PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    /// PSI/SI sections
    Section,
    /// Audio PES packets
    Audio,
    /// Video PES packets
    Video,
    /// Whole transport packets
    Unspecified,
}

impl FilterKind {
    pub fn is_pes(self) -> bool {
        matches!(self, FilterKind::Audio | FilterKind::Video)
    }
}

/// Filter option bits
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FilterFlags(u32);

impl FilterFlags {
    pub const NONE: FilterFlags = FilterFlags(0);
    /// Drop sections whose CRC_32 does not verify
    pub const CHECK_CRC: FilterFlags = FilterFlags(0x1);
    /// Stop the resource after the first delivered unit
    pub const ONESHOT: FilterFlags = FilterFlags(0x2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        FilterFlags(bits & (Self::CHECK_CRC.0 | Self::ONESHOT.0))
    }

    pub const fn contains(self, other: FilterFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FilterFlags {
    type Output = FilterFlags;

    fn bitor(self, rhs: FilterFlags) -> FilterFlags {
        FilterFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FilterFlags {
    fn bitor_assign(&mut self, rhs: FilterFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FilterFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::CHECK_CRC) {
            names.push("CHECK_CRC");
        }
        if self.contains(Self::ONESHOT) {
            names.push("ONESHOT");
        }
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

/// Request for one PID filter; immutable once built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterDescriptor {
    pub pid: u16,
    pub kind: FilterKind,
    pub flags: FilterFlags,
}

impl FilterDescriptor {
    pub fn new(pid: u16, kind: FilterKind) -> Self {
        Self {
            pid,
            kind,
            flags: FilterFlags::NONE,
        }
    }

    pub fn section(pid: u16) -> Self {
        Self::new(pid, FilterKind::Section)
    }

    pub fn audio(pid: u16) -> Self {
        Self::new(pid, FilterKind::Audio)
    }

    pub fn video(pid: u16) -> Self {
        Self::new(pid, FilterKind::Video)
    }

    pub fn with_flags(mut self, flags: FilterFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pid > PID_MAX {
            return Err(TsError::InvalidArgument(format!(
                "pid {:#x} exceeds 13 bits",
                self.pid
            )));
        }
        Ok(())
    }
}

/// Identifier of a registered filter, unique per [`FilterRegistry`](super::FilterRegistry).
///
/// Doubles as the reactor token of the filter's readiness handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub u32);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter#{}", self.0)
    }
}

/// Data-specific metadata delivered with each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterMetadata {
    /// Per-filter delivery counter, starting at 0
    pub sequence: u64,
    pub table_id: Option<u8>,
    /// Section version_number, read at its fixed offset
    pub version: Option<u8>,
    pub current_next: Option<bool>,
    pub stream_id: Option<u8>,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
}
