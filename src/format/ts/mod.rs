//! # MPEG Transport Stream (TS) Packet Layer
//!
//! Read-side parsing used by the filtering data plane:
//!
//! - TS packet header and adaptation field parsing
//! - PSI/SI section headers (table id, version, current/next)
//! - PES headers (stream id, PTS/DTS)
//!
//! Header fields are extracted with [`BitReader`](crate::utils::BitReader), so a
//! truncated payload surfaces as [`TsError::Overread`](crate::TsError::Overread)
//! instead of a panic.
//!
//! ## Example
//!
//! ```rust
//! use tsplane::format::ts::{SectionHeader, TsPacket, TS_PACKET_SIZE};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut packet = [0xffu8; TS_PACKET_SIZE];
//! packet[..4].copy_from_slice(&[0x47, 0x40, 0x20, 0x10]); // PUSI, pid 0x20
//! packet[4] = 0x00; // pointer field
//! packet[5..13].copy_from_slice(&[0x42, 0xb0, 0x09, 0x00, 0x01, 0xc7, 0x00, 0x00]);
//!
//! let parsed = TsPacket::parse(&packet)?;
//! assert_eq!(parsed.pid(), 0x20);
//! let section = SectionHeader::parse(&parsed.payload[1..])?;
//! assert_eq!(section.version_number, 3);
//! # Ok(())
//! # }
//! ```

/// Low-level TS packet parsing utilities
pub mod parser;

/// PES header parsing and encoding
pub mod pes;

/// Section header parsing
pub mod section;

/// Core TS types and constants
pub mod types;

pub use parser::{parse_header, TsPacket};
pub use pes::PesHeader;
pub use section::{section_total_len, section_version, SectionHeader};
pub use types::*;
