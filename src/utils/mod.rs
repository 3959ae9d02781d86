//! # Utility Types
//!
//! Leaf building blocks of the data plane:
//!
//! - [`BitReader`]: big-endian bit fields with sticky over-read detection
//! - [`RingBuffer`]: locked fixed-capacity byte queue for thread handoff
//! - [`Crc32Mpeg2`]: section CRC validation
//!
//! ## Bit Operations
//!
//! ```rust
//! use tsplane::utils::BitReader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = vec![0b10110011u8];
//! let mut reader = BitReader::new(&data);
//!
//! let value = reader.get_bits_graceful(3)?; // 101
//! assert_eq!(value, 0b101);
//! # Ok(())
//! # }
//! ```

/// Bit-level reader for section and PES headers
pub mod bits;

/// MPEG-2 CRC32
pub mod crc;

/// Circular byte buffer
pub mod ring;

pub use bits::BitReader;
pub use crc::Crc32Mpeg2;
pub use ring::RingBuffer;
