use super::types::SECTION_HEADER_SIZE;
use crate::error::Result;
use crate::utils::BitReader;

/// Bit position of version_number in a long-form section header
pub const VERSION_BIT_OFFSET: usize = 42;

/// Leading fields of a PSI/SI section.
///
/// Long-form fields (`table_id_extension` onwards) are only meaningful when
/// `section_syntax_indicator` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub table_id: u8,
    pub section_syntax_indicator: bool,
    pub private_indicator: bool,
    pub section_length: u16,
    pub table_id_extension: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
}

impl SectionHeader {
    /// Parses the eight-byte long-form header.
    ///
    /// Fails with [`TsError::Overread`](crate::TsError::Overread) on a short span.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = BitReader::new(data);
        let table_id = reader.get_bits_graceful(8)? as u8;
        let section_syntax_indicator = reader.get_bits_graceful(1)? == 1;
        let private_indicator = reader.get_bits_graceful(1)? == 1;
        reader.skip_bits(2)?;
        let section_length = reader.get_bits_graceful(12)? as u16;
        let table_id_extension = reader.get_bits_graceful(16)? as u16;
        reader.skip_bits(2)?;
        let version_number = reader.get_bits_graceful(5)? as u8;
        let current_next_indicator = reader.get_bits_graceful(1)? == 1;
        let section_number = reader.get_bits_graceful(8)? as u8;
        let last_section_number = reader.get_bits_graceful(8)? as u8;

        Ok(Self {
            table_id,
            section_syntax_indicator,
            private_indicator,
            section_length,
            table_id_extension,
            version_number,
            current_next_indicator,
            section_number,
            last_section_number,
        })
    }

    /// Whole section size including the three leading bytes
    pub fn total_len(&self) -> usize {
        SECTION_HEADER_SIZE + self.section_length as usize
    }
}

/// Reads the 5-bit version_number at its fixed bit offset.
pub fn section_version(data: &[u8]) -> Result<u8> {
    let mut reader = BitReader::new(data);
    reader.skip_bits(VERSION_BIT_OFFSET)?;
    Ok(reader.get_bits_graceful(5)? as u8)
}

/// Total section size from the first three bytes, if present.
pub fn section_total_len(data: &[u8]) -> Option<usize> {
    if data.len() < SECTION_HEADER_SIZE {
        return None;
    }
    Some(SECTION_HEADER_SIZE + ((((data[1] & 0x0f) as usize) << 8) | data[2] as usize))
}
