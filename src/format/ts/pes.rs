use super::types::*;
use crate::error::{Result, TsError};
use crate::utils::BitReader;
use bytes::{BufMut, BytesMut};

/// Fixed part of a PES header: start code, stream_id, PES_packet_length
pub const PES_FIXED_HEADER_SIZE: usize = 6;

/// Packetized Elementary Stream (PES) header fields the data plane reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PesHeader {
    /// Stream identifier indicating content type (video/audio/etc.)
    pub stream_id: u8,
    /// PES_packet_length; 0 means unbounded (video only)
    pub packet_length: u16,
    /// Length of the optional header data
    pub header_data_length: u8,
    /// Presentation Time Stamp (33 bits, 90 kHz)
    pub pts: Option<u64>,
    /// Decoding Time Stamp (33 bits, 90 kHz)
    pub dts: Option<u64>,
}

/// Streams whose PES packets carry no optional header
fn has_optional_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        STREAM_ID_PROGRAM_STREAM_MAP | STREAM_ID_PADDING | STREAM_ID_PRIVATE_2 | 0xf0 | 0xf1 | 0xf2 | 0xf8 | 0xff
    )
}

fn read_timestamp(reader: &mut BitReader<'_>) -> Result<u64> {
    reader.skip_bits(4)?;
    let high = u64::from(reader.get_bits_graceful(3)?);
    reader.skip_bits(1)?;
    let mid = u64::from(reader.get_bits_graceful(15)?);
    reader.skip_bits(1)?;
    let low = u64::from(reader.get_bits_graceful(15)?);
    reader.skip_bits(1)?;
    Ok((high << 30) | (mid << 15) | low)
}

fn write_timestamp(buf: &mut BytesMut, prefix: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    buf.put_u8(prefix << 4 | (((ts >> 30) as u8) & 0x07) << 1 | 0x01);
    buf.put_u16((((ts >> 15) & 0x7FFF) as u16) << 1 | 0x01);
    buf.put_u16(((ts & 0x7FFF) as u16) << 1 | 0x01);
}

impl PesHeader {
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            ..Default::default()
        }
    }

    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Parses the PES header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = BitReader::new(data);
        if reader.get_bits_graceful(24)? != PES_START_CODE {
            return Err(TsError::InvalidData("missing PES start code".into()));
        }
        let mut header = PesHeader::new(reader.get_bits_graceful(8)? as u8);
        header.packet_length = reader.get_bits_graceful(16)? as u16;
        if !has_optional_header(header.stream_id) {
            return Ok(header);
        }

        if reader.get_bits_graceful(2)? != 0b10 {
            return Err(TsError::InvalidData("bad PES optional header marker".into()));
        }
        // scrambling, priority, alignment, copyright, original
        reader.skip_bits(6)?;
        let pts_dts_flags = reader.get_bits_graceful(2)?;
        // ESCR, ES rate, trick mode, copy info, CRC, extension
        reader.skip_bits(6)?;
        header.header_data_length = reader.get_bits_graceful(8)? as u8;

        if pts_dts_flags & 0b10 != 0 {
            header.pts = Some(read_timestamp(&mut reader)?);
        }
        if pts_dts_flags == 0b11 {
            header.dts = Some(read_timestamp(&mut reader)?);
        }
        Ok(header)
    }

    /// Size of the encoded header, optional fields included
    pub fn len(&self) -> usize {
        if !has_optional_header(self.stream_id) {
            return PES_FIXED_HEADER_SIZE;
        }
        PES_FIXED_HEADER_SIZE + 3 + self.timestamp_bytes()
    }

    fn timestamp_bytes(&self) -> usize {
        match (self.pts, self.dts) {
            (Some(_), Some(_)) => 10,
            (Some(_), None) => 5,
            _ => 0,
        }
    }

    /// Encodes the header; `packet_length` is written as given.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8((PES_START_CODE >> 16) as u8);
        buf.put_u8((PES_START_CODE >> 8) as u8);
        buf.put_u8(PES_START_CODE as u8);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);
        if !has_optional_header(self.stream_id) {
            return;
        }

        let pts_dts_flags: u8 = match (self.pts, self.dts) {
            (Some(_), Some(_)) => 0b11,
            (Some(_), None) => 0b10,
            _ => 0b00,
        };
        buf.put_u8(0x80);
        buf.put_u8(pts_dts_flags << 6);
        buf.put_u8(self.timestamp_bytes() as u8);

        match (self.pts, self.dts) {
            (Some(pts), Some(dts)) => {
                write_timestamp(buf, 0b0011, pts);
                write_timestamp(buf, 0b0001, dts);
            }
            (Some(pts), None) => write_timestamp(buf, 0b0010, pts),
            _ => {}
        }
    }
}
