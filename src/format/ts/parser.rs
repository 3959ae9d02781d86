use super::types::*;
use crate::error::{Result, TsError};

pub fn parse_header(data: &[u8]) -> Result<TsHeader> {
    if data.len() < TS_HEADER_SIZE {
        return Err(TsError::InvalidData("TS packet too short".into()));
    }

    if data[0] != TS_SYNC_BYTE {
        return Err(TsError::InvalidData("Invalid sync byte".into()));
    }

    Ok(TsHeader {
        sync_byte: data[0],
        transport_error: (data[1] & 0x80) != 0,
        payload_unit_start: (data[1] & 0x40) != 0,
        transport_priority: (data[1] & 0x20) != 0,
        pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
        scrambling_control: (data[3] >> 6) & 0x03,
        adaptation_field_exists: (data[3] & 0x20) != 0,
        contains_payload: (data[3] & 0x10) != 0,
        continuity_counter: data[3] & 0x0F,
    })
}

pub fn parse_adaptation_field(data: &[u8], header: &TsHeader) -> Result<Option<AdaptationField>> {
    if !header.adaptation_field_exists {
        return Ok(None);
    }

    let length = *data
        .get(TS_HEADER_SIZE)
        .ok_or_else(|| TsError::InvalidData("Adaptation field length missing".into()))?
        as usize;
    if data.len() < TS_HEADER_SIZE + 1 + length {
        return Err(TsError::InvalidData("Adaptation field too short".into()));
    }

    let flags = if length > 0 { data[TS_HEADER_SIZE + 1] } else { 0 };
    Ok(Some(AdaptationField {
        length,
        discontinuity: (flags & 0x80) != 0,
        random_access: (flags & 0x40) != 0,
    }))
}

/// One parsed 188-byte packet borrowing its payload
#[derive(Debug, Clone, Copy)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    pub adaptation: Option<AdaptationField>,
    /// Payload after header and adaptation field, empty when there is none
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() != TS_PACKET_SIZE {
            return Err(TsError::InvalidData(format!(
                "TS packet must be {} bytes, got {}",
                TS_PACKET_SIZE,
                data.len()
            )));
        }
        let header = parse_header(data)?;
        let adaptation = parse_adaptation_field(data, &header)?;

        let offset = TS_HEADER_SIZE + adaptation.map_or(0, |af| af.length + 1);
        let payload = if header.contains_payload {
            &data[offset..]
        } else {
            &data[TS_PACKET_SIZE..]
        };

        Ok(Self {
            header,
            adaptation,
            payload,
        })
    }

    pub fn pid(&self) -> u16 {
        self.header.pid
    }

    pub fn discontinuity(&self) -> bool {
        self.adaptation.map_or(false, |af| af.discontinuity)
    }
}
