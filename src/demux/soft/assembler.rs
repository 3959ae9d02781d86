use crate::demux::FilterKind;
use crate::format::ts::{
    section_total_len, TsPacket, MAX_SECTION_SIZE, PES_START_CODE, TABLE_ID_STUFFING,
};
use crate::format::ts::pes::PES_FIXED_HEADER_SIZE;
use crate::utils::Crc32Mpeg2;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};

/// Splits the packets of one PID into deliverable units
#[derive(Debug)]
pub(crate) struct Assembler {
    mode: Mode,
    last_cc: Option<u8>,
}

#[derive(Debug)]
enum Mode {
    Section(SectionAssembler),
    Pes(PesAssembler),
    Raw,
}

enum Continuity {
    Next,
    Duplicate,
    Lost,
}

impl Assembler {
    pub(crate) fn new(kind: FilterKind, check_crc: bool) -> Self {
        let mode = match kind {
            FilterKind::Section => Mode::Section(SectionAssembler::new(check_crc)),
            FilterKind::Audio | FilterKind::Video => Mode::Pes(PesAssembler::default()),
            FilterKind::Unspecified => Mode::Raw,
        };
        Self { mode, last_cc: None }
    }

    /// Bytes held for a unit that is not complete yet
    pub(crate) fn pending(&self) -> usize {
        match &self.mode {
            Mode::Section(section) => section.buf.len(),
            Mode::Pes(pes) => pes.buf.len(),
            Mode::Raw => 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        match &mut self.mode {
            Mode::Section(section) => section.reset(),
            Mode::Pes(pes) => pes.reset(),
            Mode::Raw => {}
        }
        self.last_cc = None;
    }

    /// Feeds one packet; completed units are appended to `out`.
    pub(crate) fn push(&mut self, packet: &TsPacket<'_>, raw: &[u8], out: &mut Vec<Bytes>) {
        if let Mode::Raw = self.mode {
            out.push(Bytes::copy_from_slice(raw));
            return;
        }

        let header = &packet.header;
        if header.transport_error || header.scrambling_control != 0 {
            return;
        }
        match self.continuity(packet) {
            Continuity::Next => {}
            Continuity::Duplicate => return,
            Continuity::Lost => {
                debug!("pid {:#06x}: continuity lost, dropping partial unit", header.pid);
                match &mut self.mode {
                    Mode::Section(section) => section.reset(),
                    Mode::Pes(pes) => pes.reset(),
                    Mode::Raw => {}
                }
            }
        }
        if packet.payload.is_empty() {
            return;
        }

        match &mut self.mode {
            Mode::Section(section) => section.push(packet.payload, header.payload_unit_start, out),
            Mode::Pes(pes) => pes.push(packet.payload, header.payload_unit_start, out),
            Mode::Raw => {}
        }
    }

    fn continuity(&mut self, packet: &TsPacket<'_>) -> Continuity {
        // The counter only advances on packets carrying payload
        if !packet.header.contains_payload {
            return Continuity::Next;
        }
        let cc = packet.header.continuity_counter;
        let previous = self.last_cc.replace(cc);
        match previous {
            None => Continuity::Next,
            Some(_) if packet.discontinuity() => Continuity::Next,
            Some(last) if last == cc => Continuity::Duplicate,
            Some(last) if (last + 1) & 0x0f == cc => Continuity::Next,
            Some(_) => Continuity::Lost,
        }
    }
}

#[derive(Debug)]
struct SectionAssembler {
    buf: BytesMut,
    /// A payload_unit_start has been seen since the last loss
    synced: bool,
    crc: Option<Crc32Mpeg2>,
}

impl SectionAssembler {
    fn new(check_crc: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            synced: false,
            crc: check_crc.then(Crc32Mpeg2::new),
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.synced = false;
    }

    fn push(&mut self, payload: &[u8], unit_start: bool, out: &mut Vec<Bytes>) {
        if !unit_start {
            if self.synced {
                self.append(payload, out);
            }
            return;
        }

        let pointer = payload[0] as usize;
        let rest = &payload[1..];
        if pointer > rest.len() {
            debug!("pointer_field {} past payload end", pointer);
            self.reset();
            return;
        }
        // Bytes before the pointer finish the previous section
        if self.synced && !self.buf.is_empty() {
            self.append(&rest[..pointer], out);
        }
        self.buf.clear();
        self.synced = true;
        self.append(&rest[pointer..], out);
    }

    fn append(&mut self, data: &[u8], out: &mut Vec<Bytes>) {
        self.buf.extend_from_slice(data);
        while let Some(&table_id) = self.buf.first() {
            if table_id == TABLE_ID_STUFFING {
                self.reset();
                return;
            }
            let Some(total) = section_total_len(&self.buf) else {
                return;
            };
            if total > MAX_SECTION_SIZE {
                debug!("section of {} bytes exceeds the maximum, resyncing", total);
                self.reset();
                return;
            }
            if self.buf.len() < total {
                return;
            }

            let section = self.buf.split_to(total).freeze();
            let long_form = section[1] & 0x80 != 0;
            if let Some(crc) = &self.crc {
                if long_form && !crc.verify(&section) {
                    warn!("dropping section with table_id {:#04x}: CRC mismatch", table_id);
                    continue;
                }
            }
            out.push(section);
        }
    }
}

#[derive(Debug, Default)]
struct PesAssembler {
    buf: BytesMut,
    /// Started on a payload_unit_start
    active: bool,
    /// Whole packet size once the header is in; `Some(None)` for unbounded packets
    expected: Option<Option<usize>>,
}

impl PesAssembler {
    fn reset(&mut self) {
        self.buf.clear();
        self.active = false;
        self.expected = None;
    }

    fn push(&mut self, payload: &[u8], unit_start: bool, out: &mut Vec<Bytes>) {
        if unit_start {
            if self.active && !self.buf.is_empty() {
                match self.expected {
                    Some(None) => out.push(self.buf.split().freeze()),
                    _ => debug!("dropping truncated PES packet of {} bytes", self.buf.len()),
                }
            }
            self.reset();
            self.active = true;
        }
        if !self.active {
            return;
        }

        self.buf.extend_from_slice(payload);
        if self.expected.is_none() && self.buf.len() >= PES_FIXED_HEADER_SIZE {
            let start_code = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]);
            if start_code != PES_START_CODE {
                debug!("payload unit without PES start code");
                self.reset();
                return;
            }
            let length = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
            self.expected = Some((length > 0).then_some(PES_FIXED_HEADER_SIZE + length));
        }

        if let Some(Some(total)) = self.expected {
            if self.buf.len() >= total {
                out.push(self.buf.split_to(total).freeze());
                // Anything after a bounded packet is stuffing
                self.reset();
            }
        }
    }
}
