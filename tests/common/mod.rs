#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use tsplane::config::Config;
use tsplane::format::ts::{PesHeader, TsHeader, TS_PACKET_SIZE, TS_PAYLOAD_SIZE};
use tsplane::utils::Crc32Mpeg2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fast_config() -> Config {
    Config {
        poll_timeout_ms: 10,
        ..Config::default()
    }
}

/// Long-form section with a valid CRC_32
pub fn section(table_id: u8, version: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut data = vec![
        table_id,
        0xb0 | (section_length >> 8) as u8,
        section_length as u8,
        0x00,
        0x01,
        0xc1 | (version & 0x1f) << 1,
        0x00,
        0x00,
    ];
    data.extend_from_slice(body);
    let crc = Crc32Mpeg2::new().calculate(&data);
    data.extend_from_slice(&crc.to_be_bytes());
    data
}

fn packet(pid: u16, unit_start: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    let header = TsHeader {
        payload_unit_start: unit_start,
        pid,
        continuity_counter: cc & 0x0f,
        ..Default::default()
    };
    let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
    header.write_to(&mut buf);
    buf.put_slice(payload);
    buf.resize(TS_PACKET_SIZE, 0xff);
    buf.to_vec()
}

/// One packet carrying a whole section after a zero pointer_field
pub fn section_packet(pid: u16, cc: u8, section: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8];
    payload.extend_from_slice(section);
    packet(pid, true, cc, &payload)
}

pub fn raw_packet(pid: u16, cc: u8, fill: u8) -> Vec<u8> {
    packet(pid, false, cc, &[fill; TS_PAYLOAD_SIZE])
}

/// A bounded PES packet split over as many TS packets as it needs
pub fn pes_packets(pid: u16, stream_id: u8, pts: u64, body: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut header = PesHeader::new(stream_id).with_pts(pts);
    let mut pes = BytesMut::new();
    header.packet_length = (header.len() - 6 + body.len()) as u16;
    header.write_to(&mut pes);
    pes.put_slice(body);

    let stream = pes
        .chunks(TS_PAYLOAD_SIZE)
        .enumerate()
        .flat_map(|(i, chunk)| packet(pid, i == 0, i as u8, chunk))
        .collect();
    (pes.to_vec(), stream)
}
