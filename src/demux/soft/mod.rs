//! Memory-fed transport provider.
//!
//! Bytes written to a source land in an input [`RingBuffer`]; whole packets are then
//! routed to the running filters of their PID and assembled into units. A packet is
//! only taken out of the input once every filter it goes to has room, so a slow
//! consumer back-pressures the writer instead of losing data.

mod assembler;

use self::assembler::Assembler;
use super::descriptor::{FilterDescriptor, FilterFlags};
use super::poller::Readiness;
use super::provider::{ResourceHandle, SourceHandle, TransportProvider};
use crate::config::{self, Config};
use crate::error::{Result, TsError};
use crate::format::ts::{TsPacket, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::utils::RingBuffer;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;

/// Software demultiplexer behind memory-fed sources.
pub struct SoftDemux {
    config: Config,
    inner: Mutex<SoftState>,
}

#[derive(Default)]
struct SoftState {
    next_source: u32,
    next_resource: u32,
    sources: HashMap<SourceHandle, Sink>,
    resources: HashMap<ResourceHandle, Resource>,
}

struct Sink {
    name: String,
    input: RingBuffer,
    resynced_bytes: u64,
}

struct Resource {
    source: SourceHandle,
    descriptor: FilterDescriptor,
    budget: usize,
    queue: VecDeque<Bytes>,
    queued: usize,
    assembler: Assembler,
    readiness: Option<Readiness>,
    running: bool,
    overflowed: bool,
}

impl Resource {
    fn drop_queue(&mut self) {
        self.queue.clear();
        self.queued = 0;
        self.assembler.reset();
    }

    /// Whether one more packet could push the queue past its budget
    fn is_full(&self) -> bool {
        !self.queue.is_empty() && self.queued + self.assembler.pending() + TS_PACKET_SIZE > self.budget
    }

    fn signal_readable(&self) {
        if let Some(readiness) = &self.readiness {
            readiness.notify_readable();
        }
    }
}

impl SoftState {
    /// Moves packets from the input of `source` into its filter queues until the input
    /// runs dry or a target queue is full.
    fn pump(&mut self, source: SourceHandle) {
        let Some(sink) = self.sources.get_mut(&source) else {
            return;
        };
        let mut packet = [0u8; TS_PACKET_SIZE];
        while sink.input.peek(&mut packet) == TS_PACKET_SIZE {
            if packet[0] != TS_SYNC_BYTE {
                let skip = packet[1..]
                    .iter()
                    .position(|&b| b == TS_SYNC_BYTE)
                    .map_or(TS_PACKET_SIZE, |pos| pos + 1);
                sink.input.skip(skip);
                sink.resynced_bytes += skip as u64;
                debug!("{}: lost sync, skipped {} bytes", sink.name, skip);
                continue;
            }

            let parsed = match TsPacket::parse(&packet) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("{}: dropping packet: {}", sink.name, e);
                    sink.input.skip(TS_PACKET_SIZE);
                    continue;
                }
            };

            let pid = parsed.pid();
            let targets: Vec<&mut Resource> = self
                .resources
                .values_mut()
                .filter(|r| r.source == source && r.running && r.descriptor.pid == pid)
                .collect();
            if targets.iter().any(|r| r.is_full()) {
                break;
            }

            for resource in targets {
                route(resource, &parsed, &packet);
            }
            sink.input.skip(TS_PACKET_SIZE);
        }
    }
}

fn route(resource: &mut Resource, packet: &TsPacket<'_>, raw: &[u8]) {
    let mut units = Vec::new();
    resource.assembler.push(packet, raw, &mut units);

    let too_large = resource.assembler.pending() > resource.budget
        || units.iter().any(|unit| unit.len() > resource.budget);
    if too_large {
        warn!(
            "pid {:#06x}: unit exceeds the {} byte filter buffer, dropping queue",
            resource.descriptor.pid, resource.budget
        );
        resource.drop_queue();
        resource.overflowed = true;
        if let Some(readiness) = &resource.readiness {
            readiness.notify_error();
        }
        return;
    }

    if units.is_empty() {
        return;
    }
    let oneshot = resource.descriptor.flags.contains(FilterFlags::ONESHOT);
    for unit in units {
        if oneshot && !resource.queue.is_empty() {
            break;
        }
        resource.queued += unit.len();
        resource.queue.push_back(unit);
    }
    resource.signal_readable();
}

impl SoftDemux {
    pub fn new() -> Self {
        Self::with_config(&config::current())
    }

    /// Uses `input_buffer_size` for source inputs and the per-kind sizes as initial
    /// filter budgets.
    pub fn with_config(config: &Config) -> Self {
        Self {
            config: config.clone(),
            inner: Mutex::new(SoftState::default()),
        }
    }

    /// Unread input bytes of `source`
    pub fn input_len(&self, source: SourceHandle) -> usize {
        self.inner
            .lock()
            .sources
            .get(&source)
            .map_or(0, |sink| sink.input.len())
    }

    /// Bytes discarded while hunting for the sync byte
    pub fn resynced_bytes(&self, source: SourceHandle) -> u64 {
        self.inner
            .lock()
            .sources
            .get(&source)
            .map_or(0, |sink| sink.resynced_bytes)
    }

    /// Simulates loss of the device behind `source`: its readiness multiplexer fails.
    pub fn disconnect(&self, source: SourceHandle) {
        let state = self.inner.lock();
        let readiness = state
            .resources
            .values()
            .filter(|r| r.source == source)
            .find_map(|r| r.readiness.as_ref());
        match readiness {
            Some(readiness) => readiness.fail(format!("{:?} disconnected", source)),
            None => debug!("disconnect: {:?} has no attached filters", source),
        }
    }
}

impl Default for SoftDemux {
    fn default() -> Self {
        Self::with_config(&Config::default())
    }
}

impl TransportProvider for SoftDemux {
    fn open_source(&self, source_id: &str) -> Result<SourceHandle> {
        let mut state = self.inner.lock();
        let handle = SourceHandle(state.next_source);
        state.next_source = state.next_source.wrapping_add(1);
        let input = RingBuffer::new(self.config.input_buffer_size);
        info!("{}: memory source with {} byte input", source_id, input.capacity());
        state.sources.insert(
            handle,
            Sink {
                name: source_id.to_string(),
                input,
                resynced_bytes: 0,
            },
        );
        Ok(handle)
    }

    fn close_source(&self, source: SourceHandle) {
        let mut state = self.inner.lock();
        if state.sources.remove(&source).is_none() {
            debug!("close_source: unknown {:?}", source);
        }
        state.resources.retain(|_, r| r.source != source);
    }

    fn configure_filter(&self, source: SourceHandle, descriptor: &FilterDescriptor) -> Result<ResourceHandle> {
        descriptor.validate()?;
        let mut state = self.inner.lock();
        if !state.sources.contains_key(&source) {
            return Err(TsError::Resource(format!("{:?} is not open", source)));
        }
        let handle = ResourceHandle(state.next_resource);
        state.next_resource = state.next_resource.wrapping_add(1);
        state.resources.insert(
            handle,
            Resource {
                source,
                descriptor: *descriptor,
                budget: self.config.buffer_size_for(descriptor.kind),
                queue: VecDeque::new(),
                queued: 0,
                assembler: Assembler::new(
                    descriptor.kind,
                    descriptor.flags.contains(FilterFlags::CHECK_CRC),
                ),
                readiness: None,
                running: false,
                overflowed: false,
            },
        );
        Ok(handle)
    }

    fn set_buffer_size(&self, resource: ResourceHandle, size: usize) -> Result<()> {
        if size < TS_PACKET_SIZE {
            return Err(TsError::InvalidArgument(format!(
                "filter buffer of {} bytes cannot hold a packet",
                size
            )));
        }
        let mut state = self.inner.lock();
        let r = resource_mut(&mut state, resource)?;
        r.budget = size;
        let source = r.source;
        state.pump(source);
        Ok(())
    }

    fn attach_readiness(&self, resource: ResourceHandle, readiness: Readiness) -> Result<()> {
        let mut state = self.inner.lock();
        let r = resource_mut(&mut state, resource)?;
        if !r.queue.is_empty() {
            readiness.notify_readable();
        }
        r.readiness = Some(readiness);
        Ok(())
    }

    fn start_resource(&self, resource: ResourceHandle) -> Result<()> {
        let mut state = self.inner.lock();
        let r = resource_mut(&mut state, resource)?;
        if !r.running {
            r.assembler.reset();
            r.overflowed = false;
            r.running = true;
        }
        let source = r.source;
        state.pump(source);
        Ok(())
    }

    fn stop_resource(&self, resource: ResourceHandle) -> Result<()> {
        let mut state = self.inner.lock();
        let r = resource_mut(&mut state, resource)?;
        r.running = false;
        r.drop_queue();
        let source = r.source;
        // A stopped filter no longer holds the input back
        state.pump(source);
        Ok(())
    }

    fn release_resource(&self, resource: ResourceHandle) {
        let mut state = self.inner.lock();
        match state.resources.remove(&resource) {
            Some(r) => state.pump(r.source),
            None => debug!("release_resource: unknown {}", resource),
        }
    }

    fn read(&self, resource: ResourceHandle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.inner.lock();
        let r = resource_mut(&mut state, resource)?;
        let result = take_unit(r, buf);
        let source = r.source;
        state.pump(source);
        result
    }

    fn write(&self, source: SourceHandle, data: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock();
        let Some(sink) = state.sources.get(&source) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:?} is not open", source),
            ));
        };
        let written = sink.input.put(data);
        state.pump(source);
        Ok(written)
    }
}

fn resource_mut(state: &mut SoftState, resource: ResourceHandle) -> Result<&mut Resource> {
    state
        .resources
        .get_mut(&resource)
        .ok_or(TsError::UnknownResource(resource.0))
}

/// Pops one unit of `r` into `buf`.
fn take_unit(r: &mut Resource, buf: &mut [u8]) -> Result<usize> {
    let pid = r.descriptor.pid;
    if r.overflowed {
        r.overflowed = false;
        return Err(TsError::BufferOverflow { pid });
    }
    let Some(unit) = r.queue.pop_front() else {
        return Ok(0);
    };
    r.queued -= unit.len();

    let result = if unit.len() > buf.len() {
        Err(TsError::InvalidArgument(format!(
            "{} byte read buffer cannot hold a {} byte unit of pid {:#06x}",
            buf.len(),
            unit.len(),
            pid
        )))
    } else {
        buf[..unit.len()].copy_from_slice(&unit);
        Ok(unit.len())
    };

    if r.descriptor.flags.contains(FilterFlags::ONESHOT) {
        r.running = false;
        r.drop_queue();
    }
    // Readiness stays raised while data is queued
    if !r.queue.is_empty() {
        r.signal_readable();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{FilterId, FilterKind, Poller};
    use crate::format::ts::{TsHeader, TS_PAYLOAD_SIZE};
    use bytes::{BufMut, BytesMut};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn raw_packet(pid: u16, cc: u8, fill: u8) -> Vec<u8> {
        let header = TsHeader {
            pid,
            continuity_counter: cc,
            ..Default::default()
        };
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        header.write_to(&mut buf);
        buf.put_bytes(fill, TS_PAYLOAD_SIZE);
        buf.to_vec()
    }

    fn small_config() -> Config {
        Config {
            input_buffer_size: 2048,
            ..Config::default()
        }
    }

    fn open_raw(demux: &SoftDemux, pid: u16, budget: usize) -> (SourceHandle, ResourceHandle) {
        let source = demux.open_source("test").unwrap();
        let resource = demux
            .configure_filter(source, &FilterDescriptor::new(pid, FilterKind::Unspecified))
            .unwrap();
        demux.set_buffer_size(resource, budget).unwrap();
        demux.start_resource(resource).unwrap();
        (source, resource)
    }

    #[test]
    fn test_routes_by_pid_and_resyncs() {
        let demux = SoftDemux::with_config(&small_config());
        let (source, resource) = open_raw(&demux, 0x40, TS_PACKET_SIZE * 8);

        let mut stream = vec![0x00, 0x12, 0x34];
        stream.extend(raw_packet(0x40, 0, 0x01));
        stream.extend(raw_packet(0x41, 0, 0x02));
        stream.extend(raw_packet(0x40, 1, 0x03));
        assert_eq!(demux.write(source, &stream).unwrap(), stream.len());
        assert_eq!(demux.resynced_bytes(source), 3);

        let mut buf = [0u8; TS_PACKET_SIZE];
        assert_eq!(demux.read(resource, &mut buf).unwrap(), TS_PACKET_SIZE);
        assert_eq!(buf[4], 0x01);
        assert_eq!(demux.read(resource, &mut buf).unwrap(), TS_PACKET_SIZE);
        assert_eq!(buf[4], 0x03);
        assert_eq!(demux.read(resource, &mut buf).unwrap(), 0);
        assert_eq!(demux.input_len(source), 0);
    }

    #[test]
    fn test_full_queue_back_pressures_input() {
        let demux = SoftDemux::with_config(&small_config());
        let (source, resource) = open_raw(&demux, 0x40, TS_PACKET_SIZE * 2);

        let stream: Vec<u8> = (0..8).flat_map(|cc| raw_packet(0x40, cc, cc)).collect();
        // Two packets queued, the other six held back in the input
        assert_eq!(demux.write(source, &stream).unwrap(), stream.len());
        assert_eq!(demux.input_len(source), TS_PACKET_SIZE * 6);

        let mut buf = [0u8; TS_PACKET_SIZE];
        for cc in 0..8u8 {
            assert_eq!(demux.read(resource, &mut buf).unwrap(), TS_PACKET_SIZE);
            assert_eq!(buf[4], cc);
        }
        assert_eq!(demux.read(resource, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_oversized_unit_overflows() {
        let demux = SoftDemux::with_config(&small_config());
        let source = demux.open_source("test").unwrap();
        let resource = demux
            .configure_filter(source, &FilterDescriptor::video(0x100))
            .unwrap();
        demux.set_buffer_size(resource, TS_PACKET_SIZE).unwrap();
        let poller = Poller::new();
        demux
            .attach_readiness(resource, poller.register(FilterId(9)).unwrap())
            .unwrap();
        demux.start_resource(resource).unwrap();

        let mut first = raw_packet(0x100, 0, 0x11);
        first[1] |= 0x40;
        first[4..10].copy_from_slice(&[0x00, 0x00, 0x01, 0xe0, 0x00, 0x00]);
        let mut stream = first;
        stream.extend(raw_packet(0x100, 1, 0x22));
        demux.write(source, &stream).unwrap();

        let mut events = Vec::new();
        poller.poll(&mut events, 4, Duration::ZERO).unwrap();
        assert!(events[0].error);
        let mut buf = vec![0u8; TS_PACKET_SIZE];
        assert!(matches!(
            demux.read(resource, &mut buf),
            Err(TsError::BufferOverflow { pid: 0x100 })
        ));
        assert_eq!(demux.read(resource, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_oneshot_stops_after_first_unit() {
        let demux = SoftDemux::with_config(&small_config());
        let source = demux.open_source("test").unwrap();
        let descriptor = FilterDescriptor::new(0x40, FilterKind::Unspecified).with_flags(FilterFlags::ONESHOT);
        let resource = demux.configure_filter(source, &descriptor).unwrap();
        demux.start_resource(resource).unwrap();

        let stream: Vec<u8> = (0..3).flat_map(|cc| raw_packet(0x40, cc, cc)).collect();
        demux.write(source, &stream).unwrap();
        let mut buf = [0u8; TS_PACKET_SIZE];
        assert_eq!(demux.read(resource, &mut buf).unwrap(), TS_PACKET_SIZE);
        assert_eq!(demux.read(resource, &mut buf).unwrap(), 0);
        assert_eq!(demux.input_len(source), 0);
    }

    #[test]
    fn test_stop_and_release_unblock_input() {
        let demux = SoftDemux::with_config(&small_config());
        let (source, resource) = open_raw(&demux, 0x40, TS_PACKET_SIZE);
        let stream: Vec<u8> = (0..3).flat_map(|cc| raw_packet(0x40, cc, cc)).collect();
        demux.write(source, &stream).unwrap();
        assert_eq!(demux.input_len(source), TS_PACKET_SIZE * 2);

        demux.stop_resource(resource).unwrap();
        assert_eq!(demux.input_len(source), 0);
        let mut buf = [0u8; TS_PACKET_SIZE];
        assert_eq!(demux.read(resource, &mut buf).unwrap(), 0);

        demux.release_resource(resource);
        assert!(matches!(
            demux.read(resource, &mut buf),
            Err(TsError::UnknownResource(_))
        ));
        assert!(demux.write(SourceHandle(77), &stream).is_err());
        assert!(demux.set_buffer_size(resource, 4096).is_err());
    }
}
