use super::descriptor::{FilterId, FilterKind, FilterMetadata};
use super::poller::Poller;
use super::registry::{FilterEntry, Shared};
use crate::config::Config;
use crate::error::TsError;
use crate::format::ts::{PesHeader, SectionHeader};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(super) struct ReactorSettings {
    pub poll_timeout: Duration,
    pub max_events: usize,
}

impl ReactorSettings {
    pub(super) fn from_config(config: &Config) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            max_events: config.max_events_per_poll.max(1),
        }
    }
}

/// Reusable read buffer and delivery counter of one filter
struct Slot {
    buf: Vec<u8>,
    sequence: u64,
}

/// Clears the in-flight mark even if the consumer panics
struct InflightGuard<'a>(&'a Shared);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Reactor thread body: wait, read each ready filter once, deliver, repeat.
pub(super) fn run(shared: Arc<Shared>, poller: Arc<Poller>, settings: ReactorSettings) {
    shared.set_reactor_thread(Some(thread::current().id()));
    info!("reactor started");

    let mut events = Vec::with_capacity(settings.max_events);
    let mut slots: HashMap<FilterId, Slot> = HashMap::new();
    while !shared.stop_requested() {
        events.clear();
        match poller.poll(&mut events, settings.max_events, settings.poll_timeout) {
            Ok(_) => {}
            Err(e) => {
                error!("reactor terminated: {}", e);
                shared.set_fatal(match e {
                    TsError::ReactorFatal(reason) => reason,
                    other => other.to_string(),
                });
                break;
            }
        }

        for (i, event) in events.iter().enumerate() {
            if shared.stop_requested() {
                // Handled by the next run
                events[i..].iter().for_each(|event| poller.requeue(*event));
                break;
            }
            // Removed since the event was raised
            let Some(entry) = shared.begin(event.token) else {
                continue;
            };
            let _inflight = InflightGuard(&shared);
            deliver(&shared, &entry, &mut slots);
        }
        prune_slots(&shared, &mut slots);
    }

    shared.set_reactor_thread(None);
    info!("reactor stopped");
}

/// Frees the read buffers of filters removed since the last pass.
fn prune_slots(shared: &Shared, slots: &mut HashMap<FilterId, Slot>) {
    if slots.is_empty() {
        return;
    }
    let table = shared.table.lock();
    slots.retain(|id, _| table.contains(*id));
}

fn deliver(shared: &Shared, entry: &FilterEntry, slots: &mut HashMap<FilterId, Slot>) {
    let slot = slots.entry(entry.id).or_insert_with(|| Slot {
        buf: vec![0u8; entry.buffer_size],
        sequence: 0,
    });

    let len = match shared.provider.read(entry.resource, &mut slot.buf) {
        Ok(0) => return,
        Ok(len) => len,
        Err(e) => {
            warn!("{} on pid {:#06x}: read failed: {}", entry.id, entry.pid, e);
            return;
        }
    };

    let payload = &slot.buf[..len];
    let meta = describe(entry.kind, payload, slot.sequence);
    slot.sequence += 1;
    shared.consumer.on_filter_data(entry.pid, payload, &meta);
}

/// Derives the metadata delivered with `payload`.
pub(super) fn describe(kind: FilterKind, payload: &[u8], sequence: u64) -> FilterMetadata {
    let mut meta = FilterMetadata {
        sequence,
        ..Default::default()
    };
    match kind {
        FilterKind::Section => {
            meta.table_id = payload.first().copied();
            match SectionHeader::parse(payload) {
                Ok(header) if header.section_syntax_indicator => {
                    meta.version = Some(header.version_number);
                    meta.current_next = Some(header.current_next_indicator);
                }
                Ok(_) => {}
                Err(e) => debug!("no long section header in {} bytes: {}", payload.len(), e),
            }
        }
        FilterKind::Audio | FilterKind::Video => match PesHeader::parse(payload) {
            Ok(header) => {
                meta.stream_id = Some(header.stream_id);
                meta.pts = header.pts;
                meta.dts = header.dts;
            }
            Err(e) => debug!("unparsable PES header: {}", e),
        },
        FilterKind::Unspecified => {}
    }
    meta
}
