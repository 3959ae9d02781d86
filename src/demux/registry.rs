use super::descriptor::{FilterDescriptor, FilterId, FilterKind};
use super::poller::Poller;
use super::provider::{ResourceHandle, SourceHandle, TransportProvider};
use super::reactor::{self, ReactorSettings};
use super::{FilterConsumer, SourceState};
use crate::config::{self, Config};
use crate::error::{Result, TsError};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// One active filter as the reactor sees it
#[derive(Debug, Clone, Copy)]
pub(super) struct FilterEntry {
    pub id: FilterId,
    pub pid: u16,
    pub kind: FilterKind,
    pub resource: ResourceHandle,
    pub buffer_size: usize,
}

#[derive(Default)]
pub(super) struct FilterTable {
    by_pid: HashMap<u16, FilterEntry>,
    by_id: HashMap<FilterId, u16>,
    /// Filter whose read/callback step runs on the reactor right now
    inflight: Option<FilterId>,
}

impl FilterTable {
    pub(super) fn contains(&self, id: FilterId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub(super) fn insert(&mut self, entry: FilterEntry) {
        self.by_id.insert(entry.id, entry.pid);
        self.by_pid.insert(entry.pid, entry);
    }

    fn remove_id(&mut self, id: FilterId) -> Option<FilterEntry> {
        let pid = self.by_id.remove(&id)?;
        self.by_pid.remove(&pid)
    }
}

/// State shared between the registry and its reactor thread
pub(super) struct Shared {
    pub provider: Arc<dyn TransportProvider>,
    pub consumer: Arc<dyn FilterConsumer>,
    pub table: Mutex<FilterTable>,
    idle: Condvar,
    stop: Mutex<bool>,
    fatal: Mutex<Option<String>>,
    reactor_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    pub(super) fn new(provider: Arc<dyn TransportProvider>, consumer: Arc<dyn FilterConsumer>) -> Self {
        Self {
            provider,
            consumer,
            table: Mutex::new(FilterTable::default()),
            idle: Condvar::new(),
            stop: Mutex::new(false),
            fatal: Mutex::new(None),
            reactor_thread: Mutex::new(None),
        }
    }

    pub(super) fn stop_requested(&self) -> bool {
        *self.stop.lock()
    }

    pub(super) fn set_fatal(&self, reason: String) {
        *self.fatal.lock() = Some(reason);
    }

    pub(super) fn set_reactor_thread(&self, id: Option<ThreadId>) {
        *self.reactor_thread.lock() = id;
    }

    fn on_reactor_thread(&self) -> bool {
        *self.reactor_thread.lock() == Some(thread::current().id())
    }

    /// Resolves a readiness token and marks the filter in flight.
    pub(super) fn begin(&self, id: FilterId) -> Option<FilterEntry> {
        let mut table = self.table.lock();
        let pid = *table.by_id.get(&id)?;
        let entry = *table.by_pid.get(&pid)?;
        table.inflight = Some(id);
        Some(entry)
    }

    pub(super) fn finish(&self) {
        self.table.lock().inflight = None;
        self.idle.notify_all();
    }
}

struct Control {
    state: SourceState,
    source: Option<SourceHandle>,
    poller: Arc<Poller>,
    reactor: Option<JoinHandle<()>>,
    next_id: u32,
}

/// The filters of one stream source and the reactor thread delivering their data.
///
/// Lifecycle is `Closed -> Opened -> Started -> Opened -> Closed`. Filters may be
/// added and removed while `Opened` or `Started`, from any thread, including from a
/// [`FilterConsumer`] callback. `stop` and `close` must not be called from a callback:
/// they join the reactor thread, which is the thread running the callback.
pub struct FilterRegistry {
    shared: Arc<Shared>,
    config: Config,
    /// Serializes open/start/stop/close, held across the reactor join
    lifecycle: Mutex<()>,
    control: Mutex<Control>,
}

impl FilterRegistry {
    /// Creates a closed registry using the process-wide configuration.
    pub fn new(provider: Arc<dyn TransportProvider>, consumer: Arc<dyn FilterConsumer>) -> Self {
        Self::with_config(provider, consumer, config::current())
    }

    pub fn with_config(
        provider: Arc<dyn TransportProvider>,
        consumer: Arc<dyn FilterConsumer>,
        config: Config,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(provider, consumer)),
            config,
            lifecycle: Mutex::new(()),
            control: Mutex::new(Control {
                state: SourceState::Closed,
                source: None,
                poller: Poller::new(),
                reactor: None,
                next_id: 0,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SourceState {
        self.state_of(&self.control.lock())
    }

    /// The multiplexer error that ended the reactor, if any.
    pub fn fatal_error(&self) -> Option<TsError> {
        self.shared.fatal.lock().clone().map(TsError::ReactorFatal)
    }

    /// Opens `source_id` on the provider. No thread runs until [`start`](Self::start).
    pub fn open(&self, source_id: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let mut control = self.control.lock();
        if control.state != SourceState::Closed {
            return Err(TsError::InvalidState {
                operation: "open",
                state: control.state,
            });
        }

        let source = self.shared.provider.open_source(source_id)?;
        control.source = Some(source);
        control.poller = Poller::new();
        control.state = SourceState::Opened;
        *self.shared.fatal.lock() = None;
        info!("opened source {:?} as {:?}", source_id, source);
        Ok(())
    }

    /// Spawns the reactor thread.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let mut control = self.control.lock();
        if control.state != SourceState::Opened {
            return Err(TsError::InvalidState {
                operation: "start",
                state: control.state,
            });
        }

        *self.shared.stop.lock() = false;
        let shared = Arc::clone(&self.shared);
        let poller = Arc::clone(&control.poller);
        let settings = ReactorSettings::from_config(&self.config);
        let handle = thread::Builder::new()
            .name("tsplane-reactor".into())
            .spawn(move || reactor::run(shared, poller, settings))
            .map_err(|e| TsError::Resource(format!("cannot spawn reactor thread: {}", e)))?;

        control.reactor = Some(handle);
        control.state = SourceState::Started;
        Ok(())
    }

    /// Stops and joins the reactor. No callback runs once this returns.
    ///
    /// A no-op when no reactor is running.
    pub fn stop(&self) -> Result<()> {
        if self.shared.on_reactor_thread() {
            return Err(TsError::InvalidState {
                operation: "stop from a filter callback",
                state: self.state(),
            });
        }
        let _lifecycle = self.lifecycle.lock();
        self.stop_reactor();
        Ok(())
    }

    fn stop_reactor(&self) {
        let (handle, poller) = {
            let mut control = self.control.lock();
            if control.state != SourceState::Started {
                debug!("stop: no reactor running ({:?})", control.state);
                return;
            }
            (control.reactor.take(), Arc::clone(&control.poller))
        };

        *self.shared.stop.lock() = true;
        poller.wake();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("reactor thread panicked");
            }
        }

        let mut control = self.control.lock();
        control.state = if self.shared.fatal.lock().is_some() {
            SourceState::Failed
        } else {
            SourceState::Opened
        };
    }

    /// Stops the reactor, releases every filter and closes the source.
    pub fn close(&self) -> Result<()> {
        if self.shared.on_reactor_thread() {
            return Err(TsError::InvalidState {
                operation: "close from a filter callback",
                state: self.state(),
            });
        }
        let _lifecycle = self.lifecycle.lock();
        self.stop_reactor();
        self.release_all();
        Ok(())
    }

    /// Asks the reactor to exit without joining it; used when the registry is dropped
    /// from one of its own callbacks.
    fn detach_reactor(&self) {
        let mut control = self.control.lock();
        drop(control.reactor.take());
        *self.shared.stop.lock() = true;
        control.poller.wake();
    }

    fn release_all(&self) {
        let mut control = self.control.lock();
        let Some(source) = control.source.take() else {
            return;
        };
        let entries: Vec<FilterEntry> = {
            let mut table = self.shared.table.lock();
            table.by_id.clear();
            table.by_pid.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            control.poller.deregister(entry.id);
            self.release(entry);
        }
        self.shared.provider.close_source(source);
        control.state = SourceState::Closed;
        info!("closed {:?}, released {} filters", source, entries.len());
    }

    /// Opens, sizes, registers and starts a filter for `descriptor.pid`.
    ///
    /// Fails with `FilterExists` while the pid has an active filter. A failing step
    /// undoes the earlier ones, leaving nothing registered.
    pub fn add_filter(&self, descriptor: FilterDescriptor) -> Result<FilterId> {
        descriptor.validate()?;
        let mut control = self.control.lock();
        let state = self.state_of(&control);
        let source = match (state, control.source) {
            (SourceState::Opened | SourceState::Started, Some(source)) => source,
            _ => {
                return Err(TsError::InvalidState {
                    operation: "add a filter",
                    state,
                })
            }
        };

        if self.shared.table.lock().by_pid.contains_key(&descriptor.pid) {
            warn!("add_filter: pid {:#06x} already has an active filter", descriptor.pid);
            return Err(TsError::FilterExists { pid: descriptor.pid });
        }

        let id = FilterId(control.next_id);
        control.next_id = control.next_id.wrapping_add(1);
        let resource = self.shared.provider.configure_filter(source, &descriptor)?;
        let entry = FilterEntry {
            id,
            pid: descriptor.pid,
            kind: descriptor.kind,
            resource,
            buffer_size: self.config.buffer_size_for(descriptor.kind),
        };

        if let Err(e) = self.install(&control.poller, entry) {
            warn!("add_filter: rolling back pid {:#06x}: {}", descriptor.pid, e);
            self.shared.table.lock().remove_id(id);
            control.poller.deregister(id);
            self.shared.provider.release_resource(resource);
            return Err(e);
        }

        debug!(
            "{} on pid {:#06x} ({:?}, {} byte buffer) as {}",
            id, descriptor.pid, descriptor.kind, entry.buffer_size, resource
        );
        Ok(id)
    }

    fn install(&self, poller: &Arc<Poller>, entry: FilterEntry) -> Result<()> {
        let provider = &self.shared.provider;
        provider.set_buffer_size(entry.resource, entry.buffer_size)?;
        let readiness = poller.register(entry.id)?;
        provider.attach_readiness(entry.resource, readiness)?;
        self.shared.table.lock().insert(entry);
        provider.start_resource(entry.resource)
    }

    /// Unregisters and releases the filter of `pid`.
    ///
    /// Returns false, touching nothing, when the pid has no active filter. Waits for a
    /// running callback of this filter unless called from that callback.
    pub fn remove_filter(&self, pid: u16) -> bool {
        let poller = Arc::clone(&self.control.lock().poller);
        let on_reactor = self.shared.on_reactor_thread();

        let entry = {
            let mut table = self.shared.table.lock();
            let Some(entry) = table.by_pid.remove(&pid) else {
                drop(table);
                warn!("remove_filter: no active filter for pid {:#06x}", pid);
                return false;
            };
            table.by_id.remove(&entry.id);
            while !on_reactor && table.inflight == Some(entry.id) {
                self.shared.idle.wait(&mut table);
            }
            entry
        };

        poller.deregister(entry.id);
        self.release(&entry);
        debug!("removed {} from pid {:#06x}", entry.id, pid);
        true
    }

    fn release(&self, entry: &FilterEntry) {
        if let Err(e) = self.shared.provider.stop_resource(entry.resource) {
            warn!("stopping {} of pid {:#06x} failed: {}", entry.resource, entry.pid, e);
        }
        self.shared.provider.release_resource(entry.resource);
    }

    pub fn has_filter(&self, pid: u16) -> bool {
        self.shared.table.lock().by_pid.contains_key(&pid)
    }

    pub fn filter_id(&self, pid: u16) -> Option<FilterId> {
        self.shared.table.lock().by_pid.get(&pid).map(|entry| entry.id)
    }

    pub fn filter_count(&self) -> usize {
        self.shared.table.lock().by_pid.len()
    }

    /// Pushes transport stream bytes into a memory-fed source.
    ///
    /// Interrupted writes are retried up to `feed_retry_limit` times. Returns the bytes
    /// accepted, which is short under back-pressure; the caller re-submits the rest.
    pub fn feed_ts(&self, data: &[u8]) -> Result<usize> {
        let source = {
            let control = self.control.lock();
            match control.source {
                Some(source) => source,
                None => {
                    return Err(TsError::InvalidState {
                        operation: "feed",
                        state: control.state,
                    })
                }
            }
        };

        let mut total = 0;
        let mut retries = 0;
        while total < data.len() {
            match self.shared.provider.write(source, &data[total..]) {
                Ok(0) => break,
                Ok(written) => {
                    total += written;
                    retries = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    retries += 1;
                    if retries > self.config.feed_retry_limit {
                        warn!("feed_ts: giving up after {} interrupted writes", retries - 1);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if total == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("feed_ts: write failed after {} bytes: {}", total, e);
                    break;
                }
            }
        }
        Ok(total)
    }

    fn state_of(&self, control: &Control) -> SourceState {
        if control.state == SourceState::Started && self.shared.fatal.lock().is_some() {
            SourceState::Failed
        } else {
            control.state
        }
    }
}

impl Drop for FilterRegistry {
    fn drop(&mut self) {
        if self.shared.on_reactor_thread() {
            // The reactor exits once the running callback returns
            debug!("registry dropped from a filter callback, detaching reactor");
            self.detach_reactor();
            self.release_all();
            return;
        }
        if let Err(e) = self.close() {
            warn!("closing registry on drop failed: {}", e);
        }
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("state", &self.state())
            .field("filters", &self.filter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{FilterMetadata, Readiness, SoftDemux};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            poll_timeout_ms: 10,
            ..Config::default()
        }
    }

    fn ignore() -> Arc<dyn FilterConsumer> {
        Arc::new(|_: u16, _: &[u8], _: &FilterMetadata| {})
    }

    /// Delegates to a `SoftDemux` with switchable failures
    #[derive(Default)]
    struct FlakyProvider {
        inner: SoftDemux,
        fail_buffer_size: AtomicBool,
        fail_start: AtomicBool,
        interrupts: AtomicUsize,
        released: AtomicUsize,
        readiness: Mutex<Vec<Readiness>>,
    }

    impl TransportProvider for FlakyProvider {
        fn open_source(&self, source_id: &str) -> Result<SourceHandle> {
            self.inner.open_source(source_id)
        }

        fn close_source(&self, source: SourceHandle) {
            self.inner.close_source(source)
        }

        fn configure_filter(&self, source: SourceHandle, descriptor: &FilterDescriptor) -> Result<ResourceHandle> {
            self.inner.configure_filter(source, descriptor)
        }

        fn set_buffer_size(&self, resource: ResourceHandle, size: usize) -> Result<()> {
            if self.fail_buffer_size.load(Ordering::SeqCst) {
                return Err(TsError::Resource("no buffer memory".into()));
            }
            self.inner.set_buffer_size(resource, size)
        }

        fn attach_readiness(&self, resource: ResourceHandle, readiness: Readiness) -> Result<()> {
            self.readiness.lock().push(readiness.clone());
            self.inner.attach_readiness(resource, readiness)
        }

        fn start_resource(&self, resource: ResourceHandle) -> Result<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(TsError::Resource("filter slots exhausted".into()));
            }
            self.inner.start_resource(resource)
        }

        fn stop_resource(&self, resource: ResourceHandle) -> Result<()> {
            self.inner.stop_resource(resource)
        }

        fn release_resource(&self, resource: ResourceHandle) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.release_resource(resource)
        }

        fn read(&self, resource: ResourceHandle, buf: &mut [u8]) -> Result<usize> {
            self.inner.read(resource, buf)
        }

        fn write(&self, source: SourceHandle, data: &[u8]) -> io::Result<usize> {
            if self.interrupts.load(Ordering::SeqCst) > 0 {
                self.interrupts.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
            }
            self.inner.write(source, data)
        }
    }

    #[test]
    fn test_state_machine() {
        let registry = FilterRegistry::with_config(Arc::new(SoftDemux::new()), ignore(), test_config());
        assert_eq!(registry.state(), SourceState::Closed);
        assert!(matches!(registry.start(), Err(TsError::InvalidState { .. })));
        assert!(registry.add_filter(FilterDescriptor::section(0x10)).is_err());
        assert!(registry.feed_ts(&[0x47]).is_err());

        registry.open("mem").unwrap();
        assert!(matches!(
            registry.open("again"),
            Err(TsError::InvalidState { state: SourceState::Opened, .. })
        ));
        registry.start().unwrap();
        assert_eq!(registry.state(), SourceState::Started);
        assert!(registry.start().is_err());

        registry.stop().unwrap();
        assert_eq!(registry.state(), SourceState::Opened);
        registry.stop().unwrap();

        registry.start().unwrap();
        registry.close().unwrap();
        assert_eq!(registry.state(), SourceState::Closed);
        registry.close().unwrap();
    }

    #[test]
    fn test_duplicate_and_unknown_filters() {
        let provider = Arc::new(FlakyProvider::default());
        let registry = FilterRegistry::with_config(provider.clone(), ignore(), test_config());
        registry.open("mem").unwrap();

        let first = registry.add_filter(FilterDescriptor::section(100)).unwrap();
        assert!(matches!(
            registry.add_filter(FilterDescriptor::video(100)),
            Err(TsError::FilterExists { pid: 100 })
        ));
        assert_eq!(registry.filter_id(100), Some(first));

        assert!(!registry.remove_filter(200));
        assert_eq!(registry.filter_count(), 1);
        assert!(registry.remove_filter(100));
        assert!(!registry.remove_filter(100));
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);

        let second = registry.add_filter(FilterDescriptor::section(100)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_add_filter_rolls_back() {
        let provider = Arc::new(FlakyProvider::default());
        let registry = FilterRegistry::with_config(provider.clone(), ignore(), test_config());
        registry.open("mem").unwrap();

        provider.fail_start.store(true, Ordering::SeqCst);
        assert!(matches!(
            registry.add_filter(FilterDescriptor::audio(0x44)),
            Err(TsError::Resource(_))
        ));
        assert!(!registry.has_filter(0x44));
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);

        provider.fail_start.store(false, Ordering::SeqCst);
        provider.fail_buffer_size.store(true, Ordering::SeqCst);
        assert!(registry.add_filter(FilterDescriptor::audio(0x44)).is_err());
        assert_eq!(provider.released.load(Ordering::SeqCst), 2);

        provider.fail_buffer_size.store(false, Ordering::SeqCst);
        registry.add_filter(FilterDescriptor::audio(0x44)).unwrap();
        assert_eq!(registry.filter_count(), 1);
    }

    #[test]
    fn test_feed_retries_interrupted_writes() {
        let provider = Arc::new(FlakyProvider::default());
        let registry = FilterRegistry::with_config(provider.clone(), ignore(), test_config());
        registry.open("mem").unwrap();

        provider.interrupts.store(3, Ordering::SeqCst);
        assert_eq!(registry.feed_ts(&[0u8; 376]).unwrap(), 376);

        provider.interrupts.store(test_config().feed_retry_limit + 1, Ordering::SeqCst);
        assert_eq!(registry.feed_ts(&[0u8; 188]).unwrap(), 0);
    }

    #[test]
    fn test_multiplexer_failure_is_surfaced() {
        let provider = Arc::new(FlakyProvider::default());
        let registry = FilterRegistry::with_config(provider.clone(), ignore(), test_config());
        registry.open("mem").unwrap();
        registry.add_filter(FilterDescriptor::section(0x12)).unwrap();
        registry.start().unwrap();

        provider.readiness.lock()[0].fail("frontend lost");
        let mut waited = Duration::ZERO;
        while registry.state() != SourceState::Failed && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(registry.state(), SourceState::Failed);
        assert!(matches!(registry.fatal_error(), Some(TsError::ReactorFatal(reason)) if reason == "frontend lost"));
        assert!(registry.add_filter(FilterDescriptor::section(0x13)).is_err());

        registry.stop().unwrap();
        assert_eq!(registry.state(), SourceState::Failed);
        assert!(registry.start().is_err());
        registry.close().unwrap();

        registry.open("mem").unwrap();
        assert!(registry.fatal_error().is_none());
    }

    #[test]
    fn test_remove_filter_from_callback() {
        let (tx, rx) = mpsc::channel();
        let slot: Arc<Mutex<std::sync::Weak<FilterRegistry>>> = Arc::default();
        let registry_slot = Arc::clone(&slot);
        let consumer = Arc::new(move |pid: u16, _: &[u8], _: &FilterMetadata| {
            if let Some(registry) = registry_slot.lock().upgrade() {
                tx.send(registry.remove_filter(pid)).unwrap();
            }
        });
        let registry = Arc::new(FilterRegistry::with_config(
            Arc::new(SoftDemux::new()),
            consumer,
            test_config(),
        ));
        *slot.lock() = Arc::downgrade(&registry);

        registry.open("mem").unwrap();
        registry
            .add_filter(FilterDescriptor::new(0x30, FilterKind::Unspecified))
            .unwrap();
        registry.start().unwrap();
        let mut packet = [0xffu8; 188];
        packet[..4].copy_from_slice(&[0x47, 0x00, 0x30, 0x10]);
        registry.feed_ts(&packet).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), true);
        assert!(!registry.has_filter(0x30));
        registry.stop().unwrap();
    }

    fn raw_packet(pid: u16, cc: u8) -> [u8; 188] {
        let mut packet = [0xffu8; 188];
        packet[..4].copy_from_slice(&[0x47, (pid >> 8) as u8, pid as u8, 0x10 | (cc & 0x0f)]);
        packet
    }

    #[test]
    fn test_stop_and_close_refused_inside_callback() {
        let (tx, rx) = mpsc::channel();
        let slot: Arc<Mutex<std::sync::Weak<FilterRegistry>>> = Arc::default();
        let registry_slot = Arc::clone(&slot);
        let consumer = Arc::new(move |_: u16, _: &[u8], _: &FilterMetadata| {
            if let Some(registry) = registry_slot.lock().upgrade() {
                let states = [registry.stop(), registry.close()].map(|result| match result {
                    Err(TsError::InvalidState { state, .. }) => Some(state),
                    _ => None,
                });
                tx.send(states).unwrap();
            }
        });
        let registry = Arc::new(FilterRegistry::with_config(
            Arc::new(SoftDemux::new()),
            consumer,
            test_config(),
        ));
        *slot.lock() = Arc::downgrade(&registry);

        registry.open("mem").unwrap();
        registry
            .add_filter(FilterDescriptor::new(0x31, FilterKind::Unspecified))
            .unwrap();
        registry.start().unwrap();
        registry.feed_ts(&raw_packet(0x31, 0)).unwrap();

        let states = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(states, [Some(SourceState::Started), Some(SourceState::Started)]);
        assert_eq!(registry.state(), SourceState::Started);
        registry.close().unwrap();
    }

    #[test]
    fn test_drop_inside_callback_shuts_reactor_down() {
        let provider = Arc::new(FlakyProvider::default());
        let delivered = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (dropped_tx, dropped_rx) = mpsc::channel::<()>();
        let dropped_rx = Mutex::new(dropped_rx);
        let slot: Arc<Mutex<std::sync::Weak<FilterRegistry>>> = Arc::default();

        let registry_slot = Arc::clone(&slot);
        let count = Arc::clone(&delivered);
        let consumer = Arc::new(move |_: u16, _: &[u8], _: &FilterMetadata| {
            count.fetch_add(1, Ordering::SeqCst);
            let taken = std::mem::take(&mut *registry_slot.lock());
            if let Some(registry) = taken.upgrade() {
                entered_tx.send(()).unwrap();
                // Hold the last strong reference until the owner has let go
                dropped_rx.lock().recv().unwrap();
                drop(registry);
            }
        });
        let registry = Arc::new(FilterRegistry::with_config(provider.clone(), consumer, test_config()));
        *slot.lock() = Arc::downgrade(&registry);

        registry.open("mem").unwrap();
        registry
            .add_filter(FilterDescriptor::new(0x32, FilterKind::Unspecified))
            .unwrap();
        registry.start().unwrap();
        registry.feed_ts(&raw_packet(0x32, 0)).unwrap();

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(registry);
        dropped_tx.send(()).unwrap();

        let mut waited = Duration::ZERO;
        while provider.released.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
        // The source is closed, so nothing can reach a callback anymore
        assert!(provider.write(SourceHandle(0), &raw_packet(0x32, 1)).is_err());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
