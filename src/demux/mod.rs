//! # PID filtering
//!
//! [`FilterRegistry`] owns the filters of one stream source. Each filter is one
//! resource of a [`TransportProvider`]; its readiness goes through a [`Poller`]
//! drained by a dedicated reactor thread, which reads the resource and hands the
//! payload to the [`FilterConsumer`] together with [`FilterMetadata`].
//!
//! [`SoftDemux`] is the memory-fed provider: bytes pushed with
//! [`FilterRegistry::feed_ts`] are split into sections, PES packets or raw packets.
//!
//! ```rust
//! use std::sync::Arc;
//! use tsplane::demux::{FilterDescriptor, FilterMetadata, FilterRegistry, SoftDemux};
//!
//! # fn main() -> tsplane::Result<()> {
//! let consumer = |pid: u16, payload: &[u8], meta: &FilterMetadata| {
//!     println!("pid {:#x}: {} bytes, version {:?}", pid, payload.len(), meta.version);
//! };
//! let registry = FilterRegistry::new(Arc::new(SoftDemux::new()), Arc::new(consumer));
//! registry.open("memory")?;
//! registry.add_filter(FilterDescriptor::section(0x20))?;
//! registry.start()?;
//! registry.stop()?;
//! registry.close()?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

mod descriptor;
mod poller;
mod provider;
mod reactor;
mod registry;
mod soft;

pub use descriptor::{FilterDescriptor, FilterFlags, FilterId, FilterKind, FilterMetadata};
pub use poller::{Event, Poller, Readiness};
pub use provider::{ResourceHandle, SourceHandle, TransportProvider};
pub use registry::FilterRegistry;
pub use soft::SoftDemux;

/// Lifecycle of a stream source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Closed,
    /// Transport configured, no reactor running
    Opened,
    /// Reactor thread running
    Started,
    /// The reactor ended on a multiplexer error
    Failed,
}

/// Receiver of filtered payloads, called on the reactor thread.
///
/// Must return promptly: every filter of the source waits while it runs.
pub trait FilterConsumer: Send + Sync {
    fn on_filter_data(&self, pid: u16, payload: &[u8], meta: &FilterMetadata);
}

impl<F> FilterConsumer for F
where
    F: Fn(u16, &[u8], &FilterMetadata) + Send + Sync,
{
    fn on_filter_data(&self, pid: u16, payload: &[u8], meta: &FilterMetadata) {
        self(pid, payload, meta)
    }
}

/// An owned delivery, for consumers that take data off the reactor thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterData {
    pub pid: u16,
    pub payload: Bytes,
    pub meta: FilterMetadata,
}

impl FilterConsumer for mpsc::UnboundedSender<FilterData> {
    fn on_filter_data(&self, pid: u16, payload: &[u8], meta: &FilterMetadata) {
        let data = FilterData {
            pid,
            payload: Bytes::copy_from_slice(payload),
            meta: *meta,
        };
        if self.send(data).is_err() {
            log::debug!("receiver gone, dropping payload of pid {:#06x}", pid);
        }
    }
}
