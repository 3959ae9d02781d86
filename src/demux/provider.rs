use super::descriptor::FilterDescriptor;
use super::poller::Readiness;
use crate::error::Result;
use std::fmt;
use std::io;

/// An opened stream source of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u32);

/// One configured filter resource of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u32);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

/// The collaborator that owns the actual filter resources.
///
/// A kernel demux driver, a secure buffer or [`SoftDemux`](super::SoftDemux) all sit
/// behind this trait; [`FilterRegistry`](super::FilterRegistry) only sequences the calls.
/// All methods may be called from the reactor thread and from control threads at once.
pub trait TransportProvider: Send + Sync {
    fn open_source(&self, source_id: &str) -> Result<SourceHandle>;

    fn close_source(&self, source: SourceHandle);

    /// Allocates a filter resource for `descriptor`; it stays idle until started.
    fn configure_filter(&self, source: SourceHandle, descriptor: &FilterDescriptor) -> Result<ResourceHandle>;

    fn set_buffer_size(&self, resource: ResourceHandle, size: usize) -> Result<()>;

    /// Hands the resource the handle it signals readable/error readiness through.
    fn attach_readiness(&self, resource: ResourceHandle, readiness: Readiness) -> Result<()>;

    fn start_resource(&self, resource: ResourceHandle) -> Result<()>;

    fn stop_resource(&self, resource: ResourceHandle) -> Result<()>;

    /// Frees the resource; unknown handles are ignored.
    fn release_resource(&self, resource: ResourceHandle);

    /// Reads at most `buf.len()` bytes of one delivered unit.
    ///
    /// Returns 0 when nothing is pending.
    fn read(&self, resource: ResourceHandle, buf: &mut [u8]) -> Result<usize>;

    /// Push path for memory-fed sources. Returns the bytes accepted, 0 when full.
    fn write(&self, _source: SourceHandle, _data: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "source is not memory-fed",
        ))
    }
}
