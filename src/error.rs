use crate::demux::SourceState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("bit reader over-read: requested {requested} bits, {available} available")]
    Overread { requested: usize, available: usize },

    #[error("pid {pid:#06x} already has an active filter")]
    FilterExists { pid: u16 },

    #[error("no active filter for pid {pid:#06x}")]
    UnknownFilter { pid: u16 },

    #[error("session {handle:#x} is already registered")]
    SessionExists { handle: u64 },

    #[error("session {handle:#x} is not registered")]
    UnknownSession { handle: u64 },

    #[error("unknown transport resource {0}")]
    UnknownResource(u32),

    #[error("filter buffer overflow on pid {pid:#06x}")]
    BufferOverflow { pid: u16 },

    #[error("reactor failure: {0}")]
    ReactorFatal(String),

    #[error("cannot {operation} while source is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SourceState,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TsError>;
