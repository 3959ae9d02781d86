#![doc(html_root_url = "https://docs.rs/tsplane/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsplane - transport stream data plane
//!
//! `tsplane` is the real-time core between a transport stream source (tuner, file or
//! network replay) and the decoders and CA modules of a set-top box. It turns one
//! multiplexed MPEG-TS into per-PID sections, PES packets or raw packets under fixed
//! memory budgets, without dropping data under back-pressure.
//!
//! ## Features
//!
//! - PID filter registry with rollback on partial setup failure
//! - Dedicated reactor thread multiplexing filter readiness, with a join-on-stop
//!   guarantee that no callback fires after `stop` returns
//! - Memory-fed software demultiplexer with section, PES and raw assembly
//! - Locked power-of-two ring buffer for producer/consumer handoff
//! - Bit reader with sticky over-read detection for header parsing
//! - CAS session registry routing provider callbacks to weakly held owners
//! - Async replay of captures into a memory-fed source
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsplane::demux::{FilterDescriptor, FilterMetadata, FilterRegistry, SoftDemux};
//! use tsplane::ingest::{replay_file, ReplayOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let consumer = |pid: u16, section: &[u8], meta: &FilterMetadata| {
//!         println!("pid {:#06x} table {:?} v{:?}: {} bytes", pid, meta.table_id, meta.version, section.len());
//!     };
//!     let registry = FilterRegistry::new(Arc::new(SoftDemux::new()), Arc::new(consumer));
//!
//!     registry.open("capture")?;
//!     registry.add_filter(FilterDescriptor::section(0x0000))?;
//!     registry.start()?;
//!
//!     replay_file("capture.ts", &registry, &ReplayOptions::default()).await?;
//!     registry.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `demux`: filter registry, reactor, readiness poller, provider trait and the
//!   software demultiplexer
//! - `session`: CAS session handle to owner routing
//! - `format`: TS packet, section header and PES header parsing
//! - `utils`: bit reader, ring buffer, CRC
//! - `ingest`: async replay into memory-fed sources
//! - `config`: tunables loaded from `tsplane.toml` and `TSPLANE_*` variables
//! - `error`: the crate error type

/// Configuration module
pub mod config;

/// PID filtering and the reactor
pub mod demux;

/// Error types and utilities
pub mod error;

/// Transport stream parsing
pub mod format;

/// Replay of byte sources into memory-fed sources
pub mod ingest;

/// CAS session callback routing
pub mod session;

/// Common utilities and helper functions
pub mod utils;

pub use error::{Result, TsError};
