use crate::demux::FilterKind;
use crate::error::{Result, TsError};
use crate::format::ts::TS_PACKET_SIZE;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::load());
}

/// Files tried by [`Config::load`], first match wins.
pub const CONFIG_PATHS: [&str; 2] = ["./tsplane.toml", "./config.toml"];

/// Tunables of the filtering data plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound of one reactor wait, so the stop flag is re-checked without traffic
    pub poll_timeout_ms: u64,
    /// Buffer of a section filter
    pub section_buffer_size: usize,
    /// Buffer of an audio PES filter
    pub audio_buffer_size: usize,
    /// Buffer of a video PES filter
    pub video_buffer_size: usize,
    /// Buffer of a raw (whole TS packet) filter
    pub raw_buffer_size: usize,
    /// Capacity of the memory-fed transport sink
    pub input_buffer_size: usize,
    /// Retries of an interrupted sink write inside `feed_ts`
    pub feed_retry_limit: usize,
    /// Readiness events drained per reactor wake-up
    pub max_events_per_poll: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            section_buffer_size: 32 * 1024,
            audio_buffer_size: 1024 * 1024,
            video_buffer_size: 4 * 1024 * 1024,
            raw_buffer_size: TS_PACKET_SIZE * 256,
            input_buffer_size: TS_PACKET_SIZE * 1024,
            feed_retry_limit: 16,
            max_events_per_poll: 64,
        }
    }
}

impl Config {
    /// Defaults, overlaid by the first config file found, overlaid by `TSPLANE_*` variables.
    pub fn load() -> Self {
        let mut config = Config::default();

        for path in &CONFIG_PATHS {
            if let Ok(content) = std::fs::read_to_string(path) {
                match Config::from_toml_str(&content) {
                    Ok(parsed) => {
                        config = parsed;
                        break;
                    }
                    Err(e) => log::warn!("ignoring {}: {}", path, e),
                }
            }
        }

        config.apply_env();
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TsError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        fn read<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(raw) = env::var(name) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => log::warn!("ignoring {}={:?}: not a number", name, raw),
                }
            }
        }

        read("TSPLANE_POLL_TIMEOUT_MS", &mut self.poll_timeout_ms);
        read("TSPLANE_SECTION_BUFFER_SIZE", &mut self.section_buffer_size);
        read("TSPLANE_AUDIO_BUFFER_SIZE", &mut self.audio_buffer_size);
        read("TSPLANE_VIDEO_BUFFER_SIZE", &mut self.video_buffer_size);
        read("TSPLANE_RAW_BUFFER_SIZE", &mut self.raw_buffer_size);
        read("TSPLANE_INPUT_BUFFER_SIZE", &mut self.input_buffer_size);
        read("TSPLANE_FEED_RETRY_LIMIT", &mut self.feed_retry_limit);
        read("TSPLANE_MAX_EVENTS_PER_POLL", &mut self.max_events_per_poll);
    }

    /// Filter buffer size for a kind: small for sections, megabytes for PES
    pub fn buffer_size_for(&self, kind: FilterKind) -> usize {
        match kind {
            FilterKind::Section => self.section_buffer_size,
            FilterKind::Audio => self.audio_buffer_size,
            FilterKind::Video => self.video_buffer_size,
            FilterKind::Unspecified => self.raw_buffer_size,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn reload() {
        let new_config = Config::load();
        *CONFIG.write() = new_config;
    }
}

/// Returns a snapshot of the process-wide configuration
pub fn current() -> Config {
    CONFIG.read().clone()
}

/// Commented template with every default, also written by the build script
pub const CONFIG_TEMPLATE: &str = include_str!("config_template.toml");

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        std::fs::write(path, CONFIG_TEMPLATE)?;
    }
    Ok(())
}
