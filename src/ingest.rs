//! Replay of recorded or streamed transport data into a memory-fed source.

use crate::demux::FilterRegistry;
use crate::error::{Result, TsError};
use crate::format::ts::TS_PACKET_SIZE;
use bytes::{Buf, BytesMut};
use log::{debug, info};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Pacing of [`replay`]
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Bytes read per step, rounded down to whole packets
    pub chunk_size: usize,
    /// Wait before re-submitting after the source accepted nothing
    pub backoff: Duration,
    /// Consecutive zero-accept attempts tolerated before giving up
    pub max_stalls: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            chunk_size: TS_PACKET_SIZE * 7,
            backoff: Duration::from_millis(5),
            max_stalls: 200,
        }
    }
}

/// Feeds everything `reader` yields into `registry` and returns the bytes accepted.
///
/// Short accepts are re-submitted after `backoff`, so no input is dropped while the
/// source is back-pressured. Fails with `Resource` once the source accepts nothing
/// for `max_stalls` attempts in a row.
pub async fn replay<R>(mut reader: R, registry: &FilterRegistry, options: &ReplayOptions) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = (options.chunk_size / TS_PACKET_SIZE).max(1) * TS_PACKET_SIZE;
    let mut buf = BytesMut::with_capacity(chunk_size);
    let mut total = 0u64;

    loop {
        buf.clear();
        buf.reserve(chunk_size);
        if reader.read_buf(&mut buf).await? == 0 {
            break;
        }

        let mut stalls = 0;
        while buf.has_remaining() {
            let accepted = registry.feed_ts(&buf)?;
            if accepted > 0 {
                buf.advance(accepted);
                total += accepted as u64;
                stalls = 0;
                continue;
            }

            stalls += 1;
            if stalls > options.max_stalls {
                return Err(TsError::Resource(format!(
                    "source accepted nothing for {} attempts after {} bytes",
                    options.max_stalls, total
                )));
            }
            debug!("replay: source full, backing off {:?}", options.backoff);
            tokio::time::sleep(options.backoff).await;
        }
    }

    info!("replay finished after {} bytes", total);
    Ok(total)
}

/// Opens `path` and [`replay`]s it.
pub async fn replay_file<P: AsRef<Path>>(
    path: P,
    registry: &FilterRegistry,
    options: &ReplayOptions,
) -> Result<u64> {
    let file = tokio::fs::File::open(path.as_ref()).await?;
    info!("replaying {}", path.as_ref().display());
    replay(file, registry, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::demux::{FilterConsumer, FilterDescriptor, FilterKind, FilterMetadata, SoftDemux};
    use crate::format::ts::PID_NULL;
    use std::sync::Arc;

    fn registry_with(config: Config) -> FilterRegistry {
        let consumer: Arc<dyn FilterConsumer> = Arc::new(|_: u16, _: &[u8], _: &FilterMetadata| {});
        FilterRegistry::with_config(Arc::new(SoftDemux::with_config(&config)), consumer, config)
    }

    fn packets(pid: u16, count: usize) -> Vec<u8> {
        (0..count)
            .flat_map(|i| {
                let mut packet = vec![0xffu8; TS_PACKET_SIZE];
                packet[..4].copy_from_slice(&[0x47, (pid >> 8) as u8, pid as u8, 0x10 | (i as u8 & 0x0f)]);
                packet
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replay_feeds_everything() {
        let registry = registry_with(Config {
            input_buffer_size: TS_PACKET_SIZE * 64,
            ..Config::default()
        });
        registry.open("replay").unwrap();
        // No filters: every packet leaves the input as soon as it lands
        let data = packets(PID_NULL, 40);

        let total = replay(&data[..], &registry, &ReplayOptions::default()).await.unwrap();
        assert_eq!(total, data.len() as u64);
    }

    #[tokio::test]
    async fn test_replay_gives_up_on_stuck_source() {
        let registry = registry_with(Config {
            input_buffer_size: 256,
            raw_buffer_size: TS_PACKET_SIZE,
            ..Config::default()
        });
        registry.open("replay").unwrap();
        // Nobody reads the filter, so its queue and then the input fill up
        registry
            .add_filter(FilterDescriptor::new(0x100, FilterKind::Unspecified))
            .unwrap();
        let options = ReplayOptions {
            backoff: Duration::from_millis(1),
            max_stalls: 3,
            ..ReplayOptions::default()
        };
        assert!(matches!(
            replay(&packets(0x100, 10)[..], &registry, &options).await,
            Err(TsError::Resource(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_requires_open_source() {
        let registry = registry_with(Config::default());
        assert!(replay(&packets(0x20, 1)[..], &registry, &ReplayOptions::default())
            .await
            .is_err());
        assert!(replay_file("/nonexistent/capture.ts", &registry, &ReplayOptions::default())
            .await
            .is_err());
    }
}
