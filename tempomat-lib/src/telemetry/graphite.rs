//! Graphite plaintext emission: one gauge per bucket, once a second.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bucket::BucketSet;
use crate::config::Config;

const EMIT_PERIOD: Duration = Duration::from_secs(1);

/// Emits `<prefix>.<bucketName> <countOverThreshold> <unixSeconds>`
/// lines to a Graphite TCP endpoint. Connections are opened per
/// emission; a failed connect or write is logged and skipped, never
/// retried.
pub struct Graphite {
    addr: String,
    prefix: String,
}

impl Graphite {
    /// `None` when no Graphite endpoint is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.graphite.is_empty() {
            return None;
        }
        // Accept the `tcp://host:port` spelling the old deployments
        // used alongside plain `host:port`.
        let addr = config
            .graphite
            .strip_prefix("tcp://")
            .unwrap_or(&config.graphite)
            .to_string();
        Some(Self { addr, prefix: config.graphite_prefix.clone() })
    }

    pub fn spawn(
        self,
        buckets: Arc<BucketSet>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EMIT_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.emit(&buckets).await,
                    _ = shutdown.changed() => {
                        debug!("graphite emitter stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn emit(&self, buckets: &BucketSet) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        for bucket in buckets.iter() {
            let count = bucket.count_over_threshold();
            let line = format!("{}.{} {} {}\n", self.prefix, bucket.name(), count, now);
            self.send(&line).await;
        }
    }

    async fn send(&self, line: &str) {
        let mut stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "failed to connect to graphite server");
                return;
            }
        };
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            warn!(addr = %self.addr, error = %e, "failed to write to graphite server");
        }
    }
}
