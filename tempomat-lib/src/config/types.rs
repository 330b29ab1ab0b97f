use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, deserialized from `/etc/tempomat.json`.
///
/// Constructed once at startup and replaced wholesale on reload;
/// buckets consume it via [`crate::bucket::Bucket::set_config`] and
/// never hold a reference to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Raise log verbosity and dump the effective config at startup.
    pub debug: bool,
    /// Average wait (seconds) past which an entry counts as delayed in
    /// the Graphite gauge.
    pub delay_threshold_sec: f64,
    /// Origin URI requests are forwarded to.
    pub backend: String,
    /// Local HTTP listen port.
    pub listen_port: u16,
    /// Graphite TCP endpoint (`host:port`); empty disables emission.
    pub graphite: String,
    /// Metric prefix; a `{hostname}` token is expanded at load time.
    pub graphite_prefix: String,
    /// Comma-separated proxy addresses whose forwarding headers are
    /// believed.
    pub trusted_proxies: String,
    /// Host CPU count; 0 means auto-detect.
    pub cpu_count: f64,
    pub slash32_share: f64,
    pub slash24_share: f64,
    pub slash16_share: f64,
    pub user_agent_share: f64,
    /// Per-bucket entry cap enforced by the maintenance tick.
    pub hash_max_len: usize,

    /// Expanded form of `trusted_proxies`; always present, possibly
    /// empty.
    #[serde(skip)]
    pub trusted_proxy_set: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            delay_threshold_sec: 10.0,
            backend: "http://localhost:80".to_string(),
            listen_port: 8888,
            graphite: String::new(),
            graphite_prefix: String::new(),
            trusted_proxies: String::new(),
            cpu_count: 0.0,
            slash32_share: 0.0,
            slash24_share: 0.0,
            slash16_share: 0.0,
            user_agent_share: 0.0,
            hash_max_len: 1000,
            trusted_proxy_set: HashSet::new(),
        }
    }
}

impl Config {
    /// Derive the in-memory fields serde skips: the trusted-proxy set,
    /// the detected CPU count, and the expanded Graphite prefix.
    pub(crate) fn finalize(&mut self) {
        self.trusted_proxy_set = self
            .trusted_proxies
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if self.cpu_count <= 0.0 {
            self.cpu_count = std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0);
        }

        if self.graphite_prefix.contains("{hostname}") {
            let hostname = gethostname::gethostname().to_string_lossy().into_owned();
            self.graphite_prefix = self.graphite_prefix.replace("{hostname}", &hostname);
        }
    }

    /// Absolute CPU budget for a bucket, in CPU-seconds per second.
    /// An unset share (0) defaults to half a core.
    pub fn cpu_budget(&self, share: f64) -> f64 {
        if share == 0.0 {
            0.5 * self.cpu_count
        } else {
            share * self.cpu_count
        }
    }

    pub fn delay_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.delay_threshold_sec.max(0.0))
    }
}
