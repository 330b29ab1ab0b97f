//! Per-identity compute budgeting.
//!
//! A [`Bucket`] is a concurrent map from identity-hash to a
//! token-bucket limiter, one bucket per identity scheme (client
//! /32, enclosing /24 and /16 aggregates, and User-Agent). Every
//! forwarded request is charged its elapsed service time against all
//! four buckets; the admission pipeline turns the reservations into one
//! sleep-or-reject decision.
//!
//! Buckets never sleep: [`Bucket::reserve_n`] computes a future wait
//! and returns. Entry eviction happens on a periodic maintenance tick
//! that keeps the map bounded, retaining the identities currently being
//! made to wait (the ones the operator cares about).

mod entry;
mod identity;
mod limiter;
mod set;

pub use limiter::{Reservation, REJECT_DELAY};
pub use set::{BucketSet, Verdict};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::DumpEntry;
use crate::config::Config;
use entry::Entry;

/// Entries idle longer than this are dropped first when a bucket is
/// over its cap.
const IDLE_EXPIRY: Duration = Duration::from_secs(60);

/// The four identity schemes a request is billed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Slash32,
    Slash24,
    Slash16,
    UserAgent,
}

impl Scheme {
    pub fn name(&self) -> &'static str {
        match self {
            Scheme::Slash32 => "Slash32",
            Scheme::Slash24 => "Slash24",
            Scheme::Slash16 => "Slash16",
            Scheme::UserAgent => "UserAgent",
        }
    }

    fn netmask(&self) -> Option<u8> {
        match self {
            Scheme::Slash32 => Some(32),
            Scheme::Slash24 => Some(24),
            Scheme::Slash16 => Some(16),
            Scheme::UserAgent => None,
        }
    }

    fn share(&self, config: &Config) -> f64 {
        match self {
            Scheme::Slash32 => config.slash32_share,
            Scheme::Slash24 => config.slash24_share,
            Scheme::Slash16 => config.slash16_share,
            Scheme::UserAgent => config.user_agent_share,
        }
    }

    /// IP buckets churn fast and tick every second; the User-Agent
    /// key-space is larger and colder, so it ticks once a minute.
    fn maintenance_period(&self) -> Duration {
        match self {
            Scheme::UserAgent => Duration::from_secs(60),
            _ => Duration::from_secs(1),
        }
    }
}

struct Inner {
    rate: f64,
    delay_threshold: Duration,
    hash_max_len: usize,
    trusted_proxies: HashSet<String>,
    entries: ahash::AHashMap<String, Entry>,
}

/// One identity scheme's worth of limiters.
///
/// All mutation (reservations, reconfiguration, truncation) is
/// serialized by the interior write lock; snapshots take the read lock
/// and copy out.
pub struct Bucket {
    scheme: Scheme,
    inner: RwLock<Inner>,
}

impl Bucket {
    pub fn new(scheme: Scheme, config: &Config) -> Self {
        Self {
            scheme,
            inner: RwLock::new(Inner {
                rate: config.cpu_budget(scheme.share(config)),
                delay_threshold: config.delay_threshold(),
                hash_max_len: config.hash_max_len,
                trusted_proxies: config.trusted_proxy_set.clone(),
                entries: ahash::AHashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.scheme.name()
    }

    /// Charge `cost` CPU-seconds to the identity behind this request.
    ///
    /// Creates the entry on first use, issues the reservation against
    /// `start`, and folds the outcome into the entry's averages. Never
    /// sleeps.
    pub fn reserve_n(
        &self,
        peer: SocketAddr,
        headers: &HeaderMap,
        start: Instant,
        cost: f64,
    ) -> Reservation {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(bucket = self.scheme.name(), "bucket lock poisoned, admitting request");
                return Reservation { ok: true, delay: Duration::ZERO };
            }
        };

        let identity = match self.scheme.netmask() {
            Some(prefix) => identity::masked_ip(peer, headers, &inner.trusted_proxies, prefix),
            None => identity::user_agent(headers),
        };
        let key = identity::key(&identity);

        let now = Instant::now();
        let rate = inner.rate;
        let entry = inner
            .entries
            .entry(key)
            .or_insert_with(|| Entry::new(identity.clone(), rate, now));

        let reservation = entry.reserve(start, cost);
        entry.observe(now, start, cost, reservation.delay);

        debug!(
            bucket = self.scheme.name(),
            identity = %identity,
            cost,
            ok = reservation.ok,
            delay_ms = reservation.delay.as_millis() as u64,
            "billed"
        );
        reservation
    }

    /// Push a freshly loaded configuration into this bucket.
    ///
    /// Atomic with respect to `reserve_n`: after it returns, every
    /// entry's limiter runs at the newly derived rate. Idempotent.
    pub fn set_config(&self, config: &Config) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(bucket = self.scheme.name(), "bucket lock poisoned, skipping reconfig");
                return;
            }
        };

        let rate = config.cpu_budget(self.scheme.share(config));
        let now = Instant::now();

        inner.rate = rate;
        inner.delay_threshold = config.delay_threshold();
        inner.hash_max_len = config.hash_max_len;
        inner.trusted_proxies = config.trusted_proxy_set.clone();
        for entry in inner.entries.values_mut() {
            entry.set_rate(rate, now);
        }

        debug!(bucket = self.scheme.name(), rate, "reconfigured");
    }

    /// Shallow copy of all entries for introspection. Order is
    /// unspecified.
    pub fn snapshot(&self) -> Vec<DumpEntry> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(bucket = self.scheme.name(), "bucket lock poisoned, returning empty dump");
                return Vec::new();
            }
        };

        inner
            .entries
            .iter()
            .map(|(hash, entry)| DumpEntry {
                hash: hash.clone(),
                title: entry.title().to_string(),
                last_used: unix_seconds(entry.last_used_wall()),
                avg_wait: entry.avg_wait().as_secs_f64(),
                avg_cpu_secs: entry.avg_cpu_secs(),
                avg_since_prev: entry.avg_since_prev().as_secs_f64(),
            })
            .collect()
    }

    /// Number of entries whose average imposed wait exceeds the delay
    /// threshold; this is the per-bucket Graphite gauge.
    pub fn count_over_threshold(&self) -> usize {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(_) => return 0,
        };
        let threshold = inner.delay_threshold;
        inner.entries.values().filter(|e| e.avg_wait() > threshold).count()
    }

    pub fn delay_threshold(&self) -> Duration {
        match self.inner.read() {
            Ok(guard) => guard.delay_threshold,
            Err(_) => Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(guard) => guard.entries.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Long-lived eviction task; stops when `shutdown` flips.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let bucket = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bucket.scheme.maintenance_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bucket.run_maintenance(Instant::now()),
                    _ = shutdown.changed() => {
                        debug!(bucket = bucket.scheme.name(), "maintenance stopped");
                        break;
                    }
                }
            }
        })
    }

    /// One maintenance pass: only acts when the map is over its cap.
    /// Idle entries go first, then the quietest of the remainder; the
    /// identities with the largest average wait are retained so the
    /// offenders stay visible to introspection.
    pub fn run_maintenance(&self, now: Instant) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(bucket = self.scheme.name(), "bucket lock poisoned, skipping maintenance");
                return;
            }
        };

        let max_len = inner.hash_max_len;
        let before = inner.entries.len();
        if before <= max_len {
            return;
        }

        let mut survivors: Vec<(String, Entry)> = inner
            .entries
            .drain()
            .filter(|(_, entry)| now.duration_since(entry.last_used()) <= IDLE_EXPIRY)
            .collect();
        survivors.sort_by(|a, b| b.1.avg_wait().cmp(&a.1.avg_wait()));
        survivors.truncate(max_len);

        inner.entries = survivors.into_iter().collect();
        debug!(
            bucket = self.scheme.name(),
            dropped = before - inner.entries.len(),
            kept = inner.entries.len(),
            "truncated"
        );
    }

    #[cfg(test)]
    pub(crate) fn entry_rates(&self) -> Vec<f64> {
        self.inner
            .read()
            .map(|inner| inner.entries.values().map(|e| e.limiter_rate()).collect())
            .unwrap_or_default()
    }
}

fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
