//! The fixed roster of buckets every request is charged against.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bucket::{Bucket, Scheme};
use crate::config::Config;

/// Combined outcome of charging one request against every bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// True when any bucket refused the reservation outright.
    pub rejected: bool,
    /// Largest wait any bucket asked for, measured from the request's
    /// start time.
    pub max_delay: Duration,
}

/// The four buckets, in charging order: Slash32, Slash24, Slash16,
/// UserAgent.
pub struct BucketSet {
    buckets: [Arc<Bucket>; 4],
}

impl BucketSet {
    pub fn new(config: &Config) -> Self {
        Self {
            buckets: [
                Arc::new(Bucket::new(Scheme::Slash32, config)),
                Arc::new(Bucket::new(Scheme::Slash24, config)),
                Arc::new(Bucket::new(Scheme::Slash16, config)),
                Arc::new(Bucket::new(Scheme::UserAgent, config)),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Bucket>> {
        self.buckets.iter()
    }

    /// Name lookup for the introspection endpoint. Exact and
    /// case-sensitive; unknown names yield `None`.
    pub fn get(&self, name: &str) -> Option<&Arc<Bucket>> {
        self.buckets.iter().find(|b| b.name() == name)
    }

    /// Debit `cost` CPU-seconds from every bucket and reconcile into a
    /// single verdict.
    pub fn charge(
        &self,
        peer: SocketAddr,
        headers: &HeaderMap,
        start: Instant,
        cost: f64,
    ) -> Verdict {
        let mut rejected = false;
        let mut max_delay = Duration::ZERO;
        for bucket in &self.buckets {
            let reservation = bucket.reserve_n(peer, headers, start, cost);
            if !reservation.ok {
                rejected = true;
            } else {
                max_delay = max_delay.max(reservation.delay);
            }
        }
        Verdict { rejected, max_delay }
    }

    /// Push a new configuration into every bucket in turn.
    pub fn set_config(&self, config: &Config) {
        for bucket in &self.buckets {
            bucket.set_config(config);
        }
    }

    pub fn spawn_maintenance(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.buckets
            .iter()
            .map(|b| b.spawn_maintenance(shutdown.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn test_config() -> Config {
        Config {
            cpu_count: 4.0,
            slash32_share: 0.1,
            slash24_share: 0.1,
            slash16_share: 0.1,
            user_agent_share: 0.1,
            ..Config::default()
        }
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn roster_is_fixed_and_ordered() {
        let set = BucketSet::new(&test_config());
        let names: Vec<&str> = set.iter().map(|b| b.name()).collect();
        assert_eq!(names, ["Slash32", "Slash24", "Slash16", "UserAgent"]);
    }

    #[test]
    fn lookup_is_exact_and_case_sensitive() {
        let set = BucketSet::new(&test_config());
        assert!(set.get("Slash24").is_some());
        assert!(set.get("slash24").is_none());
        assert!(set.get("Slash2").is_none());
        assert!(set.get("").is_none());
    }

    #[test]
    fn well_behaved_request_passes_untouched() {
        let set = BucketSet::new(&test_config());
        let verdict = set.charge(peer("1.1.1.1:9"), &HeaderMap::new(), Instant::now(), 0.1);

        assert!(!verdict.rejected);
        assert_eq!(verdict.max_delay, Duration::ZERO);

        let slash32 = set.get("Slash32").unwrap().snapshot();
        assert_eq!(slash32.len(), 1);
        assert_eq!(slash32[0].title, "1.1.1.1/32");
    }

    #[test]
    fn verdict_carries_the_largest_delay() {
        // Slash24 gets a much smaller budget, so the shared /24 runs
        // dry while the per-client /32 still has burst to spare.
        let config = Config {
            cpu_count: 4.0,
            slash32_share: 0.5,
            slash24_share: 0.025,
            slash16_share: 0.5,
            user_agent_share: 0.5,
            ..Config::default()
        };
        let set = BucketSet::new(&config);
        let start = Instant::now();

        // Burst on the /24 is 1 CPU-s; two cost-1.0 requests from
        // neighbouring addresses drain it and put the second in debt.
        let first = set.charge(peer("3.3.3.4:1"), &HeaderMap::new(), start, 1.0);
        assert!(!first.rejected);
        assert_eq!(first.max_delay, Duration::ZERO);

        let second = set.charge(peer("3.3.3.5:1"), &HeaderMap::new(), start, 1.0);
        assert!(!second.rejected);
        assert!(second.max_delay > Duration::ZERO);
    }

    #[test]
    fn aggregate_runs_dry_before_the_per_client_bucket() {
        let config = Config {
            cpu_count: 4.0,
            slash32_share: 0.5,
            slash24_share: 0.025,
            slash16_share: 0.5,
            user_agent_share: 0.5,
            ..Config::default()
        };
        let set = BucketSet::new(&config);
        let start = Instant::now();

        // Cost 1.5 exceeds the /24 burst of 1 CPU-s outright but is
        // well within every other bucket's budget.
        let verdict = set.charge(peer("3.3.3.4:1"), &HeaderMap::new(), start, 1.5);
        assert!(verdict.rejected);

        let slash32 = set.get("Slash32").unwrap().snapshot();
        assert_eq!(slash32[0].title, "3.3.3.4/32");
        let slash24 = set.get("Slash24").unwrap().snapshot();
        assert_eq!(slash24[0].title, "3.3.3.0/24");
    }

    #[test]
    fn reconfig_reaches_every_bucket() {
        let set = BucketSet::new(&test_config());
        set.charge(peer("1.1.1.1:9"), &HeaderMap::new(), Instant::now(), 0.1);

        let raised = Config { delay_threshold_sec: 99.0, ..test_config() };
        set.set_config(&raised);
        for bucket in set.iter() {
            assert_eq!(bucket.delay_threshold(), Duration::from_secs(99));
        }
    }
}
