//! Per-identity accounting: one limiter plus moving averages.

use std::time::{Duration, Instant, SystemTime};

use crate::bucket::limiter::{Limiter, Reservation};

/// Smoothing factor for all moving averages.
const ALPHA: f64 = 0.1;

/// Inter-arrival gaps beyond this window say nothing about a client's
/// request rate and are not averaged in.
const GAP_WINDOW: Duration = Duration::from_secs(60);

/// CPU-seconds-per-second samples at or above this value are artifacts
/// of a tiny gap average and are discarded.
const CPU_SAMPLE_CEILING: f64 = 100.0;

pub(crate) struct Entry {
    title: String,
    last_used: Instant,
    last_used_wall: SystemTime,
    avg_wait: Duration,
    avg_since_prev: Duration,
    avg_cpu_secs: f64,
    limiter: Limiter,
}

impl Entry {
    pub(crate) fn new(title: String, rate: f64, now: Instant) -> Self {
        Self {
            title,
            last_used: now,
            last_used_wall: SystemTime::now(),
            avg_wait: Duration::ZERO,
            avg_since_prev: Duration::ZERO,
            avg_cpu_secs: 0.0,
            limiter: Limiter::new(rate, now),
        }
    }

    pub(crate) fn reserve(&mut self, start: Instant, cost: f64) -> Reservation {
        self.limiter.reserve_n(start, cost)
    }

    /// Fold one reservation into the averages and refresh last-used.
    ///
    /// `delay` is the reservation's full wait (the tarpit sentinel
    /// included); only the part still ahead of `now` counts as imposed
    /// wait.
    pub(crate) fn observe(&mut self, now: Instant, start: Instant, cost: f64, delay: Duration) {
        let remaining = delay.saturating_sub(now.duration_since(start));
        self.avg_wait = ewma(self.avg_wait, remaining);

        let since_prev = now.duration_since(self.last_used);
        if since_prev > Duration::ZERO && since_prev < GAP_WINDOW {
            self.avg_since_prev = ewma(self.avg_since_prev, since_prev);
        }

        let gap = self.avg_since_prev.as_secs_f64();
        if gap > 0.0 {
            let sample = cost / gap;
            if sample < CPU_SAMPLE_CEILING {
                self.avg_cpu_secs = self.avg_cpu_secs * (1.0 - ALPHA) + sample * ALPHA;
            }
        }

        self.last_used = now;
        self.last_used_wall = SystemTime::now();
    }

    pub(crate) fn set_rate(&mut self, rate: f64, now: Instant) {
        self.limiter.set_rate(rate, now);
    }

    #[cfg(test)]
    pub(crate) fn limiter_rate(&self) -> f64 {
        self.limiter.rate()
    }

    pub(crate) fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn last_used_wall(&self) -> SystemTime {
        self.last_used_wall
    }

    pub(crate) fn avg_wait(&self) -> Duration {
        self.avg_wait
    }

    pub(crate) fn avg_since_prev(&self) -> Duration {
        self.avg_since_prev
    }

    pub(crate) fn avg_cpu_secs(&self) -> f64 {
        self.avg_cpu_secs
    }
}

fn ewma(avg: Duration, sample: Duration) -> Duration {
    Duration::from_secs_f64(avg.as_secs_f64() * (1.0 - ALPHA) + sample.as_secs_f64() * ALPHA)
}
