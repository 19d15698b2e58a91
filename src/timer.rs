//! Jittered BGP timers (spec §4.5).
//!
//! Every BGP timer (connect-retry, hold, keepalive) is armed through
//! [`BgpTimer::arm`], which applies RFC 1771 §9.2.3.3's uniform random
//! reduction of up to 25% of the nominal value. The reduction comes from a
//! single pluggable [`Jitter`] so tests can pin it to the upper or lower
//! bound deterministically.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Source of the random reduction applied when arming a timer.
pub trait Jitter: Send + Sync {
    /// Returns a value in `[0, max_ms)` (milliseconds) to subtract from the
    /// nominal timer length. Called with `max_ms == 0` only when the nominal
    /// value itself is 0, in which case the timer is stopped, not armed.
    fn reduction_ms(&self, max_ms: u64) -> u64;
}

/// Production jitter source: `rand::thread_rng`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn reduction_ms(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..max_ms)
        }
    }
}

/// Test jitter source that always returns a fixed reduction, clamped to the
/// requested max. Use `FixedJitter(0)` to pin timers to their nominal value
/// (upper bound) and `FixedJitter(u64::MAX)` to pin them to 3/4 nominal
/// (lower bound).
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl Jitter for FixedJitter {
    fn reduction_ms(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            0
        } else {
            self.0.min(max_ms - 1)
        }
    }
}

/// A single BGP timer. Armed with a nominal value in whole seconds; `0`
/// stops it. An unarmed timer's [`tick`](BgpTimer::tick) future never
/// resolves, so it can be freely used as a `select!` branch guarded by
/// [`is_armed`](BgpTimer::is_armed).
#[derive(Debug)]
pub struct BgpTimer {
    nominal_secs: u16,
    deadline: Option<Instant>,
}

impl BgpTimer {
    pub fn new() -> Self {
        Self {
            nominal_secs: 0,
            deadline: None,
        }
    }

    /// Arms the timer for `nominal_secs` from now, per §4.5. `0` stops it.
    pub fn arm(&mut self, nominal_secs: u16, jitter: &dyn Jitter) {
        if nominal_secs == 0 {
            self.stop();
            return;
        }
        let nominal_ms = u64::from(nominal_secs) * 1000;
        let max_reduction_ms = nominal_ms / 4;
        let reduction_ms = jitter.reduction_ms(max_reduction_ms);
        let actual_ms = nominal_ms.saturating_sub(reduction_ms);
        self.nominal_secs = nominal_secs;
        self.deadline = Some(Instant::now() + Duration::from_millis(actual_ms));
    }

    pub fn stop(&mut self) {
        self.nominal_secs = 0;
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn nominal_secs(&self) -> u16 {
        self.nominal_secs
    }

    /// Seconds remaining, rounded down; `None` if unarmed.
    pub fn remaining_secs(&self) -> Option<i64> {
        self.deadline
            .map(|d| (d.saturating_duration_since(Instant::now())).as_secs() as i64)
    }

    /// Resolves when the timer fires. Pending forever while unarmed — guard
    /// `select!` branches with [`is_armed`](BgpTimer::is_armed).
    pub async fn tick(&mut self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for BgpTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_zero_stops_the_timer() {
        let mut timer = BgpTimer::new();
        timer.arm(30, &FixedJitter(0));
        assert!(timer.is_armed());
        timer.arm(0, &FixedJitter(0));
        assert!(!timer.is_armed());
    }

    #[test]
    fn actual_interval_stays_within_rfc_bound() {
        // Property 6: for nominal v>0, actual in [3v/4, v].
        for nominal in [1u16, 10, 30, 90, 240] {
            for jitter in [&FixedJitter(0) as &dyn Jitter, &FixedJitter(u64::MAX)] {
                let mut timer = BgpTimer::new();
                let before = Instant::now();
                timer.arm(nominal, jitter);
                let remaining_ms = timer
                    .deadline
                    .unwrap()
                    .saturating_duration_since(before)
                    .as_millis() as i64;
                let nominal_ms = i64::from(nominal) * 1000;
                let lower = (nominal_ms * 3) / 4;
                assert!(
                    remaining_ms >= lower - 5 && remaining_ms <= nominal_ms,
                    "nominal={} actual_ms={} lower={}",
                    nominal,
                    remaining_ms,
                    lower
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_resolves_once_the_deadline_passes() {
        let mut timer = BgpTimer::new();
        timer.arm(4, &FixedJitter(0)); // pinned to the upper bound: exactly 4s
        let start = Instant::now();
        timer.tick().await;
        assert_eq!(Instant::now().saturating_duration_since(start).as_secs(), 4);
    }
}
