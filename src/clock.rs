//! Monotonic time and deadline scheduling.
//!
//! Every wait in the core is expressed as an absolute [`Instant`] computed
//! once, never as "duration from now" re-read later, so a busy runtime does
//! not drift its deadlines. The [`Clock`] handle is the only way runtime
//! code reads time; tests drive it deterministically with
//! `#[tokio::test(start_paused = true)]` and `tokio::time::advance`.

use std::future::Future;

use tokio::time::{error::Elapsed, Instant};

/// Cloneable handle over the tokio timer wheel.
///
/// Captures a process epoch at construction so event timestamps can be
/// expressed as milliseconds without touching the wall clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Creates a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current monotonic instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Milliseconds elapsed between the clock epoch and `at`.
    pub fn millis_since_epoch(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Sleeps until the absolute deadline. Cancelling is dropping the future.
    pub async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }

    /// Runs `fut` with an absolute deadline; `Err(Elapsed)` when it expires.
    pub async fn timeout_at<F: Future>(&self, deadline: Instant, fut: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout_at(deadline, fut).await
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A small set of labeled absolute deadlines.
///
/// Arming a key replaces its previous deadline; cancelling removes it. The
/// owner selects on [`DeadlineSet::next`] and pops due entries once the
/// timer fires.
#[derive(Debug)]
pub struct DeadlineSet<K> {
    entries: Vec<(Instant, K)>,
}

impl<K: Copy + PartialEq> DeadlineSet<K> {
    /// Empty set.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Arms `key` to fire at `at`, replacing any previous deadline for it.
    pub fn arm(&mut self, key: K, at: Instant) {
        self.cancel(key);
        self.entries.push((at, key));
    }

    /// Removes the deadline for `key`, if armed.
    pub fn cancel(&mut self, key: K) {
        self.entries.retain(|(_, k)| *k != key);
    }

    /// Removes every armed deadline.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Earliest armed deadline, if any.
    pub fn next(&self) -> Option<(Instant, K)> {
        self.entries.iter().min_by_key(|(at, _)| *at).copied()
    }

    /// Pops the earliest deadline that is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| *at <= now)
            .min_by_key(|(_, (at, _))| *at)
            .map(|(i, _)| i)?;
        Some(self.entries.swap_remove(idx).1)
    }
}

impl<K: Copy + PartialEq> Default for DeadlineSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Key {
        A,
        B,
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_fire_in_order() {
        let clock = Clock::new();
        let mut set = DeadlineSet::new();
        let now = clock.now();
        set.arm(Key::B, now + Duration::from_secs(5));
        set.arm(Key::A, now + Duration::from_secs(2));

        let (at, key) = set.next().unwrap();
        assert_eq!(key, Key::A);
        clock.sleep_until(at).await;
        assert_eq!(set.pop_due(clock.now()), Some(Key::A));
        assert_eq!(set.pop_due(clock.now()), None);

        let (at, _) = set.next().unwrap();
        clock.sleep_until(at).await;
        assert_eq!(set.pop_due(clock.now()), Some(Key::B));
        assert!(set.next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_deadline() {
        let clock = Clock::new();
        let mut set = DeadlineSet::new();
        let now = clock.now();
        set.arm(Key::A, now + Duration::from_secs(1));
        set.arm(Key::A, now + Duration::from_secs(10));
        assert_eq!(set.next().unwrap().0, now + Duration::from_secs(10));

        set.cancel(Key::A);
        assert!(set.next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_millis_track_paused_time() {
        let clock = Clock::new();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.millis_since_epoch(clock.now()), 1500);
    }
}
