//! Reconnect bookkeeping
//!
//! The connection lifecycle is an explicit state value with a retry deadline,
//! driven by the single channel loop. Delays use exponential backoff with full
//! jitter: the n-th consecutive failure waits a uniformly random time in
//! `[0, min(max, base·2^(n-1))]`.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use super::ConnectionState;

/// Exponential backoff with full jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Upper bound of the delay after `failures` consecutive failures
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // 2^31 already overflows any sane base; clamp the shift
        let shift = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Random delay in `[0, ceiling(failures)]`
    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(failures).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

/// Lifecycle of the control connection
#[derive(Debug)]
pub struct Connection {
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect
    retry_count: u32,
    next_retry_at: Option<Instant>,
    /// Whether any attempt has ever succeeded
    ever_connected: bool,
}

impl Connection {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            retry_count: 0,
            next_retry_at: None,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn begin_attempt(&mut self) {
        self.transition(ConnectionState::Connecting);
        self.next_retry_at = None;
    }

    /// Handshake succeeded; returns true when this is a reconnect
    pub fn connected(&mut self) -> bool {
        let reconnect = self.ever_connected;
        self.ever_connected = true;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.transition(ConnectionState::Connected);
        reconnect
    }

    /// Handshake failed; schedules the next attempt and returns its deadline
    pub fn attempt_failed<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Instant {
        self.retry_count = self.retry_count.saturating_add(1);
        self.schedule_retry(now, rng)
    }

    /// An established connection dropped; schedules the next attempt
    pub fn dropped<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Instant {
        self.retry_count = 1;
        self.schedule_retry(now, rng)
    }

    /// Explicit shutdown; no further attempts
    pub fn close(&mut self) {
        self.next_retry_at = None;
        self.transition(ConnectionState::Disconnected);
    }

    /// Whether the retry deadline has passed
    pub fn is_due(&self, now: Instant) -> bool {
        self.state == ConnectionState::Backoff && self.next_retry_at.map_or(true, |at| at <= now)
    }

    fn schedule_retry<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Instant {
        let delay = self.policy.delay(self.retry_count, rng);
        let deadline = now + delay;
        self.next_retry_at = Some(deadline);
        self.transition(ConnectionState::Backoff);
        debug!(
            "Reconnect attempt {} scheduled in {:?}",
            self.retry_count, delay
        );
        deadline
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Connection {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.ceiling(0), Duration::ZERO);
        assert_eq!(policy.ceiling(1), Duration::from_millis(500));
        assert_eq!(policy.ceiling(2), Duration::from_millis(1_000));
        assert_eq!(policy.ceiling(3), Duration::from_millis(2_000));
        assert_eq!(policy.ceiling(7), Duration::from_millis(30_000));
        assert_eq!(policy.ceiling(8), Duration::from_secs(30));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);

        for failures in 1..=12 {
            let ceiling = policy.ceiling(failures);
            for _ in 0..200 {
                let delay = policy.delay(failures, &mut rng);
                assert!(delay <= ceiling, "{:?} > {:?}", delay, ceiling);
            }
        }
    }

    #[test]
    fn test_jitter_spreads_delays() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let delays: Vec<_> = (0..50).map(|_| policy.delay(6, &mut rng)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(max > min, "full jitter should not produce a constant delay");
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conn = Connection::new(ReconnectPolicy::default());
        let now = Instant::now();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.begin_attempt();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let deadline = conn.attempt_failed(now, &mut rng);
        assert_eq!(conn.state(), ConnectionState::Backoff);
        assert_eq!(conn.retry_count(), 1);
        assert!(deadline <= now + Duration::from_millis(500));
        assert!(conn.is_due(now + Duration::from_millis(500)));

        conn.begin_attempt();
        conn.attempt_failed(now, &mut rng);
        assert_eq!(conn.retry_count(), 2);

        conn.begin_attempt();
        assert!(!conn.connected(), "first success is not a reconnect");
        assert_eq!(conn.retry_count(), 0);
        assert!(conn.next_retry_at().is_none());

        let deadline = conn.dropped(now, &mut rng);
        assert!(deadline <= now + Duration::from_millis(500));
        conn.begin_attempt();
        assert!(conn.connected(), "second success is a reconnect");

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_due(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_nth_failure_delay_bound() {
        let mut rng = StdRng::seed_from_u64(3);
        let policy = ReconnectPolicy::default();
        let mut conn = Connection::new(policy);
        let now = Instant::now();

        for n in 1..=10u32 {
            conn.begin_attempt();
            let deadline = conn.attempt_failed(now, &mut rng);
            let bound = (policy.base * 2u32.pow(n - 1)).min(policy.max);
            assert!(deadline - now <= bound);
        }
    }
}
