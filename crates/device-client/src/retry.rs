//! Reconnect retry policies.
//!
//! When the connection to the hub is lost, the dispatch loop asks this module
//! whether to reconnect now, wait, or give up. Every policy is a variant of the
//! closed [`RetryPolicy`] enum and is interpreted by exactly two functions:
//! [`delay_for`], which draws the wait for a given attempt, and
//! [`RetryState::decide`], which is a pure function of the recorded state and
//! the current instant.
//!
//! # Algorithm
//!
//! The wait is drawn once per failure (so jitter is stable while the loop
//! polls) and then compared against the time elapsed since that failure:
//!
//! ```text
//! exponential[n] = min(initial * multiplier^(n-1), max_delay)
//! jittered[n]    = exponential[n] + uniform(0, exponential[n] * jitter_ratio)
//! ```
//!
//! With the defaults (initial=1s, multiplier=2, max=60s):
//! - Attempt 1: wait 1s
//! - Attempt 2: wait 2s
//! - Attempt 3: wait 4s
//! - ...
//! - Attempt 7+: wait 60s (capped)
//!
//! A non-zero timeout limit bounds the whole sequence: once the time since the
//! first failure reaches it, [`RetryDecision::Stop`] is returned and the
//! client reports a fatal connection status.
//!
//! # Examples
//!
//! ```ignore
//! let mut state = RetryState::new(RetryPolicy::ExponentialBackoff, 300, RetryTiming::default());
//! state.record_failure(now, &mut rand::rng());
//! match state.decide(now) {
//!     RetryDecision::RetryNow => transport.open()?,
//!     RetryDecision::Wait(d) => debug!("next attempt in {d:?}"),
//!     RetryDecision::Stop => error!("giving up"),
//! }
//! ```

use std::{
    fmt,
    time::{Duration, Instant},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Reconnect strategy applied after a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never reconnect; the first failure is fatal.
    None,
    /// Reconnect immediately after every failure.
    Immediate,
    /// Reconnect after a fixed interval.
    Interval,
    /// Double the wait after every failed attempt, up to a cap.
    ExponentialBackoff,
    /// Exponential backoff plus a bounded random offset, which spreads
    /// reconnects of a fleet that lost the hub at the same moment.
    ExponentialBackoffWithJitter,
    /// A uniformly random wait up to the cap.
    Random,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::None => "none",
            RetryPolicy::Immediate => "immediate",
            RetryPolicy::Interval => "interval",
            RetryPolicy::ExponentialBackoff => "exponential_backoff",
            RetryPolicy::ExponentialBackoffWithJitter => "exponential_backoff_with_jitter",
            RetryPolicy::Random => "random",
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoffWithJitter
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing parameters shared by all policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryTiming {
    /// Fixed wait used by [`RetryPolicy::Interval`].
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Retry interval must be between 1 and 3600 seconds"
    ))]
    pub interval_secs: u64,

    /// First wait of the exponential policies.
    #[validate(range(
        min = 1,
        max = 600_000,
        message = "Initial retry delay must be between 1ms and 600s"
    ))]
    pub initial_delay_ms: u64,

    /// Cap for the exponential and random policies.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Max retry delay must be between 1 and 3600 seconds"
    ))]
    pub max_delay_secs: u64,

    /// Growth factor between consecutive exponential waits.
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Retry multiplier must be between 1.0 and 10.0"
    ))]
    pub multiplier: f64,

    /// Upper bound of the jitter offset, as a fraction of the exponential wait.
    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "Jitter ratio must be between 0.0 and 1.0"
    ))]
    pub jitter_ratio: f64,
}

impl Default for RetryTiming {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            initial_delay_ms: 1_000,
            max_delay_secs: 60,
            multiplier: 2.0,
            jitter_ratio: 0.5,
        }
    }
}

impl RetryTiming {
    fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Verdict of [`RetryState::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    Wait(Duration),
    Stop,
}

/// Returns the wait before reconnect attempt number `attempt` (1-based).
pub fn delay_for<R: Rng + ?Sized>(
    policy: RetryPolicy,
    attempt: u32,
    timing: &RetryTiming,
    rng: &mut R,
) -> Duration {
    match policy {
        RetryPolicy::None | RetryPolicy::Immediate => Duration::ZERO,
        RetryPolicy::Interval => Duration::from_secs(timing.interval_secs),
        RetryPolicy::ExponentialBackoff => exponential(attempt, timing),
        RetryPolicy::ExponentialBackoffWithJitter => {
            let base = exponential(attempt, timing);
            let spread = base.as_secs_f64() * timing.jitter_ratio;
            base + Duration::from_secs_f64(rng.random_range(0.0..=spread))
        }
        RetryPolicy::Random => {
            let cap = timing.max_delay().as_secs_f64();
            Duration::from_secs_f64(rng.random_range(0.0..=cap))
        }
    }
}

fn exponential(attempt: u32, timing: &RetryTiming) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let cap = timing.max_delay().as_secs_f64();
    let secs = timing.initial_delay().as_secs_f64() * timing.multiplier.powi(exponent);
    // powi overflows to infinity for long outages; min() folds it back to the cap
    Duration::from_secs_f64(secs.min(cap))
}

/// Book-keeping for the current run of connection failures.
///
/// Empty (no failure recorded) while connected; emptied again by
/// [`RetryState::reset`] on every successful connect.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,

    /// Zero means unlimited.
    timeout: Duration,

    timing: RetryTiming,

    first_failure: Option<Instant>,

    last_attempt: Option<Instant>,

    attempt: u32,

    /// Wait drawn for the current attempt by `record_failure`.
    scheduled_delay: Duration,
}

impl RetryState {
    pub fn new(policy: RetryPolicy, timeout_secs: u64, timing: RetryTiming) -> Self {
        Self {
            policy,
            timeout: Duration::from_secs(timeout_secs),
            timing,
            first_failure: None,
            last_attempt: None,
            attempt: 0,
            scheduled_delay: Duration::ZERO,
        }
    }

    /// Replaces policy and timeout. Failure history is discarded.
    pub fn set_policy(&mut self, policy: RetryPolicy, timeout_secs: u64) {
        self.policy = policy;
        self.timeout = Duration::from_secs(timeout_secs);
        self.reset();
    }

    pub fn timing_mut(&mut self) -> &mut RetryTiming {
        &mut self.timing
    }

    pub fn timing(&self) -> &RetryTiming {
        &self.timing
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Number of failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn first_failure(&self) -> Option<Instant> {
        self.first_failure
    }

    pub fn scheduled_delay(&self) -> Duration {
        self.scheduled_delay
    }

    /// True when no failure has been recorded since the last reset.
    pub fn is_empty(&self) -> bool {
        self.first_failure.is_none() && self.attempt == 0
    }

    /// Records a failed connection (a drop or a failed attempt) at `now` and
    /// draws the wait before the next attempt.
    pub fn record_failure<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) {
        self.first_failure.get_or_insert(now);
        self.last_attempt = Some(now);
        self.attempt = self.attempt.saturating_add(1);
        self.scheduled_delay = delay_for(self.policy, self.attempt, &self.timing, rng);
    }

    /// Forgets the failure history. Called on successful connect.
    pub fn reset(&mut self) {
        self.first_failure = None;
        self.last_attempt = None;
        self.attempt = 0;
        self.scheduled_delay = Duration::ZERO;
    }

    /// Decides what to do at `now`. Pure: repeated calls with the same
    /// arguments return the same verdict.
    pub fn decide(&self, now: Instant) -> RetryDecision {
        let Some(first) = self.first_failure else {
            // Nothing has failed yet: this is the initial connect.
            return RetryDecision::RetryNow;
        };

        if self.policy == RetryPolicy::None {
            return RetryDecision::Stop;
        }

        let since_first = now.saturating_duration_since(first);
        if !self.timeout.is_zero() && since_first >= self.timeout {
            return RetryDecision::Stop;
        }

        let since_last = now.saturating_duration_since(self.last_attempt.unwrap_or(first));
        if since_last >= self.scheduled_delay {
            return RetryDecision::RetryNow;
        }

        let mut wait = self.scheduled_delay - since_last;
        if !self.timeout.is_zero() {
            wait = wait.min(self.timeout - since_first);
        }
        RetryDecision::Wait(wait)
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), 0, RetryTiming::default())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn test_initial_connect_is_immediate() {
        let state = RetryState::new(RetryPolicy::None, 0, RetryTiming::default());
        assert!(state.is_empty());
        assert_eq!(state.decide(Instant::now()), RetryDecision::RetryNow);
    }

    #[test]
    fn test_none_policy_stops_after_first_failure() {
        let mut state = RetryState::new(RetryPolicy::None, 0, RetryTiming::default());
        let now = Instant::now();
        state.record_failure(now, &mut rng());
        assert_eq!(state.decide(now), RetryDecision::Stop);
    }

    #[test]
    fn test_immediate_policy_retries_without_wait() {
        let mut state = RetryState::new(RetryPolicy::Immediate, 0, RetryTiming::default());
        let now = Instant::now();
        state.record_failure(now, &mut rng());
        assert_eq!(state.decide(now), RetryDecision::RetryNow);
    }

    #[test]
    fn test_interval_policy_waits_fixed_interval() {
        let mut state = RetryState::new(RetryPolicy::Interval, 0, RetryTiming::default());
        let now = Instant::now();
        state.record_failure(now, &mut rng());

        assert_eq!(
            state.decide(now + Duration::from_secs(2)),
            RetryDecision::Wait(Duration::from_secs(3))
        );
        assert_eq!(
            state.decide(now + Duration::from_secs(5)),
            RetryDecision::RetryNow
        );
    }

    #[test]
    fn test_exponential_progression_and_cap() {
        let timing = RetryTiming::default();
        let mut r = rng();
        let delays: Vec<u64> = (1..=8)
            .map(|n| delay_for(RetryPolicy::ExponentialBackoff, n, &timing, &mut r).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_exponential_survives_huge_attempt_counts() {
        let timing = RetryTiming::default();
        let delay = delay_for(RetryPolicy::ExponentialBackoff, u32::MAX, &timing, &mut rng());
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let timing = RetryTiming::default();
        let mut r = rng();
        for attempt in 1..=10 {
            let base = exponential(attempt, &timing);
            let jittered = delay_for(
                RetryPolicy::ExponentialBackoffWithJitter,
                attempt,
                &timing,
                &mut r,
            );
            assert!(jittered >= base);
            assert!(jittered <= base.mul_f64(1.0 + timing.jitter_ratio));
        }
    }

    #[test]
    fn test_random_policy_within_cap() {
        let timing = RetryTiming::default();
        let mut r = rng();
        for attempt in 1..=20 {
            let delay = delay_for(RetryPolicy::Random, attempt, &timing, &mut r);
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_jittered_retries_never_outlive_timeout() {
        let mut state = RetryState::new(
            RetryPolicy::ExponentialBackoffWithJitter,
            30,
            RetryTiming::default(),
        );
        let mut r = rng();
        let start = Instant::now();
        let mut now = start;
        state.record_failure(now, &mut r);

        loop {
            match state.decide(now) {
                RetryDecision::RetryNow => {
                    assert!(now.duration_since(start) < Duration::from_secs(30));
                    // the attempt fails straight away
                    state.record_failure(now, &mut r);
                }
                RetryDecision::Wait(d) => {
                    assert!(now.duration_since(start) + d <= Duration::from_secs(30));
                    now += d;
                }
                RetryDecision::Stop => break,
            }
        }
        assert!(now.duration_since(start) >= Duration::from_secs(30));
        assert!(state.attempt() > 1);
    }

    #[test]
    fn test_reset_empties_state() {
        let mut state = RetryState::default();
        let now = Instant::now();
        state.record_failure(now, &mut rng());
        state.record_failure(now, &mut rng());
        assert_eq!(state.attempt(), 2);

        state.reset();
        assert!(state.is_empty());
        assert_eq!(state.scheduled_delay(), Duration::ZERO);
        assert_eq!(state.decide(now), RetryDecision::RetryNow);
    }

    #[test]
    fn test_set_policy_discards_history() {
        let mut state = RetryState::default();
        state.record_failure(Instant::now(), &mut rng());
        state.set_policy(RetryPolicy::Interval, 120);
        assert!(state.is_empty());
        assert_eq!(state.policy(), RetryPolicy::Interval);
        assert_eq!(state.timeout_secs(), 120);
    }

    #[test]
    fn test_timing_validation() {
        let timing = RetryTiming {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(timing.validate().is_err());
        assert!(RetryTiming::default().validate().is_ok());
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&RetryPolicy::ExponentialBackoffWithJitter).unwrap();
        assert_eq!(json, "\"exponential_backoff_with_jitter\"");
        let parsed: RetryPolicy = serde_json::from_str("\"interval\"").unwrap();
        assert_eq!(parsed, RetryPolicy::Interval);
    }
}
