use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Parameters shared by every bucket a limiter creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Time it takes to earn back a single token.
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
    /// Maximum number of tokens the bucket can hold.
    pub burst: u32,
}

impl BucketSettings {
    pub fn new(refill_interval: Duration, burst: u32) -> Self {
        Self {
            refill_interval,
            burst,
        }
    }

    pub fn build(&self) -> TokenBucket {
        TokenBucket::new(self.refill_interval, self.burst)
    }

    /// Time for an empty bucket to refill completely.
    pub fn full_refill(&self) -> Duration {
        self.refill_interval.saturating_mul(self.burst)
    }
}

/// Token bucket safe to share between concurrently running requests.
///
/// Starts full. Every call refills `elapsed / refill_interval` tokens (capped at
/// `burst`) before trying to take one whole token.
#[derive(Debug)]
pub struct TokenBucket {
    refill_interval: Duration,
    burst: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(refill_interval: Duration, burst: u32) -> Self {
        Self {
            refill_interval,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock reading.
    ///
    /// Readings older than the last refill count as zero elapsed time.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, including fractional refill.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// How long until one whole token is available. Zero if one already is.
    pub fn time_until_available(&self) -> Duration {
        self.time_until_available_at(Instant::now())
    }

    pub fn time_until_available_at(&self, now: Instant) -> Duration {
        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }

        self.refill_interval.mul_f64(1.0 - state.tokens)
    }

    /// Timestamp of the most recent admission check.
    pub fn last_activity(&self) -> Instant {
        self.lock().last_refill
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // Bucket state is two plain numbers; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let burst = self.burst as f64;
        let earned = if self.refill_interval.is_zero() {
            burst
        } else {
            elapsed.as_secs_f64() / self.refill_interval.as_secs_f64()
        };

        state.tokens = (state.tokens + earned).min(burst);
        state.last_refill = now;
    }
}
