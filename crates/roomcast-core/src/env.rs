//! Environment abstraction for deterministic testing.
//!
//! Decouples connection logic from system resources (time, randomness). The
//! server uses `SystemEnv`, tests use [`test_utils::MockEnv`] with a
//! controllable clock and seeded RNG.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Abstract environment providing time and randomness.
///
/// Object-safe so it can be shared as `Arc<dyn Environment>` between
/// connection tasks.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Send + Sync + 'static {
    /// Current monotonic time. Used for durations only.
    fn now(&self) -> Instant;

    /// Current wall-clock time. Stamped on persisted messages and last-seen.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random non-zero `u64`, used for connection handles.
    fn random_handle(&self) -> u64 {
        loop {
            let value = self.random_u64();
            if value != 0 {
                return value;
            }
        }
    }
}

/// Test doubles for [`Environment`].
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use chrono::{DateTime, TimeDelta, Utc};

    use super::Environment;

    /// 2024-01-01T00:00:00Z
    const MOCK_EPOCH_SECS: i64 = 1_704_067_200;

    #[derive(Debug)]
    struct MockState {
        start: Instant,
        elapsed: Duration,
        wall: DateTime<Utc>,
        rng: u64,
    }

    /// Deterministic environment: virtual clock plus seeded RNG.
    ///
    /// Clones share the same clock and RNG.
    #[derive(Debug, Clone)]
    pub struct MockEnv {
        state: Arc<Mutex<MockState>>,
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEnv {
        /// Create an environment with the default seed.
        pub fn new() -> Self {
            Self::with_seed(0x5eed)
        }

        /// Create an environment whose RNG starts from `seed`.
        pub fn with_seed(seed: u64) -> Self {
            let state = MockState {
                start: Instant::now(),
                elapsed: Duration::ZERO,
                wall: DateTime::from_timestamp(MOCK_EPOCH_SECS, 0).unwrap_or_default(),
                rng: seed,
            };
            Self { state: Arc::new(Mutex::new(state)) }
        }

        /// Advance both clocks.
        pub fn advance(&self, by: Duration) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.elapsed += by;
            state.wall += TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
        }
    }

    impl Environment for MockEnv {
        fn now(&self) -> Instant {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.start + state.elapsed
        }

        fn wall_clock(&self) -> DateTime<Utc> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner).wall
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            for chunk in buffer.chunks_mut(8) {
                // splitmix64
                state.rng = state.rng.wrapping_add(0x9e37_79b9_7f4a_7c15);
                let mut z = state.rng;
                z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
                z ^= z >> 31;
                chunk.copy_from_slice(&z.to_be_bytes()[..chunk.len()]);
            }
        }
    }
}
