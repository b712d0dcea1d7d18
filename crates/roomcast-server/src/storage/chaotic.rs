//! Fault-injecting message log.
//!
//! Wraps another log and fails operations either at random (seeded, so runs
//! are reproducible) or on demand via [`ChaoticMessageLog::fail_next_appends`].
//! Used to check that a failed append never reaches subscribers and never
//! leaves a hole in a room's sequence.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use super::{MessageLog, NewMessage, PageOrder, StorageError, StoredMessage};

const DEFAULT_SEED: u64 = 0x00C0_FFEE_5EED;

/// Message log wrapper that injects failures.
///
/// Delegates to an underlying log. Counters and RNG live behind `Arc`, so
/// clones share them.
#[derive(Clone)]
pub struct ChaoticMessageLog<L: MessageLog> {
    inner: L,
    /// Probability in [0.0, 1.0] that an operation fails
    failure_rate: f64,
    /// Seeded source of injected faults
    dice: Arc<Mutex<FaultDice>>,
    /// Appends still scripted to fail
    scripted_failures: Arc<AtomicUsize>,
    /// Operations attempted, failed or not
    operation_count: Arc<AtomicUsize>,
}

/// Seeded xorshift64* generator. Reproducible, not cryptographic.
struct FaultDice {
    state: u64,
}

impl FaultDice {
    fn new(seed: u64) -> Self {
        // xorshift is stuck at zero
        Self { state: seed.max(1) }
    }

    /// Uniform in [0.0, 1.0)
    fn roll(&mut self) -> f64 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        let bits = self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }
}

impl<L: MessageLog> ChaoticMessageLog<L> {
    /// Create a wrapper with the default seed.
    ///
    /// `failure_rate` is clamped to [0.0, 1.0].
    pub fn new(inner: L, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Same failure pattern for the same seed.
    pub fn with_seed(inner: L, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            dice: Arc::new(Mutex::new(FaultDice::new(seed))),
            scripted_failures: Arc::new(AtomicUsize::new(0)),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrapper that only fails when scripted.
    pub fn reliable(inner: L) -> Self {
        Self::new(inner, 0.0)
    }

    /// Make the next `count` appends fail, regardless of the failure rate.
    pub fn fail_next_appends(&self, count: usize) {
        self.scripted_failures.store(count, Ordering::SeqCst);
    }

    /// Wrapped log, for inspecting what actually got stored.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Total number of operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    fn take_scripted_failure(&self) -> bool {
        self.scripted_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn should_fail(&self) -> bool {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
        let roll = self.dice.lock().unwrap_or_else(PoisonError::into_inner).roll();
        roll < self.failure_rate
    }
}

impl<L: MessageLog> MessageLog for ChaoticMessageLog<L> {
    fn append(&self, message: NewMessage) -> Result<StoredMessage, StorageError> {
        let scripted = self.take_scripted_failure();
        if self.should_fail() || scripted {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.append(message)
    }

    fn read_page(
        &self,
        room_id: u64,
        before_sequence: Option<u64>,
        limit: usize,
        order: PageOrder,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        if self.should_fail() {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.read_page(room_id, before_sequence, limit, order)
    }

    fn latest_sequence(&self, room_id: u64) -> Result<Option<u64>, StorageError> {
        if self.should_fail() {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.latest_sequence(room_id)
    }
}
