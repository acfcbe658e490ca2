//! Cluster-safe, roughly time-ordered 64-bit identifiers.
//!
//! Layout (most significant bit first):
//!
//! ```text
//! | 41 bits: ms since EPOCH_MS | 9 bits: worker id | 14 bits: sequence |
//! ```
//!
//! Uniqueness across instances relies on every instance being configured with
//! a distinct worker id.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// 2023-01-01T00:00:00Z
pub const EPOCH_MS: i64 = 1_672_502_400_000;

const WORKER_ID_BITS: u8 = 9;
const SEQUENCE_BITS: u8 = 14;
const WORKER_ID_SHIFT: u8 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u8 = SEQUENCE_BITS + WORKER_ID_BITS;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_WORKER_ID: u16 = (1 << WORKER_ID_BITS) - 1;

#[derive(Debug, Error)]
pub enum IdAllocError {
    #[error("worker id {0} out of range (0..={MAX_WORKER_ID})")]
    InvalidWorkerId(u16),
}

/// Millisecond wall clock. Injected so tests can simulate NTP corrections.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

struct AllocState {
    last_timestamp: i64,
    sequence: i64,
}

/// Snowflake-style allocator. Construct once per process and share via `Arc`.
pub struct IdAllocator {
    worker_id: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<AllocState>,
}

impl IdAllocator {
    pub fn new(worker_id: u16) -> Result<Self, IdAllocError> {
        Self::with_clock(worker_id, Arc::new(SystemClock))
    }

    pub fn with_clock(worker_id: u16, clock: Arc<dyn Clock>) -> Result<Self, IdAllocError> {
        if worker_id > MAX_WORKER_ID {
            return Err(IdAllocError::InvalidWorkerId(worker_id));
        }
        Ok(Self {
            worker_id: i64::from(worker_id),
            clock,
            state: Mutex::new(AllocState {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id as u16
    }

    /// Allocate the next identifier.
    ///
    /// Strictly increasing per allocator. If the clock steps backwards this
    /// spins until it catches up with the last issued timestamp; if the
    /// per-millisecond sequence is exhausted it spins into the next millisecond.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();

        let last = state.last_timestamp;
        let mut timestamp = self.clock.now_millis();
        if timestamp < last {
            tracing::warn!(
                behind_ms = last - timestamp,
                "Clock moved backwards, waiting for it to catch up"
            );
            timestamp = self.wait_until(|now| now >= last);
        }

        if timestamp == last {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                timestamp = self.wait_until(|now| now > last);
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;

        ((timestamp - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | state.sequence
    }

    fn wait_until(&self, ready: impl Fn(i64) -> bool) -> i64 {
        loop {
            let now = self.clock.now_millis();
            if ready(now) {
                return now;
            }
            std::hint::spin_loop();
        }
    }
}

/// Split an identifier back into `(timestamp_ms, worker_id, sequence)`.
pub fn decompose(id: i64) -> (i64, u16, u16) {
    let timestamp = (id >> TIMESTAMP_SHIFT) + EPOCH_MS;
    let worker = ((id >> WORKER_ID_SHIFT) & i64::from(MAX_WORKER_ID)) as u16;
    let sequence = (id & SEQUENCE_MASK) as u16;
    (timestamp, worker, sequence)
}
