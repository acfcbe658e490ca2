use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use docstore::id_alloc::{decompose, Clock, IdAllocator, EPOCH_MS, MAX_WORKER_ID};
use parking_lot::Mutex;

/// Replays scripted readings, then keeps returning the last one plus one per call.
struct ScriptedClock {
    readings: Mutex<VecDeque<i64>>,
    after: Mutex<i64>,
}

impl ScriptedClock {
    fn new(readings: &[i64]) -> Self {
        Self {
            readings: Mutex::new(readings.iter().copied().collect()),
            after: Mutex::new(*readings.last().unwrap()),
        }
    }
}

impl Clock for ScriptedClock {
    fn now_millis(&self) -> i64 {
        if let Some(next) = self.readings.lock().pop_front() {
            return next;
        }
        let mut after = self.after.lock();
        *after += 1;
        *after
    }
}

#[test]
fn test_ids_are_strictly_increasing() {
    let ids = IdAllocator::new(5).unwrap();
    let mut last = 0;
    for _ in 0..50_000 {
        let id = ids.next_id();
        assert!(id > last);
        last = id;
    }
}

#[test]
fn test_id_layout() {
    let t = EPOCH_MS + 123_456;
    let ids = IdAllocator::with_clock(42, Arc::new(ScriptedClock::new(&[t, t, t]))).unwrap();

    let (ts, worker, seq) = decompose(ids.next_id());
    assert_eq!((ts, worker, seq), (t, 42, 0));
    let (_, _, seq) = decompose(ids.next_id());
    assert_eq!(seq, 1);
    assert_eq!(ids.worker_id(), 42);
}

#[test]
fn test_rejects_out_of_range_worker() {
    assert!(IdAllocator::new(MAX_WORKER_ID).is_ok());
    assert!(IdAllocator::new(MAX_WORKER_ID + 1).is_err());
}

#[test]
fn test_backward_clock_jump_waits() {
    let t = EPOCH_MS + 10_000;
    // Second reading jumps 5ms back; the allocator must wait it out.
    let clock = ScriptedClock::new(&[t, t - 5, t - 4, t - 1, t, t]);
    let ids = IdAllocator::with_clock(1, Arc::new(clock)).unwrap();

    let first = ids.next_id();
    let second = ids.next_id();
    assert!(second > first);

    let (ts, _, seq) = decompose(second);
    assert_eq!(ts, t);
    assert_eq!(seq, 1);
}

#[test]
fn test_sequence_overflow_rolls_into_next_millisecond() {
    let t = EPOCH_MS + 77;
    // Same millisecond for longer than the sequence can absorb.
    let mut readings = vec![t; 16_384 + 10];
    readings.push(t + 1);
    let ids = IdAllocator::with_clock(0, Arc::new(ScriptedClock::new(&readings))).unwrap();

    let mut last = 0;
    let mut rolled = None;
    for _ in 0..16_385 {
        let id = ids.next_id();
        assert!(id > last);
        last = id;
        let (ts, _, seq) = decompose(id);
        if ts > t {
            rolled = Some(seq);
        }
    }
    assert_eq!(rolled, Some(0));
}

#[test]
fn test_concurrent_callers_never_collide() {
    let ids = Arc::new(IdAllocator::new(9).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ids = Arc::clone(&ids);
            std::thread::spawn(move || (0..5_000).map(|_| ids.next_id()).collect::<Vec<_>>())
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let batch = handle.join().unwrap();
        assert!(batch.windows(2).all(|w| w[0] < w[1]));
        for id in batch {
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
    assert_eq!(seen.len(), 40_000);
}
