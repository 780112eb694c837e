//! Bounded, thread-safe ring of frames.
//!
//! Two overflow policies are selected at construction: `DropNewest` (used
//! for the PCM ingest ring — preserve what's already queued, reject the
//! newcomer) and `DropOldest` (used for the MP3 output ring — broadcast
//! freshness matters more than history). See DESIGN.md for why each ring
//! gets the policy it does. The PCM ring is fixed-size ([`FrameRing::new`]);
//! the MP3 ring's frames vary by bitrate/padding, so it is constructed with
//! [`FrameRing::new_variable`] instead.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

/// Overflow policy applied when a [`FrameRing`] is full at push time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the incoming frame; already-queued frames are unchanged.
    DropNewest,
    /// Evict the oldest queued frame to admit the newest.
    DropOldest,
}

/// Outcome of a [`FrameRing::push`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Dropped,
}

/// Point-in-time occupancy/overflow counters for a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub count: usize,
    pub overflow_count: u64,
}

impl RingStats {
    /// Fraction of capacity currently occupied, in `[0.0, 1.0]`.
    pub fn ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.count as f64 / self.capacity as f64
        }
    }
}

struct Inner {
    queue: VecDeque<Bytes>,
    overflow_count: u64,
}

/// Whether a ring enforces one fixed frame size (the PCM ingest ring, where
/// every frame is exactly `CANONICAL_FRAME_BYTES`) or accepts any non-empty
/// frame (the MP3 output ring, where CBR/VBR frames vary in length).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizePolicy {
    Fixed(usize),
    Variable,
}

/// A bounded FIFO of frames, O(1) push/pop under a single lock.
pub struct FrameRing {
    capacity: usize,
    size_policy: SizePolicy,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
}

impl FrameRing {
    /// Creates a ring with the given capacity (in frames), expected frame
    /// size (in bytes, e.g. `CANONICAL_FRAME_BYTES`), and overflow policy.
    /// Use this for rings whose frames are always the same size, such as
    /// the PCM ingest ring.
    pub fn new(capacity: usize, frame_size: usize, policy: OverflowPolicy) -> Self {
        Self::with_size_policy(capacity, SizePolicy::Fixed(frame_size), policy)
    }

    /// Creates a ring that accepts any non-empty frame regardless of
    /// length, for streams of inherently variable-size frames (e.g. the
    /// MP3 output ring, where CBR/VBR frame lengths differ by header).
    pub fn new_variable(capacity: usize, policy: OverflowPolicy) -> Self {
        Self::with_size_policy(capacity, SizePolicy::Variable, policy)
    }

    fn with_size_policy(capacity: usize, size_policy: SizePolicy, policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            size_policy,
            policy,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                overflow_count: 0,
            }),
        }
    }

    /// Pushes a frame. Rejects empty frames outright, and (for fixed-size
    /// rings) frames of the wrong size — these are not "dropped due to
    /// overflow", they are never valid input.
    pub fn push(&self, frame: Bytes) -> PushOutcome {
        if frame.is_empty() {
            return PushOutcome::Dropped;
        }
        if let SizePolicy::Fixed(expected) = self.size_policy {
            if frame.len() != expected {
                return PushOutcome::Dropped;
            }
        }

        let mut inner = self.inner.lock();
        if inner.queue.len() < self.capacity {
            inner.queue.push_back(frame);
            return PushOutcome::Accepted;
        }

        match self.policy {
            OverflowPolicy::DropNewest => {
                inner.overflow_count += 1;
                PushOutcome::Dropped
            }
            OverflowPolicy::DropOldest => {
                inner.queue.pop_front();
                inner.queue.push_back(frame);
                inner.overflow_count += 1;
                PushOutcome::Accepted
            }
        }
    }

    /// Pops the oldest frame, or `None` if empty. Never blocks.
    pub fn pop(&self) -> Option<Bytes> {
        self.inner.lock().queue.pop_front()
    }

    /// Returns current capacity/count/overflow_count.
    pub fn stats(&self) -> RingStats {
        let inner = self.inner.lock();
        RingStats {
            capacity: self.capacity,
            count: inner.queue.len(),
            overflow_count: inner.overflow_count,
        }
    }

    /// Drops all queued frames; overflow_count is left untouched.
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(size: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; size])
    }

    #[test]
    fn push_rejects_empty_frame() {
        let ring = FrameRing::new(4, 16, OverflowPolicy::DropNewest);
        assert_eq!(ring.push(Bytes::new()), PushOutcome::Dropped);
        assert_eq!(ring.stats().count, 0);
    }

    #[test]
    fn push_rejects_wrong_size_frame() {
        let ring = FrameRing::new(4, 16, OverflowPolicy::DropNewest);
        assert_eq!(ring.push(frame(8, 1)), PushOutcome::Dropped);
        assert_eq!(ring.stats().count, 0);
    }

    #[test]
    fn drop_newest_preserves_queued_elements_on_overflow() {
        let ring = FrameRing::new(2, 16, OverflowPolicy::DropNewest);
        assert_eq!(ring.push(frame(16, 1)), PushOutcome::Accepted);
        assert_eq!(ring.push(frame(16, 2)), PushOutcome::Accepted);
        assert_eq!(ring.push(frame(16, 3)), PushOutcome::Dropped);

        let stats = ring.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.overflow_count, 1);
        assert_eq!(ring.pop(), Some(frame(16, 1)));
        assert_eq!(ring.pop(), Some(frame(16, 2)));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn drop_oldest_evicts_head_on_overflow() {
        let ring = FrameRing::new(2, 16, OverflowPolicy::DropOldest);
        assert_eq!(ring.push(frame(16, 1)), PushOutcome::Accepted);
        assert_eq!(ring.push(frame(16, 2)), PushOutcome::Accepted);
        assert_eq!(ring.push(frame(16, 3)), PushOutcome::Accepted);

        let stats = ring.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.overflow_count, 1);
        assert_eq!(ring.pop(), Some(frame(16, 2)));
        assert_eq!(ring.pop(), Some(frame(16, 3)));
    }

    #[test]
    fn variable_ring_accepts_differently_sized_frames() {
        let ring = FrameRing::new_variable(4, OverflowPolicy::DropOldest);
        assert_eq!(ring.push(frame(200, 1)), PushOutcome::Accepted);
        assert_eq!(ring.push(frame(417, 2)), PushOutcome::Accepted);
        assert_eq!(ring.pop().map(|f| f.len()), Some(200));
        assert_eq!(ring.pop().map(|f| f.len()), Some(417));
    }

    #[test]
    fn variable_ring_still_rejects_empty_frames() {
        let ring = FrameRing::new_variable(4, OverflowPolicy::DropOldest);
        assert_eq!(ring.push(Bytes::new()), PushOutcome::Dropped);
    }

    #[test]
    fn pop_on_empty_never_blocks_and_returns_none() {
        let ring = FrameRing::new(4, 16, OverflowPolicy::DropOldest);
        assert_eq!(ring.pop(), None);
    }

    proptest! {
        #[test]
        fn count_stays_in_bounds_and_tracks_accepted_minus_popped(
            ops in proptest::collection::vec(proptest::bool::ANY, 0..200),
            policy_is_drop_oldest in proptest::bool::ANY,
        ) {
            let policy = if policy_is_drop_oldest { OverflowPolicy::DropOldest } else { OverflowPolicy::DropNewest };
            let capacity = 8;
            let ring = FrameRing::new(capacity, 16, policy);
            let mut accepted = 0u64;
            let mut popped = 0u64;

            for (i, do_push) in ops.iter().enumerate() {
                if *do_push {
                    if ring.push(frame(16, (i % 256) as u8)) == PushOutcome::Accepted {
                        accepted += 1;
                    }
                } else if ring.pop().is_some() {
                    popped += 1;
                }
                let stats = ring.stats();
                prop_assert!(stats.count <= capacity);
            }

            prop_assert_eq!(ring.stats().count as u64, accepted - popped);
        }
    }
}
