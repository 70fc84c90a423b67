//! Byte-budgeted FIFO of captured media chunks.

use std::collections::VecDeque;

use bytes::Bytes;

/// What a push had to drop to stay within capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evicted {
    pub chunks: usize,
    pub bytes: usize,
}

impl Evicted {
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

/// Bounded chunk queue with drop-oldest eviction.
///
/// The buffered total never exceeds `capacity` after a push. Whole chunks are
/// evicted from the front; a chunk is never truncated. A single chunk larger than
/// the capacity is therefore dropped along with everything before it.
/// Bytes needed to hold `window_secs` of media at `bitrate` bits per second,
/// scaled by `safety_factor`.
pub fn window_capacity(window_secs: f64, bitrate: u64, safety_factor: f64) -> usize {
    let bytes = window_secs * bitrate as f64 / 8.0 * safety_factor;
    if bytes.is_finite() { bytes.max(0.0) as usize } else { 0 }
}

#[derive(Debug)]
pub struct ChunkBuffer {
    queue: VecDeque<Bytes>,
    buffered: usize,
    capacity: usize,
}

impl ChunkBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            buffered: 0,
            capacity,
        }
    }

    /// Append a chunk, evicting the oldest chunks while over capacity.
    pub fn push(&mut self, chunk: Bytes) -> Evicted {
        self.buffered += chunk.len();
        self.queue.push_back(chunk);

        let mut evicted = Evicted::default();
        while self.buffered > self.capacity {
            let Some(dropped) = self.queue.pop_front() else {
                break;
            };
            self.buffered -= dropped.len();
            evicted.chunks += 1;
            evicted.bytes += dropped.len();
        }
        evicted
    }

    /// Remove and return the oldest chunk.
    pub fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.queue.pop_front()?;
        self.buffered -= chunk.len();
        Some(chunk)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Seconds of media currently buffered at `bitrate` bits per second.
    pub fn buffered_secs(&self, bitrate: u64) -> f64 {
        if bitrate == 0 {
            return 0.0;
        }
        self.buffered as f64 * 8.0 / bitrate as f64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.buffered = 0;
    }
}
