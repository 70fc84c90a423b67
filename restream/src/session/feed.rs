//! Chunk delivery from a capture source into a transcoder.
//!
//! Segmented sessions forward chunks as they arrive and wait on the transcoder's
//! back-pressure. Continuous sessions write directly during a pre-buffer window,
//! then switch to a paced drain from a bounded [`ChunkBuffer`].

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::buffer::{ChunkBuffer, Evicted};
use crate::transcoder::{TranscoderInput, WriteOutcome};

/// Pacing parameters of the continuous drain loop.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Target bitrate used to turn buffered bytes into seconds.
    pub bitrate: u64,
    /// Pre-buffer delay and target buffering window.
    pub window: Duration,
    /// Buffer capacity in bytes.
    pub capacity: usize,
    /// Re-check interval while the buffer holds less than the window.
    pub recheck: Duration,
    /// Delay between two paced writes.
    pub pacing: Duration,
}

/// Counters reported when a feed stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedStats {
    /// Chunks written straight to the transcoder.
    pub direct_writes: u64,
    /// Chunks written by the paced drain.
    pub paced_writes: u64,
    /// Time from feed start to the first paced write.
    pub first_paced_after: Option<Duration>,
    /// Chunks and bytes dropped by buffer eviction.
    pub evicted: Evicted,
    /// Chunks dropped because the transcoder input was closed.
    pub dropped_closed: u64,
}

impl FeedStats {
    fn record_paced(&mut self, started: Instant) {
        self.paced_writes += 1;
        if self.first_paced_after.is_none() {
            self.first_paced_after = Some(started.elapsed());
        }
    }

    fn record_eviction(&mut self, evicted: Evicted, session_id: &str) {
        if evicted.is_empty() {
            return;
        }
        self.evicted.chunks += evicted.chunks;
        self.evicted.bytes += evicted.bytes;
        debug!(
            session_id,
            chunks = evicted.chunks,
            bytes = evicted.bytes,
            "Chunk buffer overflow, dropped oldest chunks"
        );
    }
}

/// Forward chunks as they arrive, waiting whenever the transcoder input is saturated.
pub async fn run_direct_feed(
    mut chunks: mpsc::Receiver<Bytes>,
    input: TranscoderInput,
    stop: CancellationToken,
) -> FeedStats {
    let mut stats = FeedStats::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        match input.try_write(chunk) {
            WriteOutcome::Written => stats.direct_writes += 1,
            WriteOutcome::Closed => stats.dropped_closed += 1,
            WriteOutcome::WouldBlock(chunk) => {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    written = input.write(chunk) => {
                        if written {
                            stats.direct_writes += 1;
                        } else {
                            stats.dropped_closed += 1;
                        }
                    }
                }
            }
        }
    }

    stats
}

/// Pre-buffer, then drain the chunk buffer at a steady pace.
pub async fn run_paced_feed(
    mut chunks: mpsc::Receiver<Bytes>,
    input: TranscoderInput,
    stop: CancellationToken,
    config: PacingConfig,
    session_id: &str,
) -> FeedStats {
    let started = Instant::now();
    let prebuffer_deadline = started + config.window;
    let window_secs = config.window.as_secs_f64();

    let mut stats = FeedStats::default();
    let mut buffer = ChunkBuffer::new(config.capacity);
    let mut chunks_open = true;

    // Pre-buffer window: straight through until the transcoder pushes back. From
    // then on chunks queue behind the overflow so they reach it in capture order.
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return stats,
            _ = tokio::time::sleep_until(prebuffer_deadline) => break,
            chunk = chunks.recv(), if chunks_open => match chunk {
                Some(chunk) if !buffer.is_empty() => {
                    let evicted = buffer.push(chunk);
                    stats.record_eviction(evicted, session_id);
                }
                Some(chunk) => match input.try_write(chunk) {
                    WriteOutcome::Written => stats.direct_writes += 1,
                    WriteOutcome::Closed => stats.dropped_closed += 1,
                    WriteOutcome::WouldBlock(chunk) => {
                        let evicted = buffer.push(chunk);
                        stats.record_eviction(evicted, session_id);
                    }
                },
                None => chunks_open = false,
            },
        }
    }

    debug!(
        session_id,
        buffered_bytes = buffer.buffered_bytes(),
        "Pre-buffer window elapsed, starting paced drain"
    );

    // Steady state: every chunk goes through the buffer.
    let mut pending: Option<Bytes> = None;
    let mut next_tick = Instant::now();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            permit = input.reserve(), if pending.is_some() => {
                match (permit, pending.take()) {
                    (Some(permit), Some(chunk)) => {
                        permit.send(chunk);
                        stats.record_paced(started);
                    }
                    _ => stats.dropped_closed += 1,
                }
                next_tick = Instant::now() + config.pacing;
            }
            chunk = chunks.recv(), if chunks_open => match chunk {
                Some(chunk) => {
                    let evicted = buffer.push(chunk);
                    stats.record_eviction(evicted, session_id);
                }
                None => chunks_open = false,
            },
            _ = tokio::time::sleep_until(next_tick), if pending.is_none() => {
                let chunk = if buffer.buffered_secs(config.bitrate) >= window_secs {
                    buffer.pop()
                } else {
                    None
                };
                match chunk {
                    None => next_tick = Instant::now() + config.recheck,
                    Some(chunk) => match input.try_write(chunk) {
                        WriteOutcome::Written => {
                            stats.record_paced(started);
                            next_tick = Instant::now() + config.pacing;
                        }
                        WriteOutcome::Closed => {
                            stats.dropped_closed += 1;
                            next_tick = Instant::now() + config.pacing;
                        }
                        // Hold the chunk until the transcoder drains its input.
                        WriteOutcome::WouldBlock(chunk) => pending = Some(chunk),
                    },
                }
            }
        }
    }

    buffer.clear();
    stats
}
