//! Handle to one running transcoder.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Readable transcoder output (continuous mode).
pub type TranscoderOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Result of a non-blocking write to the transcoder input.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The chunk was queued for the process.
    Written,
    /// The input is saturated; the chunk is handed back untouched.
    WouldBlock(Bytes),
    /// The input is closed; the chunk was dropped.
    Closed,
}

/// Writable side of the transcoder's input pipe.
///
/// Bounded: a saturated input reports [`WriteOutcome::WouldBlock`] instead of
/// queueing more, and [`TranscoderInput::write`] waits for capacity. Writes to a
/// closed input drop the chunk silently.
#[derive(Debug, Clone)]
pub struct TranscoderInput {
    tx: mpsc::Sender<Bytes>,
}

impl TranscoderInput {
    pub fn try_write(&self, chunk: Bytes) -> WriteOutcome {
        match self.tx.try_send(chunk) {
            Ok(()) => WriteOutcome::Written,
            Err(TrySendError::Full(chunk)) => WriteOutcome::WouldBlock(chunk),
            Err(TrySendError::Closed(_)) => WriteOutcome::Closed,
        }
    }

    /// Write once the input has drained enough to accept the chunk.
    ///
    /// Returns `false` if the input closed instead.
    pub async fn write(&self, chunk: Bytes) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// Wait for room for one chunk. `None` once the input closed.
    pub async fn reserve(&self) -> Option<mpsc::Permit<'_, Bytes>> {
        self.tx.reserve().await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// How the transcoder ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscoderExit {
    pub code: Option<i32>,
    /// Whether the exit followed a termination request.
    pub requested: bool,
}

/// Process-side endpoints, held by whatever drives the actual process.
pub struct TranscoderProcessSide {
    /// Chunks written by the session, in order.
    pub input: mpsc::Receiver<Bytes>,
    pub exit: ExitReporter,
}

/// Publishes the process exit and observes termination requests.
pub struct ExitReporter {
    exit: watch::Sender<Option<TranscoderExit>>,
    terminate: CancellationToken,
}

impl ExitReporter {
    /// Cancelled when the session asks the process to stop.
    pub fn terminate_token(&self) -> &CancellationToken {
        &self.terminate
    }

    /// Report the process exit. Later reports are ignored.
    pub fn report_exit(&self, code: Option<i32>) {
        let requested = self.terminate.is_cancelled();
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(TranscoderExit { code, requested });
            true
        });
    }
}

/// Session-owned handle to a transcoder process.
pub struct TranscoderHandle {
    input: TranscoderInput,
    output: Mutex<Option<TranscoderOutput>>,
    exit: watch::Receiver<Option<TranscoderExit>>,
    terminate: CancellationToken,
}

impl TranscoderHandle {
    /// Create a handle plus the endpoints its process driver uses.
    pub fn channel(
        input_queue: usize,
        output: Option<TranscoderOutput>,
    ) -> (TranscoderHandle, TranscoderProcessSide) {
        let (input_tx, input_rx) = mpsc::channel(input_queue.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminate = CancellationToken::new();

        let handle = TranscoderHandle {
            input: TranscoderInput { tx: input_tx },
            output: Mutex::new(output),
            exit: exit_rx,
            terminate: terminate.clone(),
        };
        let side = TranscoderProcessSide {
            input: input_rx,
            exit: ExitReporter {
                exit: exit_tx,
                terminate,
            },
        };
        (handle, side)
    }

    pub fn input(&self) -> TranscoderInput {
        self.input.clone()
    }

    /// Take the output stream. Only the first call gets it.
    pub fn take_output(&self) -> Option<TranscoderOutput> {
        self.output.lock().take()
    }

    /// Request graceful termination. Idempotent.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn exit_status(&self) -> Option<TranscoderExit> {
        *self.exit.borrow()
    }

    /// Resolves once the process has exited.
    pub async fn exited(&self) -> TranscoderExit {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await.map(|e| *e);
        match result {
            Ok(Some(exit)) => exit,
            // The driver went away without reporting; treat as an exit.
            _ => TranscoderExit {
                code: None,
                requested: self.terminate.is_cancelled(),
            },
        }
    }
}
