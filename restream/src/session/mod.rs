//! Stream sessions and the registry that owns them.

mod buffer;
mod feed;
mod id;
pub mod readiness;
mod registry;
mod state;
mod stream;

pub use buffer::{ChunkBuffer, Evicted, window_capacity};
pub use feed::{FeedStats, PacingConfig, run_direct_feed, run_paced_feed};
pub use id::{SessionId, normalize_source};
pub use registry::SessionRegistry;
pub use state::{CloseReason, OutputMode, SessionState};
pub use stream::{SessionInfo, StreamSession};
