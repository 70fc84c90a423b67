//! Stream entry point: `GET /api/stream?url=<source>&type=hls|fmp4`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::session::{CloseReason, OutputMode, StreamSession};
use crate::transcoder::TranscoderOutput;
use crate::utils::fs;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Read size for transcoder output.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Output chunks queued toward the response before forwarding pauses.
const FORWARD_QUEUE: usize = 8;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

pub async fn stream_get(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;

    let mode = match query.kind.as_deref() {
        None | Some("") => OutputMode::Segmented,
        Some(kind) => OutputMode::from_query(kind)
            .ok_or_else(|| ApiError::bad_request(format!("Unsupported stream type '{kind}'")))?,
    };

    let session = state.registry.open(url, mode).await?;

    match mode {
        OutputMode::Segmented => serve_manifest(&state, &session).await,
        OutputMode::Continuous => serve_continuous(&state, session),
    }
}

async fn serve_manifest(state: &AppState, session: &StreamSession) -> ApiResult<Response> {
    let path = session
        .output_dir()
        .join(&state.registry.config().playlist_name);
    let manifest = fs::read(&path).await?;
    session.mark_serving();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PLAYLIST_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(manifest.len()));

    Ok((StatusCode::OK, headers, manifest).into_response())
}

fn serve_continuous(state: &AppState, session: Arc<StreamSession>) -> ApiResult<Response> {
    let Some(output) = session.transcoder().take_output() else {
        session.drain(CloseReason::InitializationFailed);
        return Err(ApiError::internal("Transcoder output unavailable"));
    };
    session.mark_serving();

    let (tx, mut rx) = mpsc::channel(FORWARD_QUEUE);
    let stall_timeout = state.registry.config().client_stall_timeout;
    tokio::spawn(forward_output(Arc::clone(&session), output, tx, stall_timeout));

    // The body owns the guard; dropping the response drains the session.
    let guard = DrainOnDrop(session);
    let stream = futures::stream::poll_fn(move |cx| {
        let _ = &guard;
        rx.poll_recv(cx)
    });

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

/// Copy transcoder output into the response, pausing while the client is slow.
async fn forward_output(
    session: Arc<StreamSession>,
    mut output: TranscoderOutput,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    stall_timeout: Duration,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buf.reserve(READ_CHUNK_SIZE);
        let read = tokio::select! {
            _ = tx.closed() => {
                session.drain(CloseReason::ClientDisconnected);
                break;
            }
            read = output.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(session_id = %session.id(), "Transcoder output ended");
                break;
            }
            Ok(_) => match tx.send_timeout(Ok(buf.split().freeze()), stall_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(session_id = %session.id(), "Client stalled, closing stream");
                    session.drain(CloseReason::ClientStalled);
                    break;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    session.drain(CloseReason::ClientDisconnected);
                    break;
                }
            },
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "Failed to read transcoder output");
                break;
            }
        }
    }
}

struct DrainOnDrop(Arc<StreamSession>);

impl Drop for DrainOnDrop {
    fn drop(&mut self) {
        if self.0.drain(CloseReason::ClientDisconnected) {
            debug!(session_id = %self.0.id(), "Client disconnected");
        }
    }
}
