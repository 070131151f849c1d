//! HTTP over the overlay
//!
//! A fetch resolves as soon as the response headers arrive. The body stays
//! a lazy stream with a single owner: reading it through `body()`, `text()`,
//! `json()` or `bytes()` takes it, and a second read fails with
//! [`ControlError::BodyAlreadyConsumed`]. `try_clone()` tees the body so
//! that both copies can be drained independently.

use crate::client::ControlError;
use crate::control::Shared;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use http::{HeaderMap, StatusCode};
use meshlink_transport::{BodyStream, TransportError, TransportResponse};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sends host HTTP requests through the tunnel
pub struct FetchBridge {
    shared: Arc<Shared>,
}

impl FetchBridge {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Send `request`; fails with `NotConnected` unless the node is
    /// `Running` and not locked out
    pub async fn fetch(&self, request: http::Request<Bytes>) -> Result<FetchResponse, ControlError> {
        self.fetch_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`fetch`](Self::fetch), abandoning the request with
    /// `Cancelled` if `cancel` fires before the headers arrive
    pub async fn fetch_with_cancel(
        &self,
        request: http::Request<Bytes>,
        cancel: CancellationToken,
    ) -> Result<FetchResponse, ControlError> {
        self.shared.ensure_network_ready()?;

        let method = request.method().clone();
        let uri = request.uri().clone();
        debug!("fetch {} {}", method, uri);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("fetch {} {} cancelled", method, uri);
                return Err(ControlError::Cancelled);
            }
            response = self.shared.backend.round_trip(request) => response?,
        };

        debug!("fetch {} {} -> {}", method, uri, response.status);
        Ok(FetchResponse::from(response))
    }
}

/// Response to a fetch
pub struct FetchResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Mutex<Option<ResponseBody>>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_consumed", &self.is_consumed())
            .finish()
    }
}

impl From<TransportResponse> for FetchResponse {
    fn from(response: TransportResponse) -> Self {
        Self::with_body(
            response.status,
            response.headers,
            ResponseBody::direct(response.body),
        )
    }
}

impl FetchResponse {
    fn with_body(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body: Mutex::new(Some(body)),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Canonical reason phrase, empty for unknown codes
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// True for 2xx statuses
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_consumed(&self) -> bool {
        self.body.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Take the body stream
    pub fn body(&self) -> Result<ResponseBody, ControlError> {
        self.body
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ControlError::BodyAlreadyConsumed)
    }

    /// Drain the body
    pub async fn bytes(&self) -> Result<Bytes, ControlError> {
        let mut body = self.body()?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Drain the body as UTF-8 text
    pub async fn text(&self) -> Result<String, ControlError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ControlError::Decode(format!("response body is not UTF-8: {}", e)))
    }

    /// Drain the body and decode it as JSON
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, ControlError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ControlError::Decode(e.to_string()))
    }

    /// Independent copy of this response.
    ///
    /// Must be called before the body is read; both copies then yield the
    /// same bytes.
    pub fn try_clone(&self) -> Result<FetchResponse, ControlError> {
        let mut slot = self.body.lock().unwrap_or_else(|e| e.into_inner());
        let body = slot.take().ok_or(ControlError::BodyAlreadyConsumed)?;

        let (original, copy) = body.tee();
        *slot = Some(original);

        Ok(Self::with_body(self.status, self.headers.clone(), copy))
    }
}

/// Chunks read so far by any branch of a teed body
#[derive(Default)]
struct TeeBuffer {
    chunks: Vec<Bytes>,
    done: bool,
    error: Option<String>,
}

/// Shared by the branches of a teed body.
///
/// `buffer` is only locked briefly; `source` is held while one branch
/// waits on the network, so branches with buffered chunks never wait.
struct TeeState {
    source: tokio::sync::Mutex<BodyStream>,
    buffer: Mutex<TeeBuffer>,
}

impl TeeState {
    fn buffer(&self) -> std::sync::MutexGuard<'_, TeeBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Chunk at `position` if already buffered, or the end of the body
    fn buffered(&self, position: usize) -> Option<Option<Result<Bytes, ControlError>>> {
        let buffer = self.buffer();
        if let Some(chunk) = buffer.chunks.get(position) {
            return Some(Some(Ok(chunk.clone())));
        }
        if buffer.done {
            return Some(buffer.error.clone().map(|e| Err(stream_error(e))));
        }
        None
    }

    async fn read(&self, position: usize) -> Option<Result<Bytes, ControlError>> {
        loop {
            if let Some(next) = self.buffered(position) {
                return next;
            }

            let mut source = self.source.lock().await;
            // Another branch may have pulled while we waited for the source
            if self.buffered(position).is_some() {
                continue;
            }

            let next = source.next().await;
            let mut buffer = self.buffer();
            return match next {
                Some(Ok(chunk)) => {
                    buffer.chunks.push(chunk.clone());
                    Some(Ok(chunk))
                }
                Some(Err(e)) => {
                    buffer.done = true;
                    buffer.error = Some(e.to_string());
                    Some(Err(ControlError::from(e)))
                }
                None => {
                    buffer.done = true;
                    None
                }
            };
        }
    }
}

enum BodySource {
    Direct(BodyStream),
    Teed {
        state: Arc<TeeState>,
        position: usize,
    },
}

/// Lazily read response body
pub struct ResponseBody {
    source: BodySource,
    failed: bool,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let teed = matches!(self.source, BodySource::Teed { .. });
        f.debug_struct("ResponseBody").field("teed", &teed).finish()
    }
}

impl ResponseBody {
    fn direct(stream: BodyStream) -> Self {
        Self {
            source: BodySource::Direct(stream),
            failed: false,
        }
    }

    /// Next chunk, or `None` at the end of the body
    pub async fn chunk(&mut self) -> Option<Result<Bytes, ControlError>> {
        if self.failed {
            return None;
        }

        let next = match &mut self.source {
            BodySource::Direct(stream) => stream.next().await.map(|r| r.map_err(ControlError::from)),
            BodySource::Teed { state, position } => {
                let next = state.read(*position).await;
                if matches!(next, Some(Ok(_))) {
                    *position += 1;
                }
                next
            }
        };

        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }

    /// Adapt into a `Stream` of chunks
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, ControlError>> {
        stream::unfold(self, |mut body| async move {
            body.chunk().await.map(|chunk| (chunk, body))
        })
        .boxed()
    }

    /// Split into two bodies with independent read positions
    fn tee(self) -> (ResponseBody, ResponseBody) {
        let (state, position) = match self.source {
            BodySource::Direct(source) => {
                let state = TeeState {
                    source: tokio::sync::Mutex::new(source),
                    buffer: Mutex::new(TeeBuffer::default()),
                };
                (Arc::new(state), 0)
            }
            BodySource::Teed { state, position } => (state, position),
        };

        let branch = |state| ResponseBody {
            source: BodySource::Teed { state, position },
            failed: self.failed,
        };
        (branch(state.clone()), branch(state))
    }
}

fn stream_error(message: String) -> ControlError {
    ControlError::Transport(TransportError::ConnectionError(message))
}
