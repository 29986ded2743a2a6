//! Streaming relay between a dispatched request and its upstream.
//!
//! Each dispatch runs in its own task which owns the request's [`Slot`]. The
//! handler waits for the response head; the body is then fed from the task
//! through a channel, interleaved with heartbeats until the first upstream
//! byte. The slot is released when the task ends, whichever way it ends.

use std::fmt;
use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::GatewayError;
use crate::scheduler::Slot;

/// Path appended to the upstream base URL.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

const BODY_CHANNEL_CAPACITY: usize = 32;

/// SSE comment line, ignored by event-stream parsers.
pub const EVENT_STREAM_HEARTBEAT: &[u8] = b": keep-alive\n\n";
pub const PLAIN_HEARTBEAT: &[u8] = b" ";

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

type Chunk = Result<Bytes, io::Error>;

#[derive(Debug, thiserror::Error)]
enum RelayError {
    #[error("client disconnected")]
    Cancelled,
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// How the body phase of a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Upstream body ended normally.
    Completed,
    /// The client went away, or the relay was cancelled.
    Cancelled,
    /// Upstream body failed after the head was sent; the client connection is aborted.
    UpstreamFailed(String),
}

/// Forwards chat completion requests to upstreams.
#[derive(Debug, Clone)]
pub struct Relay {
    client: reqwest::Client,
    heartbeat: Option<Duration>,
}

impl Relay {
    pub fn new(heartbeat: Option<Duration>) -> Self {
        Self {
            client: reqwest::Client::new(),
            heartbeat,
        }
    }

    /// Forward `payload` to the slot's upstream and return the client response.
    ///
    /// If the returned future is dropped before the upstream answers (the
    /// client disconnected), the outbound call is cancelled.
    pub async fn dispatch(&self, slot: Slot, payload: Bytes) -> Response {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let (head_tx, head_rx) = oneshot::channel();

        let task = RelayTask {
            client: self.client.clone(),
            heartbeat: self.heartbeat,
            slot,
            payload,
            token,
        };
        tokio::spawn(task.run(head_tx).in_current_span());

        let response = match head_rx.await {
            Ok(response) => response,
            // The task ended without producing a head.
            Err(_) => GatewayError::UpstreamUnreachable.into_response(),
        };
        guard.disarm();
        response
    }
}

struct RelayTask {
    client: reqwest::Client,
    heartbeat: Option<Duration>,
    slot: Slot,
    payload: Bytes,
    token: CancellationToken,
}

impl RelayTask {
    async fn run(mut self, head: oneshot::Sender<Response>) {
        let base = self.slot.upstream_base().to_string();
        tracing::debug!(upstream = %base, "Relaying request");

        match self.relay(head).await {
            Ok(PumpOutcome::Completed) => {
                tracing::debug!(upstream = %base, "Upstream response relayed");
            }
            Ok(PumpOutcome::Cancelled) | Err(RelayError::Cancelled) => {
                tracing::warn!(upstream = %base, "Client disconnected during relay");
            }
            Ok(PumpOutcome::UpstreamFailed(error)) => {
                tracing::error!(upstream = %base, error = %error, "Upstream stream failed mid-response");
            }
            Err(RelayError::Upstream(error)) => {
                tracing::error!(upstream = %base, error = %error, "Gateway failed to reach upstream");
            }
        }

        self.slot.release();
    }

    async fn relay(&mut self, head: oneshot::Sender<Response>) -> Result<PumpOutcome, RelayError> {
        let url = format!("{}{}", self.slot.upstream_base(), CHAT_COMPLETIONS_PATH);
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(self.payload.clone());

        let sent = tokio::select! {
            _ = self.token.cancelled() => Err(RelayError::Cancelled),
            result = request.send() => result.map_err(RelayError::from),
        };
        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(_) if self.token.is_cancelled() => return Err(RelayError::Cancelled),
            Err(error) => {
                let _ = head.send(GatewayError::UpstreamUnreachable.into_response());
                return Err(error);
            }
        };

        let status = upstream.status();
        let headers = mirror_headers(upstream.headers());
        tracing::debug!(status = status.as_u16(), "Upstream responded");

        if !has_body(status, upstream.content_length()) {
            let _ = head.send(build_response(status, headers, Body::empty()));
            return Ok(PumpOutcome::Completed);
        }

        let heartbeat = self
            .heartbeat
            .map(|period| Heartbeat::new(period, heartbeat_payload(&headers)));
        let (sink, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let response = build_response(status, headers, Body::from_stream(ReceiverStream::new(rx)));
        if head.send(response).is_err() {
            self.token.cancel();
            return Err(RelayError::Cancelled);
        }

        Ok(pump(upstream.bytes_stream(), sink, heartbeat, &self.token).await)
    }
}

/// Periodic liveness payload written while the upstream is silent.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Interval,
    payload: Bytes,
}

impl Heartbeat {
    /// First beat fires one `period` from now.
    pub fn new(period: Duration, payload: Bytes) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, payload }
    }
}

async fn next_beat(heartbeat: &mut Option<Heartbeat>) {
    match heartbeat {
        Some(beat) => {
            beat.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Copy `upstream` into `sink` until it ends, fails, or the client goes away.
///
/// The heartbeat stops for good at the first non-empty upstream chunk, and
/// also when a heartbeat write finds the sink closed. Closing the sink
/// cancels `token`.
pub async fn pump<S, E>(
    upstream: S,
    sink: mpsc::Sender<Chunk>,
    mut heartbeat: Option<Heartbeat>,
    token: &CancellationToken,
) -> PumpOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    futures_util::pin_mut!(upstream);

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => return PumpOutcome::Cancelled,

            _ = sink.closed() => {
                token.cancel();
                return PumpOutcome::Cancelled;
            }

            next = upstream.next() => match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    heartbeat = None;
                    if sink.send(Ok(chunk)).await.is_err() {
                        token.cancel();
                        return PumpOutcome::Cancelled;
                    }
                }
                Some(Err(error)) => {
                    let message = error.to_string();
                    // An error item makes the server abort the connection.
                    let _ = sink.send(Err(io::Error::other(message.clone()))).await;
                    return PumpOutcome::UpstreamFailed(message);
                }
                None => return PumpOutcome::Completed,
            },

            () = next_beat(&mut heartbeat), if heartbeat.is_some() => {
                let Some(beat) = heartbeat.as_ref() else { continue };
                match sink.try_send(Ok(beat.payload.clone())) {
                    Ok(()) => tracing::trace!("Heartbeat sent"),
                    Err(TrySendError::Full(_)) => tracing::trace!("Heartbeat skipped, client is behind"),
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("Heartbeat write failed, stopping heartbeat");
                        heartbeat = None;
                    }
                }
            }
        }
    }
}

/// Copy upstream headers, minus framing and CORS, and add streaming defaults.
pub fn mirror_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 3);
    for (name, value) in upstream {
        if is_excluded(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    headers
}

fn is_excluded(name: &HeaderName) -> bool {
    name == TRANSFER_ENCODING
        || name == CONTENT_LENGTH
        || name == CONNECTION
        || name.as_str().starts_with("access-control-")
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn heartbeat_payload(headers: &HeaderMap) -> Bytes {
    if is_event_stream(headers) {
        Bytes::from_static(EVENT_STREAM_HEARTBEAT)
    } else {
        Bytes::from_static(PLAIN_HEARTBEAT)
    }
}

fn has_body(status: StatusCode, content_length: Option<u64>) -> bool {
    content_length != Some(0)
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    type Upstream = mpsc::Sender<Result<Bytes, io::Error>>;

    fn upstream() -> (Upstream, ReceiverStream<Result<Bytes, io::Error>>) {
        let (tx, rx) = mpsc::channel(8);
        (tx, ReceiverStream::new(rx))
    }

    fn spawn_pump(
        stream: ReceiverStream<Result<Bytes, io::Error>>,
        heartbeat: Option<Heartbeat>,
    ) -> (
        mpsc::Receiver<Chunk>,
        CancellationToken,
        tokio::task::JoinHandle<PumpOutcome>,
    ) {
        let (sink, out) = mpsc::channel(32);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move { pump(stream, sink, heartbeat, &task_token).await });
        (out, token, handle)
    }

    async fn collect(mut out: mpsc::Receiver<Chunk>) -> Vec<Bytes> {
        let mut chunks = vec![];
        while let Some(chunk) = out.recv().await {
            chunks.push(chunk.unwrap());
        }
        chunks
    }

    #[test]
    fn test_mirror_headers_drops_framing_and_cors() {
        let mut upstream = HeaderMap::new();
        upstream.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("https://upstream.example"),
        );
        upstream.insert("access-control-allow-headers", HeaderValue::from_static("x-foo"));
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        upstream.insert("x-request-id", HeaderValue::from_static("abc"));

        let headers = mirror_headers(&upstream);
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert!(headers.get("access-control-allow-origin").is_none());
        assert!(headers.get("access-control-allow-headers").is_none());
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers["x-request-id"], "abc");
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers[CONNECTION], "keep-alive");
        assert_eq!(headers["x-accel-buffering"], "no");
    }

    #[test]
    fn test_mirror_headers_keeps_upstream_cache_control() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));

        let headers = mirror_headers(&upstream);
        assert_eq!(headers[CACHE_CONTROL], "max-age=60");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_heartbeat_payload_depends_on_content_type() {
        let mut sse = HeaderMap::new();
        sse.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert_eq!(heartbeat_payload(&sse), Bytes::from_static(EVENT_STREAM_HEARTBEAT));

        let mut listed = HeaderMap::new();
        listed.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain, text/event-stream"),
        );
        assert_eq!(heartbeat_payload(&listed), Bytes::from_static(EVENT_STREAM_HEARTBEAT));

        let mut json = HeaderMap::new();
        json.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(heartbeat_payload(&json), Bytes::from_static(PLAIN_HEARTBEAT));
    }

    #[test]
    fn test_empty_responses_have_no_body() {
        assert!(!has_body(StatusCode::OK, Some(0)));
        assert!(!has_body(StatusCode::NO_CONTENT, None));
        assert!(has_body(StatusCode::OK, None));
        assert!(has_body(StatusCode::BAD_REQUEST, Some(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_until_first_byte() {
        let (tx, stream) = upstream();
        let heartbeat = Heartbeat::new(
            Duration::from_millis(100),
            Bytes::from_static(EVENT_STREAM_HEARTBEAT),
        );
        let (out, _token, handle) = spawn_pump(stream, Some(heartbeat));

        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(Ok(Bytes::from_static(b"data: hello\n\n"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), PumpOutcome::Completed);
        let chunks = collect(out).await;
        let beats = chunks
            .iter()
            .take_while(|c| &c[..] == EVENT_STREAM_HEARTBEAT)
            .count();
        assert_eq!(beats, 3);
        assert_eq!(
            &chunks[beats..],
            &[
                Bytes::from_static(b"data: hello\n\n"),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_when_disabled() {
        let (tx, stream) = upstream();
        let (out, _token, handle) = spawn_pump(stream, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send(Ok(Bytes::from_static(b"{}"))).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), PumpOutcome::Completed);
        assert_eq!(collect(out).await, vec![Bytes::from_static(b"{}")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_chunks_do_not_stop_heartbeat() {
        let (tx, stream) = upstream();
        let heartbeat = Heartbeat::new(Duration::from_millis(100), Bytes::from_static(PLAIN_HEARTBEAT));
        let (out, _token, handle) = spawn_pump(stream, Some(heartbeat));

        tx.send(Ok(Bytes::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(tx);

        assert_eq!(handle.await.unwrap(), PumpOutcome::Completed);
        let chunks = collect(out).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| &c[..] == PLAIN_HEARTBEAT));
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels() {
        let (_tx, stream) = upstream();
        let (out, token, handle) = spawn_pump(stream, None);

        drop(out);
        assert_eq!(handle.await.unwrap(), PumpOutcome::Cancelled);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_pump() {
        let (_tx, stream) = upstream();
        let (_out, token, handle) = spawn_pump(stream, None);

        token.cancel();
        assert_eq!(handle.await.unwrap(), PumpOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_upstream_error_is_forwarded_as_body_error() {
        let (tx, stream) = upstream();
        let (mut out, _token, handle) = spawn_pump(stream, None);

        tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
        tx.send(Err(io::Error::other("connection reset"))).await.unwrap();

        assert_eq!(
            handle.await.unwrap(),
            PumpOutcome::UpstreamFailed("connection reset".to_string())
        );
        assert_eq!(out.recv().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(out.recv().await.unwrap().is_err());
        assert!(out.recv().await.is_none());
    }
}
