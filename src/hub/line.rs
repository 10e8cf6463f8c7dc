//! One physical client connection and its I/O tasks.
//!
//! A `Line` is constructed post-handshake, becomes live when the hub's
//! registry actor admits it, and is torn down exactly once through
//! `close()` -> unregistration. The reader/writer tasks never touch the
//! registry themselves.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::response::sse::Event;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, SplitSink, SplitStream, Stream, StreamExt};
use futures_util::SinkExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{HubShared, OverflowPolicy};

/// WebSocket close code for a normal, server-initiated shutdown.
const CLOSE_NORMAL: u16 = 1000;

/// Client platform, informational and usable as a close/push filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Web,
    Ios,
    Android,
    Desktop,
    Unknown,
}

impl Platform {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Self::Web),
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            "desktop" => Some(Self::Desktop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Desktop => "desktop",
            Self::Unknown => "unknown",
        }
    }
}

/// Physical transport behind a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Duplex: one reader task, one writer task.
    WebSocket,
    /// Simplex outbound: the response stream is the only task.
    Sse,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
        }
    }
}

/// Opaque key/value bag attached at connection time (negotiated session
/// keys and the like). Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct ExtraData(Arc<HashMap<String, Bytes>>);

impl ExtraData {
    pub fn new(values: HashMap<String, Bytes>) -> Self {
        Self(Arc::new(values))
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Line lifecycle; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Open,
    Closing,
    Closed,
}

impl LineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// What went wrong on a line. Emitted on the hub error channel only for
/// error-caused closure, never for intentional shutdown.
#[derive(Debug, Clone)]
pub enum LineErrorKind {
    Read(String),
    Write(String),
    ReadTimeout,
    WriteTimeout,
    ProtocolViolation(&'static str),
}

impl std::fmt::Display for LineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(e) => write!(f, "Read error: {}", e),
            Self::Write(e) => write!(f, "Write error: {}", e),
            Self::ReadTimeout => write!(f, "Read deadline exceeded"),
            Self::WriteTimeout => write!(f, "Write deadline exceeded"),
            Self::ProtocolViolation(what) => write!(f, "Protocol violation: {}", what),
        }
    }
}

/// Error event published on the hub error channel.
#[derive(Debug, Clone)]
pub struct LineError {
    pub user_id: String,
    pub line_id: String,
    pub platform: Platform,
    pub kind: LineErrorKind,
}

/// Inbound message event: one binary frame read from a line.
#[derive(Debug, Clone)]
pub struct LineMessage {
    pub user_id: String,
    pub platform: Platform,
    pub line_id: String,
    pub data: Bytes,
}

/// Frames travelling through a line's bounded write channel.
#[derive(Debug)]
pub(crate) enum OutboundFrame {
    Data(Bytes),
    /// Control reply to a client ping; WebSocket only.
    Pong(Bytes),
}

pub struct Line {
    id: String,
    user_id: String,
    platform: Platform,
    transport: Transport,
    extra: ExtraData,
    last_active: AtomicI64,
    state: AtomicU8,
    closed: AtomicBool,
    closing: CancellationToken,
    write_tx: mpsc::Sender<OutboundFrame>,
    shared: Arc<HubShared>,
}

impl Line {
    /// Build a line plus the receiver half of its write channel. The
    /// receiver goes to the writer task (WebSocket) or the response
    /// stream (SSE).
    pub(crate) fn new(
        user_id: String,
        platform: Platform,
        line_id: String,
        transport: Transport,
        extra: ExtraData,
        shared: Arc<HubShared>,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (write_tx, write_rx) = mpsc::channel(shared.cfg.write_channel_capacity);
        let line = Arc::new(Self {
            id: line_id,
            user_id,
            platform,
            transport,
            extra,
            last_active: AtomicI64::new(Utc::now().timestamp()),
            state: AtomicU8::new(LineState::Open as u8),
            closed: AtomicBool::new(false),
            // Child of the hub token: hub shutdown reaches every line.
            closing: shared.shutdown.child_token(),
            write_tx,
            shared,
        });
        (line, write_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn extra(&self) -> &ExtraData {
        &self.extra
    }

    pub fn state(&self) -> LineState {
        LineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unix seconds of the last inbound activity.
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_active.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Queue one outbound data frame under the configured overflow
    /// policy. Returns false when the frame was not accepted (channel
    /// full past the policy, or the line is going away).
    pub(crate) async fn enqueue(&self, data: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.shared.cfg.overflow {
            OverflowPolicy::DropNewest => self.write_tx.try_send(OutboundFrame::Data(data)).is_ok(),
            OverflowPolicy::Block { timeout: wait } => matches!(
                timeout(wait, self.write_tx.send(OutboundFrame::Data(data))).await,
                Ok(Ok(()))
            ),
        }
    }

    /// One-way transition into Closing. Idempotent: only the first caller
    /// emits the error event and reaches the unregistration pipeline.
    pub(crate) fn close(self: &Arc<Self>, cause: Option<LineErrorKind>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.store(LineState::Closing as u8, Ordering::Release);

        if let Some(kind) = cause {
            tracing::debug!(
                user_id = %self.user_id,
                line_id = %self.id,
                error = %kind,
                "Line closing on error"
            );
            // Advisory event; dropped if the observer lags.
            let _ = self.shared.error_tx.try_send(LineError {
                user_id: self.user_id.clone(),
                line_id: self.id.clone(),
                platform: self.platform,
                kind,
            });
        }

        self.closing.cancel();
        let _ = self
            .shared
            .lifecycle_tx
            .send(super::RegistryOp::Unregister(self.clone()));
    }

    /// Called by the registry actor once removal has completed.
    pub(crate) fn mark_closed(&self) {
        self.state.store(LineState::Closed as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// Reader task for a WebSocket line: applies the read deadline per
/// iteration, forwards binary frames to the hub message channel, answers
/// pings, and treats text frames as protocol violations.
pub(crate) async fn run_reader(line: Arc<Line>, mut receiver: SplitStream<WebSocket>) {
    let read_timeout = line.shared.cfg.read_timeout;
    loop {
        let next = tokio::select! {
            _ = line.closing.cancelled() => break,
            res = timeout(read_timeout, receiver.next()) => res,
        };

        match next {
            Err(_) => {
                line.close(Some(LineErrorKind::ReadTimeout));
                break;
            }
            Ok(None) => {
                // Stream ended: client went away without a close frame.
                line.close(None);
                break;
            }
            Ok(Some(Err(e))) => {
                line.close(Some(LineErrorKind::Read(e.to_string())));
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                Message::Binary(data) => {
                    line.touch();
                    let event = LineMessage {
                        user_id: line.user_id.clone(),
                        platform: line.platform,
                        line_id: line.id.clone(),
                        data,
                    };
                    if line.shared.message_tx.send(event).await.is_err() {
                        // Message consumer is gone; nothing left to read for.
                        line.close(None);
                        break;
                    }
                }
                Message::Ping(payload) => {
                    line.touch();
                    let _ = line.write_tx.try_send(OutboundFrame::Pong(payload));
                }
                Message::Pong(_) => {
                    line.touch();
                }
                Message::Text(_) => {
                    line.close(Some(LineErrorKind::ProtocolViolation(
                        "text frame on a binary protocol",
                    )));
                    break;
                }
                Message::Close(_) => {
                    line.close(None);
                    break;
                }
            },
        }
    }
}

/// Writer task for a WebSocket line: blocks on the write channel and the
/// close signal. A close signal triggers the graceful close handshake
/// before the socket drops.
pub(crate) async fn run_writer(
    line: Arc<Line>,
    mut sender: SplitSink<WebSocket, Message>,
    mut write_rx: mpsc::Receiver<OutboundFrame>,
) {
    let write_timeout = line.shared.cfg.write_timeout;
    loop {
        tokio::select! {
            _ = line.closing.cancelled() => {
                let frame = CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: "closing".into(),
                };
                let _ = timeout(write_timeout, sender.send(Message::Close(Some(frame)))).await;
                break;
            }
            next = write_rx.recv() => {
                let msg = match next {
                    Some(OutboundFrame::Data(data)) => Message::Binary(data),
                    Some(OutboundFrame::Pong(payload)) => Message::Pong(payload),
                    None => break,
                };
                match timeout(write_timeout, sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        line.close(Some(LineErrorKind::Write(e.to_string())));
                        break;
                    }
                    Err(_) => {
                        line.close(Some(LineErrorKind::WriteTimeout));
                        break;
                    }
                }
            }
        }
    }
    // Dropping the sink closes the socket.
}

/// Closes the line when the SSE response stream is dropped (client
/// disconnect or server teardown).
struct SseGuard(Arc<Line>);

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.0.close(None);
    }
}

struct SseState {
    line: Arc<Line>,
    write_rx: mpsc::Receiver<OutboundFrame>,
    heartbeat: tokio::time::Interval,
    _guard: SseGuard,
}

/// Response stream for an SSE line: an initial event carrying the line id,
/// then one event per outbound frame until close, interleaved with
/// keep-alive comments. Heartbeats also refresh `last_active` so a
/// connected-but-quiet SSE line is not idle-evicted.
pub(crate) fn sse_stream(
    line: Arc<Line>,
    write_rx: mpsc::Receiver<OutboundFrame>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let hello = Event::default().id(line.id().to_string()).comment("connected");
    let mut heartbeat = tokio::time::interval(line.shared.cfg.sse_heartbeat);
    heartbeat.reset(); // skip the immediate first tick
    let state = SseState {
        line: line.clone(),
        write_rx,
        heartbeat,
        _guard: SseGuard(line),
    };

    let frames = stream::unfold(state, |mut st| async move {
        loop {
            tokio::select! {
                _ = st.line.closing.cancelled() => return None,
                frame = st.write_rx.recv() => match frame {
                    None => return None,
                    Some(OutboundFrame::Data(data)) => {
                        st.line.touch();
                        return Some((sse_event(&data), st));
                    }
                    // Pongs are a WebSocket control concern.
                    Some(OutboundFrame::Pong(_)) => continue,
                },
                _ = st.heartbeat.tick() => {
                    st.line.touch();
                    return Some((Event::default().comment("ping"), st));
                }
            }
        }
    });

    stream::iter([hello]).chain(frames).map(Ok)
}

/// SSE carries text; binary payloads are base64-encoded under a `binary`
/// event name so clients can tell the two apart.
fn sse_event(data: &Bytes) -> Event {
    match std::str::from_utf8(data) {
        Ok(text) => Event::default().data(text),
        Err(_) => Event::default()
            .event("binary")
            .data(base64::engine::general_purpose::STANDARD.encode(data)),
    }
}
