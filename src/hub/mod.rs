//! Connection multiplexer: registry, lifecycle loops, push fan-out.
//!
//! One `Hub` instance serves one logical connection class (chat,
//! notification stream, ...). All registry mutation is serialized through
//! a single registry actor task; everything else reads the concurrent map.
//! Background work — the actor, the idle sweep, per-line reader/writer
//! tasks, push fan-outs — runs on a bounded [`TaskPool`], never on bare
//! spawns.

pub mod line;
pub mod pool;
pub mod user_lines;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::Response;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use line::{ExtraData, Line, LineError, LineErrorKind, LineMessage, LineState, Platform, Transport};
pub use pool::{BoundedPool, PoolError, TaskPool};
pub use user_lines::UserLines;

use futures_util::StreamExt;
use line::{run_reader, run_writer, sse_stream};

/// Origin-check predicate applied before a WebSocket upgrade.
pub type OriginCheck = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// What to do when a line's bounded write channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for space, up to the given duration, then give up on that line.
    Block { timeout: Duration },
    /// Never wait: the new frame is dropped for that line.
    DropNewest,
}

/// Hub construction parameters.
#[derive(Clone)]
pub struct HubConfig {
    /// WebSocket subprotocols offered during the upgrade.
    pub subprotocols: Vec<String>,
    /// Idle-sweep tick. Floored at 1 second.
    pub live_check_interval: Duration,
    /// Lines inactive longer than this are evicted by the sweep.
    pub max_idle: Duration,
    /// Per-iteration read deadline on a WebSocket line.
    pub read_timeout: Duration,
    /// Deadline for one outbound socket write.
    pub write_timeout: Duration,
    /// Keep-alive comment interval on SSE lines.
    pub sse_heartbeat: Duration,
    /// Capacity of each line's outbound write channel.
    pub write_channel_capacity: usize,
    /// Capacity of the external event channels.
    pub event_channel_capacity: usize,
    pub overflow: OverflowPolicy,
    /// When set, upgrades are refused unless the predicate accepts the
    /// request headers.
    pub origin_check: Option<OriginCheck>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            live_check_interval: Duration::from_secs(30),
            max_idle: Duration::from_secs(300),
            read_timeout: Duration::from_secs(75),
            write_timeout: Duration::from_secs(10),
            sse_heartbeat: Duration::from_secs(15),
            write_channel_capacity: 64,
            event_channel_capacity: 256,
            overflow: OverflowPolicy::Block {
                timeout: Duration::from_secs(5),
            },
            origin_check: None,
        }
    }
}

impl HubConfig {
    fn validated(mut self) -> Result<Self, HubError> {
        if self.live_check_interval < Duration::from_secs(1) {
            self.live_check_interval = Duration::from_secs(1);
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(HubError::InvalidConfig(
                "read/write timeouts must be non-zero".to_string(),
            ));
        }
        if self.max_idle.is_zero() {
            return Err(HubError::InvalidConfig(
                "max idle duration must be non-zero".to_string(),
            ));
        }
        self.write_channel_capacity = self.write_channel_capacity.max(1);
        self.event_channel_capacity = self.event_channel_capacity.max(1);
        Ok(self)
    }
}

/// Errors from hub construction and operations.
#[derive(Debug)]
pub enum HubError {
    InvalidConfig(String),
    /// The hub has been shut down.
    Closed,
    /// User id must never be empty; it is the registry key.
    EmptyUserId,
    /// The upgrade request failed the origin check.
    OriginRejected,
    Pool(PoolError),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(e) => write!(f, "Invalid hub config: {}", e),
            Self::Closed => write!(f, "Hub is closed"),
            Self::EmptyUserId => write!(f, "User id must not be empty"),
            Self::OriginRejected => write!(f, "Origin rejected"),
            Self::Pool(e) => write!(f, "Task pool error: {}", e),
        }
    }
}

impl std::error::Error for HubError {}

impl From<PoolError> for HubError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

/// Receiver bundle handed to business logic at construction. The hub only
/// produces events; consuming them (including the protocol decode loop
/// over `messages`) is the caller's side of the contract.
pub struct HubEvents {
    pub messages: mpsc::Receiver<LineMessage>,
    pub registered: mpsc::Receiver<Arc<Line>>,
    pub unregistered: mpsc::Receiver<Arc<Line>>,
    pub errors: mpsc::Receiver<LineError>,
}

/// Registry mutations, applied in order by the registry actor.
pub(crate) enum RegistryOp {
    Register(Arc<Line>),
    Unregister(Arc<Line>),
}

pub(crate) struct HubShared {
    pub(crate) cfg: HubConfig,
    pub(crate) registry: DashMap<String, Arc<UserLines>>,
    pub(crate) conn_count: AtomicI64,
    pub(crate) closed: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) pool: Arc<dyn TaskPool>,
    pub(crate) lifecycle_tx: mpsc::UnboundedSender<RegistryOp>,
    pub(crate) message_tx: mpsc::Sender<LineMessage>,
    pub(crate) registered_tx: mpsc::Sender<Arc<Line>>,
    pub(crate) unregistered_tx: mpsc::Sender<Arc<Line>>,
    pub(crate) error_tx: mpsc::Sender<LineError>,
}

#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// Validate the configuration and start the background loops. Returns
    /// the hub handle plus the event receivers. Must be called inside a
    /// tokio runtime.
    pub fn new(cfg: HubConfig, pool: Arc<dyn TaskPool>) -> Result<(Self, HubEvents), HubError> {
        let cfg = cfg.validated()?;

        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (message_tx, messages) = mpsc::channel(cfg.event_channel_capacity);
        let (registered_tx, registered) = mpsc::channel(cfg.event_channel_capacity);
        let (unregistered_tx, unregistered) = mpsc::channel(cfg.event_channel_capacity);
        let (error_tx, errors) = mpsc::channel(cfg.event_channel_capacity);

        let shared = Arc::new(HubShared {
            cfg,
            registry: DashMap::new(),
            conn_count: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            pool: pool.clone(),
            lifecycle_tx,
            message_tx,
            registered_tx,
            unregistered_tx,
            error_tx,
        });

        pool.submit(Box::pin(registry_actor(shared.clone(), lifecycle_rx)))?;
        pool.submit(Box::pin(idle_sweep(shared.clone())))?;

        Ok((
            Self { shared },
            HubEvents {
                messages,
                registered,
                unregistered,
                errors,
            },
        ))
    }

    pub fn connection_count(&self) -> i64 {
        self.shared.conn_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn get_user_lines(&self, user_id: &str) -> Option<Arc<UserLines>> {
        self.shared.registry.get(user_id).map(|e| e.value().clone())
    }

    pub fn get_user_line(&self, user_id: &str, line_id: &str) -> Option<Arc<Line>> {
        self.get_user_lines(user_id).and_then(|ul| ul.get(line_id))
    }

    /// Perform the WebSocket upgrade and wire the connection into the
    /// hub: construct the line, register it, start its reader/writer
    /// tasks on the pool.
    pub fn upgrade_websocket(
        &self,
        user_id: String,
        platform: Platform,
        line_id: String,
        extra: ExtraData,
        headers: &HeaderMap,
        ws: WebSocketUpgrade,
    ) -> Result<Response, HubError> {
        self.ensure_open()?;
        if user_id.is_empty() {
            return Err(HubError::EmptyUserId);
        }
        if let Some(check) = &self.shared.cfg.origin_check {
            if !check(headers) {
                return Err(HubError::OriginRejected);
            }
        }

        let ws = if self.shared.cfg.subprotocols.is_empty() {
            ws
        } else {
            ws.protocols(self.shared.cfg.subprotocols.clone())
        };

        let shared = self.shared.clone();
        Ok(ws.on_upgrade(move |socket| async move {
            let (line, write_rx) = Line::new(
                user_id,
                platform,
                line_id,
                Transport::WebSocket,
                extra,
                shared.clone(),
            );
            // Register before the I/O tasks exist so a connection that
            // dies instantly still unregisters after it registers.
            let _ = shared.lifecycle_tx.send(RegistryOp::Register(line.clone()));

            let (sink, stream) = socket.split();
            if let Err(e) = shared.pool.submit(Box::pin(run_reader(line.clone(), stream))) {
                tracing::error!(error = %e, "Failed to start line reader");
                line.close(None);
                return;
            }
            if let Err(e) = shared
                .pool
                .submit(Box::pin(run_writer(line.clone(), sink, write_rx)))
            {
                tracing::error!(error = %e, "Failed to start line writer");
                line.close(None);
            }
        }))
    }

    /// Open an SSE line and return the response. The stream lives until
    /// the line closes or the client disconnects.
    pub fn serve_sse(
        &self,
        user_id: String,
        platform: Platform,
        line_id: String,
        extra: ExtraData,
    ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, HubError>
    {
        let (_line, stream) = self.open_sse_line(user_id, platform, line_id, extra)?;
        Ok(Sse::new(stream))
    }

    pub(crate) fn open_sse_line(
        &self,
        user_id: String,
        platform: Platform,
        line_id: String,
        extra: ExtraData,
    ) -> Result<
        (
            Arc<Line>,
            impl Stream<Item = Result<Event, Infallible>> + Send + 'static,
        ),
        HubError,
    > {
        self.ensure_open()?;
        if user_id.is_empty() {
            return Err(HubError::EmptyUserId);
        }
        let (line, write_rx) = Line::new(
            user_id,
            platform,
            line_id,
            Transport::Sse,
            extra,
            self.shared.clone(),
        );
        let _ = self
            .shared
            .lifecycle_tx
            .send(RegistryOp::Register(line.clone()));
        let stream = sse_stream(line.clone(), write_rx);
        Ok((line, stream))
    }

    /// Push one frame to every line of each listed user. The fan-out runs
    /// on the pool; a slow target never blocks the caller.
    pub fn push_message(&self, user_ids: Vec<String>, data: Bytes) -> Result<(), HubError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        self.shared
            .pool
            .submit(Box::pin(async move {
                for user_id in user_ids {
                    let target = shared.registry.get(&user_id).map(|e| e.value().clone());
                    if let Some(ul) = target {
                        let delivered = ul.push(data.clone()).await;
                        tracing::trace!(user_id = %user_id, delivered, "Push fan-out");
                    }
                }
            }))
            .map_err(HubError::Pool)
    }

    /// Push one frame to specific lines of one user.
    pub fn push_to_user_lines(
        &self,
        user_id: String,
        line_ids: Vec<String>,
        data: Bytes,
    ) -> Result<(), HubError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        self.shared
            .pool
            .submit(Box::pin(async move {
                let target = shared.registry.get(&user_id).map(|e| e.value().clone());
                if let Some(ul) = target {
                    let delivered = ul.push_to_lines(data, &line_ids).await;
                    tracing::trace!(user_id = %user_id, delivered, "Targeted push");
                }
            }))
            .map_err(HubError::Pool)
    }

    /// Push one frame to every connected line of every user.
    pub fn broadcast(&self, data: Bytes) -> Result<(), HubError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        self.shared
            .pool
            .submit(Box::pin(async move {
                // Snapshot first: never await while holding map guards.
                let targets: Vec<Arc<UserLines>> =
                    shared.registry.iter().map(|e| e.value().clone()).collect();
                let mut delivered = 0;
                for ul in targets {
                    delivered += ul.push(data.clone()).await;
                }
                tracing::trace!(delivered, "Broadcast fan-out");
            }))
            .map_err(HubError::Pool)
    }

    /// Signal close on specific lines of one user. Removal flows through
    /// the unregistration pipeline.
    pub fn close_user_lines(&self, user_id: String, line_ids: Vec<String>) -> Result<(), HubError> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        self.shared
            .pool
            .submit(Box::pin(async move {
                let target = shared.registry.get(&user_id).map(|e| e.value().clone());
                if let Some(ul) = target {
                    ul.close_lines(&line_ids);
                }
            }))
            .map_err(HubError::Pool)
    }

    /// Shut the hub down: signal every line to close, give in-flight
    /// writes `wait` to drain, then stop the background loops. Safe to
    /// call multiple times and concurrently.
    pub async fn close(&self, wait: Duration) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Hub closing");

        let targets: Vec<Arc<UserLines>> = self
            .shared
            .registry
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for ul in targets {
            ul.close_all();
        }

        tokio::time::sleep(wait).await;
        self.shared.shutdown.cancel();
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        Ok(())
    }
}

/// The one task allowed to mutate the registry. Ordering of register and
/// unregister for any single line is guaranteed by the shared queue.
async fn registry_actor(shared: Arc<HubShared>, mut rx: mpsc::UnboundedReceiver<RegistryOp>) {
    loop {
        tokio::select! {
            biased;
            op = rx.recv() => match op {
                Some(op) => apply_registry_op(&shared, op).await,
                None => break,
            },
            _ = shared.shutdown.cancelled() => {
                // Drain what is already queued, then stop.
                while let Ok(op) = rx.try_recv() {
                    apply_registry_op(&shared, op).await;
                }
                break;
            }
        }
    }
}

async fn apply_registry_op(shared: &Arc<HubShared>, op: RegistryOp) {
    match op {
        RegistryOp::Register(line) => {
            if shared.closed.load(Ordering::SeqCst) {
                line.close(None);
                return;
            }
            let ul = shared
                .registry
                .entry(line.user_id().to_string())
                .or_insert_with(|| Arc::new(UserLines::new()))
                .clone();

            if let Some(old) = ul.add(line.clone()) {
                // Reconnect displaced a line with the same id: retire the
                // old one here so counters and events stay balanced.
                old.close(None);
                old.mark_closed();
                shared.conn_count.fetch_sub(1, Ordering::SeqCst);
                let _ = shared.unregistered_tx.send(old).await;
            }

            shared.conn_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                user_id = %line.user_id(),
                line_id = %line.id(),
                transport = line.transport().as_str(),
                "Line registered"
            );
            let _ = shared.registered_tx.send(line).await;
        }
        RegistryOp::Unregister(line) => {
            let removed = match shared.registry.get(line.user_id()).map(|e| e.value().clone()) {
                Some(ul) => {
                    let removed = ul.remove(&line);
                    if ul.is_empty() {
                        // Key exists iff the user has live lines.
                        shared
                            .registry
                            .remove_if(line.user_id(), |_, v| v.is_empty());
                    }
                    removed
                }
                None => false,
            };

            line.mark_closed();
            if removed {
                shared.conn_count.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(
                    user_id = %line.user_id(),
                    line_id = %line.id(),
                    "Line unregistered"
                );
                let _ = shared.unregistered_tx.send(line).await;
            }
        }
    }
}

/// Periodic eviction of lines inactive beyond the configured threshold.
/// Only signals closes; removal happens in the registry actor.
async fn idle_sweep(shared: Arc<HubShared>) {
    let max_idle_secs = shared.cfg.max_idle.as_secs() as i64;
    let mut ticker = tokio::time::interval(shared.cfg.live_check_interval);
    ticker.tick().await; // the immediate first tick

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp();
                let snapshot: Vec<(String, Arc<UserLines>)> = shared
                    .registry
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                for (user_id, ul) in snapshot {
                    let evicted = ul.close_inactive(max_idle_secs, now);
                    if evicted > 0 {
                        tracing::debug!(user_id = %user_id, evicted, "Idle sweep closed stale lines");
                    }
                }
            }
        }
    }
}
