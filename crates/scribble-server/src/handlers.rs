//! Connection handlers for Scribble server.
//!
//! This module handles the socket lifecycle, frame processing and the
//! HTTP routes next to the WebSocket endpoint.

use crate::config::{Config, StorageBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{anyhow, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use scribble_core::{
    validate_board_id, AllowAll, Authorizer, Connection, ConnectionId, ConnectionManager,
    DrawEvent, EventStore, FileEventStore, HistoryError, JoinError, MemoryEventStore, PeerHandle,
    PeerReceiver, Point, ReplayError, StoreError, StrokeStyle,
};
use scribble_protocol::{codec, codes, Frame, ProtocolError, PROTOCOL_VERSION};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Largest page served by the history route.
const MAX_HISTORY_PAGE: usize = 1_000;

/// Shared server state.
pub struct AppState {
    /// The drawing engine.
    pub manager: Arc<ConnectionManager>,
    /// Server configuration.
    pub config: Config,
    /// Open sockets, joined or not.
    sockets: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn EventStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryEventStore::new()),
            StorageBackend::File => {
                Arc::new(FileEventStore::new(config.data_dir(), config.storage.fsync))
            }
        };

        let authorizer: Arc<dyn Authorizer> =
            if config.access.open && config.access.boards.is_empty() {
                Arc::new(AllowAll)
            } else {
                Arc::new(config.acl())
            };

        Self {
            manager: Arc::new(ConnectionManager::new(
                store,
                authorizer,
                config.manager_config(),
            )),
            config,
            sockets: AtomicUsize::new(0),
        }
    }

    /// Number of open sockets.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.load(Ordering::Relaxed)
    }
}

/// One unit of `limits.max_connections`, released on drop.
struct SocketSlot(Arc<AppState>);

impl SocketSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        let previous = state.sockets.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            state.sockets.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(Arc::clone(state)))
    }
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.0.sockets.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/boards/:board/events", get(history_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Scribble server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.manager.shutdown().await?;
    info!("Scribble server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.manager.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "boards": stats.board_count,
        "connections": stats.connection_count,
        "sockets": state.socket_count(),
    }))
}

/// Errors from the HTTP routes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid board id: {0}")]
    InvalidBoard(&'static str),

    #[error("Not authorized for board: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::Unauthorized(board) => ApiError::Forbidden(board),
            HistoryError::Store(e) => ApiError::Store(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidBoard(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Paging for the history route.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub from: u64,
    pub limit: Option<usize>,
    /// Identity checked against the board's access list, as on join.
    pub token: Option<String>,
}

/// Persisted strokes of a board, oldest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(board): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<DrawEvent>>, ApiError> {
    validate_board_id(&board).map_err(ApiError::InvalidBoard)?;

    let limit = query
        .limit
        .unwrap_or(MAX_HISTORY_PAGE)
        .min(MAX_HISTORY_PAGE);

    match state
        .manager
        .history(query.token.as_deref(), &board, query.from, limit)
        .await
    {
        Ok(events) => Ok(Json(events)),
        Err(HistoryError::Unauthorized(board)) => {
            metrics::record_error("history_denied");
            Err(ApiError::Forbidden(board))
        }
        Err(e) => {
            warn!(board = %board, error = %e, "History read failed");
            metrics::record_store_error("read");
            Err(e.into())
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = SocketSlot::acquire(&state) else {
        warn!("Connection limit reached, refusing socket");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Work for the socket writer task.
enum Outbound {
    /// A control frame for this client.
    Frame(Frame),
    /// Start forwarding strokes from a new peer queue.
    Attach(PeerReceiver),
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: SocketSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let connected = Frame::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION.major,
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    let (outbound, control) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(sender, control, connection_id.clone()));

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut session = Session {
        state: Arc::clone(&state),
        id: connection_id.clone(),
        outbound,
        joined: None,
    };
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(msg) => msg,
            Err(_) => {
                debug!(connection = %connection_id, "Idle timeout");
                break;
            }
        };

        match msg {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => {
                // Treat text as binary
                read_buffer.extend_from_slice(text.as_bytes());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %connection_id, "Received close frame");
                break;
            }
            Some(Err(e)) => {
                warn!(connection = %connection_id, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
            None => {
                debug!(connection = %connection_id, "WebSocket stream ended");
                break;
            }
        }

        if let Err(e) = session.drain_frames(&mut read_buffer).await {
            debug!(connection = %connection_id, error = %e, "Closing connection");
            break;
        }
    }

    session.close();
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Forward control frames and strokes to the socket.
///
/// Strokes take priority, so every replayed stroke is written before the
/// `joined` frame that follows it.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut control: mpsc::UnboundedReceiver<Outbound>,
    connection_id: ConnectionId,
) {
    let mut events: Option<PeerReceiver> = None;

    loop {
        let frame = tokio::select! {
            biased;

            event = next_event(&mut events) => match event {
                Some(event) => event.to_frame(),
                None => {
                    events = None;
                    continue;
                }
            },

            out = control.recv() => match out {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Attach(rx)) => {
                    events = Some(rx);
                    continue;
                }
                None => break,
            },
        };

        if let Err(e) = send_frame(&mut sender, &frame).await {
            debug!(connection = %connection_id, error = %e, "Socket write failed");
            break;
        }
    }

    let _ = sender.close().await;
}

async fn next_event(events: &mut Option<PeerReceiver>) -> Option<Arc<DrawEvent>> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Frame handling state for one socket.
struct Session {
    state: Arc<AppState>,
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    joined: Option<Connection>,
}

impl Session {
    fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| anyhow!("socket writer closed"))
    }

    /// Handle every complete frame in `buf`.
    async fn drain_frames(&mut self, buf: &mut BytesMut) -> Result<()> {
        loop {
            match codec::decode_from(buf) {
                Ok(Some(frame)) => self.handle_frame(frame).await?,
                Ok(None) => return Ok(()),
                Err(e @ ProtocolError::FrameTooLarge(_)) => {
                    metrics::record_error("frame_too_large");
                    self.send(Frame::error(0, codes::INVALID_FRAME, e.to_string()))?;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Invalid frame");
                    metrics::record_error("invalid_frame");
                    self.send(Frame::error(0, codes::INVALID_FRAME, e.to_string()))?;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Join {
                id,
                board,
                version,
                token,
            } => self.join(id, board, version, token).await,

            Frame::Draw {
                id,
                from,
                to,
                style,
            } => self.draw(id, from, to, style).await,

            Frame::Leave { id } => self.leave(id),

            Frame::Ping { timestamp } => self.send(Frame::pong(timestamp)),

            Frame::Pong { .. } => Ok(()),

            other => {
                warn!(connection = %self.id, frame_type = ?other.frame_type(), "Unexpected frame type");
                self.send(Frame::error(
                    0,
                    codes::INVALID_FRAME,
                    format!("Unexpected frame type {:?}", other.frame_type()),
                ))
            }
        }
    }

    async fn join(
        &mut self,
        id: u64,
        board: String,
        version: u8,
        token: Option<String>,
    ) -> Result<()> {
        if !PROTOCOL_VERSION.accepts_major(version) {
            metrics::record_join("unsupported_version");
            return self.send(Frame::error(
                id,
                codes::UNSUPPORTED_VERSION,
                format!("Unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"),
            ));
        }

        if let Some(current) = &self.joined {
            if current.board_id() == board {
                return self.send(Frame::ack(id));
            }
            return self.send(Frame::error(
                id,
                codes::NOT_JOINED,
                format!("Already joined board {}", current.board_id()),
            ));
        }

        debug!(connection = %self.id, board = %board, "Join request");

        let (peer, events) = PeerHandle::channel(self.state.config.limits.outbound_queue);
        self.outbound
            .send(Outbound::Attach(events))
            .map_err(|_| anyhow!("socket writer closed"))?;

        let started = Instant::now();
        match self
            .state
            .manager
            .connect(self.id.clone(), &board, token, peer)
            .await
        {
            Ok(joined) => {
                metrics::record_join("ok");
                metrics::record_replay(joined.replayed, started.elapsed().as_secs_f64());
                metrics::set_active_boards(self.state.manager.stats().board_count);
                self.joined = Some(joined.connection);
                self.send(Frame::joined(id, board, joined.replayed))
            }
            Err(e) => {
                let (code, outcome) = join_error_code(&e);
                metrics::record_join(outcome);
                self.send(Frame::error(id, code, e.to_string()))
            }
        }
    }

    async fn draw(
        &mut self,
        id: Option<u64>,
        from: Point,
        to: Point,
        style: Option<StrokeStyle>,
    ) -> Result<()> {
        let request = id.unwrap_or(0);
        let Some(connection) = &self.joined else {
            return self.send(Frame::error(
                request,
                codes::NOT_JOINED,
                "Join a board before drawing",
            ));
        };

        let started = Instant::now();
        match self.state.manager.publish(connection, from, to, style).await {
            Ok(report) => {
                metrics::record_publish(&report, started.elapsed().as_secs_f64());
                if let Some(e) = &report.store_error {
                    return self.send(Frame::error(
                        request,
                        codes::STORE_UNAVAILABLE,
                        e.to_string(),
                    ));
                }
                match id {
                    Some(id) => self.send(Frame::ack(id)),
                    None => Ok(()),
                }
            }
            Err(e) => self.send(Frame::error(request, codes::NOT_JOINED, e.to_string())),
        }
    }

    fn leave(&mut self, id: u64) -> Result<()> {
        match self.joined.take() {
            Some(connection) => {
                self.state.manager.disconnect(&connection);
                metrics::set_active_boards(self.state.manager.stats().board_count);
                self.send(Frame::ack(id))
            }
            None => self.send(Frame::error(id, codes::NOT_JOINED, "Not joined to a board")),
        }
    }

    fn close(&mut self) {
        if let Some(connection) = self.joined.take() {
            self.state.manager.disconnect(&connection);
            metrics::set_active_boards(self.state.manager.stats().board_count);
        }
    }
}

/// Protocol error code and metrics outcome for a failed join.
fn join_error_code(e: &JoinError) -> (u16, &'static str) {
    match e {
        JoinError::InvalidBoard(_) => (codes::INVALID_BOARD, "invalid_board"),
        JoinError::Unauthorized(_) => (codes::UNAUTHORIZED, "unauthorized"),
        JoinError::Registry(_) => (codes::CAPACITY, "capacity"),
        JoinError::Replay(ReplayError::Store(_)) => (codes::STORE_UNAVAILABLE, "store_error"),
        JoinError::Replay(ReplayError::Delivery(_)) => (codes::INTERNAL, "replay_failed"),
    }
}
