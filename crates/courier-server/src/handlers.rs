//! HTTP and WebSocket handlers.
//!
//! This module handles the socket lifecycle: the Connect handshake, the
//! frame loop and cleanup when the socket goes away.

use crate::config::Config;
use crate::listener;
use crate::metrics::{self, SessionMetricsGuard};
use crate::session::{ClientSession, Outcome};
use crate::state::{AppState, Backends};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::with_deadline;
use courier_protocol::{codec, codes, Frame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocket, Message>;

/// Run the node until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the backends cannot be reached or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let keys = courier_core::Keyspace::new(config.store.key_prefix.clone());
    let backends = Backends::from_config(&config, &keys).await?;
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config, backends));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Courier node {} listening on {}", state.config.node_id, addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then unbind local
/// sessions and drain the publish pool.
///
/// # Errors
///
/// Returns an error if the node inbox cannot be subscribed or the server
/// fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let inbox = listener::spawn_inbox(
        Arc::clone(&state.broker),
        state.inbox_topic(),
        state.config.node_id.clone(),
        state.sessions.clone(),
    )
    .await
    .context("Failed to subscribe to node inbox")?;

    let app = router(Arc::clone(&state));
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Shutting down");
    state.shutdown().await;
    inbox.abort();

    result.context("Server error")
}

/// Routes served by a node.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Health check handler. Pings the store on demand.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_up = with_deadline(state.config.request_timeout(), async {
        state.store.ping().await.map_err(Into::into)
    })
    .await
    .is_ok();

    let status = if store_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        axum::Json(serde_json::json!({
            "status": if store_up { "ok" } else { "degraded" },
            "node_id": state.config.node_id,
            "version": env!("CARGO_PKG_VERSION"),
            "store": if store_up { "up" } else { "down" },
            "sessions": state.sessions.len(),
        })),
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_frame = state.config.limits.max_message_size + 64 * 1024;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    let handshake_timeout = Duration::from_millis(state.config.presence.heartbeat_interval_ms);
    let first = tokio::time::timeout(
        handshake_timeout,
        next_frame(&mut receiver, &mut sender, &mut read_buffer),
    )
    .await;

    let (version, token) = match first {
        Ok(Some(Frame::Connect { version, token })) => (version, token),
        Ok(Some(other)) => {
            debug!(frame_type = ?other.frame_type(), "First frame was not Connect");
            close_with(&mut sender, Frame::error(0, codes::BAD_REQUEST, "Expected Connect")).await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!("Handshake timed out");
            close_with(&mut sender, Frame::error(0, codes::TIMEOUT, "Handshake timed out")).await;
            return;
        }
    };

    let (mut session, connected) = match ClientSession::open(Arc::clone(&state), version, &token).await {
        Ok(opened) => opened,
        Err(rejection) => {
            close_with(&mut sender, rejection).await;
            return;
        }
    };

    let _metrics_guard = SessionMetricsGuard::new();
    let mut outbox = state.sessions.register(session.id(), session.user_id());

    if send_frame(&mut sender, &connected).await.is_err() {
        session.close().await;
        return;
    }

    loop {
        tokio::select! {
            biased;

            delivery = outbox.recv() => {
                match delivery {
                    Some(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Node shutting down.
                        close_with(&mut sender, Frame::Disconnect).await;
                        break;
                    }
                }
            }

            frame = next_frame(&mut receiver, &mut sender, &mut read_buffer) => {
                let Some(frame) = frame else {
                    break;
                };
                match session.handle(frame).await {
                    Outcome::Reply(reply) => {
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Outcome::Pushed(ack, accepted) => {
                        let sent = send_frame(&mut sender, &ack).await;
                        session.dispatch(accepted).await;
                        if sent.is_err() {
                            break;
                        }
                    }
                    Outcome::Silent => {}
                    Outcome::Close(last) => {
                        if let Some(last) = last {
                            let _ = send_frame(&mut sender, &last).await;
                        }
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    debug!(session = %session.id(), "WebSocket closed");
}

/// Read until one full frame is buffered. `None` once the socket is done
/// or sent something undecodable.
async fn next_frame(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    sender: &mut WsSink,
    buffer: &mut BytesMut,
) -> Option<Frame> {
    loop {
        match codec::decode_from(buffer) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Undecodable client frame");
                close_with(sender, Frame::error(0, codes::BAD_REQUEST, e.to_string())).await;
                return None;
            }
        }

        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
            Some(Ok(Message::Ping(data))) => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Text(_))) => {
                close_with(sender, Frame::error(0, codes::BAD_REQUEST, "Binary frames only")).await;
                return None;
            }
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame");
                return None;
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                return None;
            }
            None => {
                debug!("WebSocket stream ended");
                return None;
            }
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Best-effort final frame followed by a close.
async fn close_with(sender: &mut WsSink, frame: Frame) {
    if let Err(e) = send_frame(sender, &frame).await {
        debug!(error = %e, "Failed to send final frame");
    }
    let _ = sender.send(Message::Close(None)).await;
}
