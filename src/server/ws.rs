//! WebSocket endpoint
//!
//! Admission happens before the upgrade: the bearer token arrives in the
//! query string and must carry a device identity. Once upgraded, the
//! socket is split between the session's write and read loops; the
//! session handle lives until either loop exits.

use std::net::SocketAddr;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::DeviceClaims;
use crate::broker::client::{self, Client};
use crate::config::MAX_FRAME_BYTES;
use crate::protocol::{self, Event};

use super::limits::ConnectionGuard;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if query.token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    }
    let claims = match state.validator.validate(&query.token) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(target: "auth", error = %err, "admission rejected");
            return (err.status(), err.to_string()).into_response();
        }
    };
    let guard = match state.limits.try_acquire(addr.ip()) {
        Ok(guard) => guard,
        Err(err) => {
            warn!(target: "ws", ip = %addr.ip(), error = %err, "connection refused");
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };

    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_session(socket, state, claims, addr, guard))
        .into_response()
}

async fn handle_session(
    socket: WebSocket,
    state: AppState,
    claims: DeviceClaims,
    addr: SocketAddr,
    _guard: ConnectionGuard,
) {
    let session_id = Uuid::new_v4();
    let (sink, stream) = socket.split();
    let (session, egress) = Client::new(claims.device_id, claims.device_type);

    info!(
        target: "ws",
        session_id = %session_id,
        device_id = %session.device_id,
        device_type = %session.device_type,
        remote = %addr,
        "device connected"
    );

    // Writer first, so the connect event and early replies have a drain.
    let writer = tokio::spawn(client::write_loop(session.clone(), egress, sink));
    client::spawn_status_pinger(session.clone());
    session.send(Event::new(protocol::EVENT_CONNECT));

    client::read_loop(session.clone(), state.manager.clone(), stream).await;
    let _ = writer.await;

    info!(
        target: "ws",
        session_id = %session_id,
        device_id = %session.device_id,
        "session closed"
    );
    // _guard drops here, releasing the connection slot.
}
