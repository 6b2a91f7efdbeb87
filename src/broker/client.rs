//! Client session
//!
//! One `Client` per accepted WebSocket. The session runs two cooperating
//! tasks: a read loop that parses inbound frames and hands them to the
//! `Manager`, and a write loop that drains the bounded egress buffer onto
//! the transport and emits keepalive pings. Hosts additionally get a
//! status pinger task.
//!
//! `send` never blocks: a full buffer or a shut-down client drops the
//! event. A handler holding a room lock must never stall on a slow peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

use crate::config::{
    EGRESS_BUFFER, KEEPALIVE_INTERVAL, READ_IDLE, STATUS_INTERVAL, WRITE_DEADLINE,
};
use crate::protocol::{self, DeviceType, Event};

use super::room::Room;
use super::Manager;

/// Receiving half of a client's egress buffer, owned by its write loop.
pub type Egress = mpsc::Receiver<Event>;

pub struct Client {
    pub device_id: String,
    pub device_type: DeviceType,
    egress: mpsc::Sender<Event>,
    /// Weak back-reference; the room's membership map is the authority.
    room: Mutex<Weak<Room>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Client {
    /// Build a session handle plus the egress receiver its write loop
    /// (or a test) drains.
    pub fn new(device_id: String, device_type: DeviceType) -> (Arc<Self>, Egress) {
        let (egress, egress_rx) = mpsc::channel(EGRESS_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        (
            Arc::new(Self {
                device_id,
                device_type,
                egress,
                room: Mutex::new(Weak::new()),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
            egress_rx,
        )
    }

    /// Non-blocking enqueue. Dropped (with a log line) when the client is
    /// shut down or the buffer is full.
    pub fn send(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.egress.try_send(event) {
            warn!(
                target: "broker",
                device_id = %self.device_id,
                device_type = %self.device_type,
                event_type = %err.into_inner().event_type,
                "egress buffer full or closed, dropping event"
            );
        }
    }

    /// Enqueue an `error` event addressed at this client.
    pub fn send_error(&self, request_id: Option<String>, code: &str, message: &str) {
        self.send(Event::error(request_id, code, message));
    }

    /// Idempotent: the first call flips the closed flag and fires the
    /// shutdown signal; later calls are no-ops. Safe from any task.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        debug!(target: "broker", device_id = %self.device_id, "client shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A receiver that resolves once `shutdown` has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn set_room(&self, room: Weak<Room>) {
        *self.room.lock() = room;
    }

    pub(crate) fn clear_room(&self) {
        *self.room.lock() = Weak::new();
    }

    /// The room this client currently belongs to, if any.
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().upgrade()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("device_id", &self.device_id)
            .field("device_type", &self.device_type)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Consume inbound frames until the transport errors, the peer goes
/// silent past the idle window, or the client is shut down. On exit the
/// client is removed from its room and shut down.
pub async fn read_loop(client: Arc<Client>, manager: Arc<Manager>, mut stream: SplitStream<WebSocket>) {
    let mut shutdown = client.shutdown_signal();
    loop {
        let next = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            next = timeout(READ_IDLE, stream.next()) => next,
        };
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                debug!(target: "ws", device_id = %client.device_id, error = %err, "transport error");
                break;
            }
            Ok(None) => {
                debug!(target: "ws", device_id = %client.device_id, "stream ended");
                break;
            }
            Err(_) => {
                debug!(target: "ws", device_id = %client.device_id, "no traffic inside the idle window");
                break;
            }
        };
        match frame {
            Message::Text(text) => dispatch_frame(text.as_bytes(), &client, &manager),
            Message::Binary(data) => dispatch_frame(&data, &client, &manager),
            Message::Close(_) => {
                debug!(target: "ws", device_id = %client.device_id, "close frame received");
                break;
            }
            // Keepalive traffic; receiving it already reset the idle window.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    manager.remove_client(&client);
    client.shutdown();
}

/// Parse one frame and route it. Parse and routing failures are answered
/// with an `error` event and the session continues.
fn dispatch_frame(data: &[u8], client: &Arc<Client>, manager: &Manager) {
    let mut event: Event = match serde_json::from_slice(data) {
        Ok(event) => event,
        Err(err) => {
            warn!(target: "ws", device_id = %client.device_id, error = %err, "unparseable frame");
            client.send_error(None, protocol::ERR_INVALID_JSON, "failed to parse event JSON");
            return;
        }
    };
    event.timestamp = protocol::now_ms();
    let event_type = event.event_type.clone();
    let request_id = event.request_id.clone();
    if let Err(err) = manager.route(event, client) {
        warn!(
            target: "broker",
            device_id = %client.device_id,
            event_type = %event_type,
            error = %err,
            "routing failed"
        );
        client.send_error(request_id, protocol::ERR_ROUTING, &err.to_string());
    }
}

/// Resolves once `shutdown` carries `true`, without holding the
/// receiver's internal guard across an `.await` (unlike `wait_for`,
/// which is unsound to use alongside other awaiting `select!` arms in
/// the same match body).
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Drain the egress buffer onto the transport, interleaving keepalive
/// pings. Exits on shutdown, egress close, or a terminal write error; a
/// close frame is attempted on the way out.
pub async fn write_loop(
    client: Arc<Client>,
    mut egress: Egress,
    mut sink: SplitSink<WebSocket, Message>,
) {
    let mut shutdown = client.shutdown_signal();
    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                break;
            }
            next = egress.recv() => {
                let Some(event) = next else {
                    let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "ws", device_id = %client.device_id, error = %err, "unserializable event");
                        continue;
                    }
                };
                match timeout(WRITE_DEADLINE, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(target: "ws", device_id = %client.device_id, error = %err, "write failed");
                        break;
                    }
                    Err(_) => {
                        debug!(target: "ws", device_id = %client.device_id, "write deadline exceeded");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                let ping = sink.send(Message::Ping(Vec::new()));
                if !matches!(timeout(WRITE_DEADLINE, ping).await, Ok(Ok(()))) {
                    debug!(target: "ws", device_id = %client.device_id, "keepalive failed");
                    break;
                }
            }
        }
    }
    client.shutdown();
}

/// Hosts get a periodic `status_update` describing the room from their
/// point of view. No-op for peers. The task ends with the client.
pub fn spawn_status_pinger(client: Arc<Client>) {
    if client.device_type != DeviceType::Mac {
        return;
    }
    tokio::spawn(async move {
        let mut shutdown = client.shutdown_signal();
        let mut ticker = interval_at(Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    let room = client.room();
                    let (in_room, watch_connected) = match &room {
                        Some(room) => (true, room.peer(DeviceType::Watch).is_some()),
                        None => (false, false),
                    };
                    client.send(Event {
                        room_id: room.map(|r| r.id.clone()),
                        payload: Some(json!({
                            "in_room": in_room,
                            "watch_connected": watch_connected,
                        })),
                        ..Event::new(protocol::EVENT_STATUS_UPDATE)
                    });
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test]
    async fn send_drops_when_buffer_is_full() {
        let (client, mut egress) = Client::new("w1".to_string(), DeviceType::Watch);
        for _ in 0..EGRESS_BUFFER + 5 {
            client.send(Event::new(protocol::EVENT_BATTERY_UPDATE));
        }
        let mut delivered = 0;
        while egress.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, EGRESS_BUFFER);
    }

    #[tokio::test]
    async fn send_after_shutdown_is_dropped() {
        let (client, mut egress) = Client::new("w1".to_string(), DeviceType::Watch);
        client.shutdown();
        client.send(Event::new(protocol::EVENT_CONNECT));
        assert!(matches!(egress.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_signals_once() {
        let (client, _egress) = Client::new("m1".to_string(), DeviceType::Mac);
        let mut signal = client.shutdown_signal();
        assert!(!client.is_closed());
        client.shutdown();
        client.shutdown();
        client.shutdown();
        assert!(client.is_closed());
        signal.wait_for(|stop| *stop).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_resolves_for_late_subscribers() {
        let (client, _egress) = Client::new("m1".to_string(), DeviceType::Mac);
        client.shutdown();
        // Subscribed after the signal fired; wait_for must still resolve.
        let mut signal = client.shutdown_signal();
        signal.wait_for(|stop| *stop).await.unwrap();
    }

    #[tokio::test]
    async fn status_pinger_is_host_only() {
        let (watch, mut egress) = Client::new("w1".to_string(), DeviceType::Watch);
        spawn_status_pinger(watch.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(egress.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn status_pinger_reports_out_of_room_state() {
        let (host, mut egress) = Client::new("m1".to_string(), DeviceType::Mac);
        spawn_status_pinger(host.clone());
        let event = tokio::time::timeout(STATUS_INTERVAL * 2, egress.recv())
            .await
            .expect("pinger should fire")
            .expect("egress open");
        assert_eq!(event.event_type, protocol::EVENT_STATUS_UPDATE);
        let payload = event.payload.unwrap();
        assert_eq!(payload["in_room"], false);
        assert_eq!(payload["watch_connected"], false);
        host.shutdown();
    }
}
