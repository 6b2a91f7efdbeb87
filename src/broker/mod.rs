//! Broker core
//!
//! The `Manager` owns the room registry and the event dispatch table.
//! Inbound events arrive from a client's read loop; each handler checks
//! the sender's role, touches room state, and fans results out through
//! the members' egress buffers. Registry and room locks are held only
//! across map operations, never while awaiting.
//!
//! Lock order is Manager -> Room -> Client, strictly.

pub mod cache;
pub mod client;
pub mod room;

pub use cache::RoomCache;
pub use client::Client;
pub use room::Room;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::{
    BATTERY_TTL, DEVICE_INFO_TTL, DOWNLOADS_TTL, REQUEST_TIMEOUT, STORAGE_TTL,
};
use crate::protocol::{self, DeviceType, Event};

const MEDIA_ACTIONS: [&str; 8] = [
    "play",
    "pause",
    "volup",
    "voldown",
    // Synonyms kept for older watch builds.
    "volumeup",
    "volumedown",
    "next",
    "prev",
];

/// Handler-level failures, surfaced to the offending client as an
/// `error` event with code `routing_error` and this message.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("only Mac devices can create rooms")]
    CreateRequiresHost,
    #[error("room already exists")]
    RoomExists,
    #[error("room not found or inactive")]
    RoomNotFound,
    #[error("room already has a Mac device")]
    HostAlreadyPresent,
    #[error("only Mac devices can send device info")]
    DeviceInfoRequiresHost,
    #[error("only Watch devices can request media actions")]
    MediaActionRequiresPeer,
    #[error("invalid media action")]
    InvalidMediaAction,
    #[error("only Watch devices can request actions")]
    ActionRequiresPeer,
    #[error("invalid action")]
    InvalidAction,
    #[error("only Mac devices can send action results")]
    ActionResultRequiresHost,
    #[error("not in a room")]
    NotInRoom,
    #[error("missing request_id")]
    MissingRequestId,
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

#[derive(Debug, Deserialize)]
struct RoomRef {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct ActionPayload {
    #[serde(default)]
    action: String,
}

/// Process-wide room registry and event router.
#[derive(Debug, Default)]
pub struct Manager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_room(&self, room_id: &str, host_device_id: &str) -> Arc<Room> {
        let room = Room::new(room_id, host_device_id);
        self.rooms.write().insert(room_id.to_string(), room.clone());
        info!(target: "broker", room_id, host_device_id, "room created");
        room
    }

    /// Look up an *active* room; inactive rooms are invisible to joins.
    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .get(room_id)
            .filter(|room| room.is_active())
            .cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Detach `client` from its room (if any) and garbage-collect the
    /// room once it is empty or inactive. The identity check in
    /// `Room::remove_client` keeps stale disconnects harmless; the
    /// pointer check here keeps a recreated room under the same id safe.
    pub fn remove_client(&self, client: &Arc<Client>) {
        let Some(room) = client.room() else {
            debug!(target: "broker", device_id = %client.device_id, "client removed without a room");
            return;
        };
        room.remove_client(client);

        let mut rooms = self.rooms.write();
        if room.is_empty() || !room.is_active() {
            if let Some(registered) = rooms.get(&room.id) {
                if Arc::ptr_eq(registered, &room) {
                    rooms.remove(&room.id);
                    info!(
                        target: "broker",
                        room_id = %room.id,
                        clients = room.client_count(),
                        active = room.is_active(),
                        "room cleaned up"
                    );
                }
            }
        }
    }

    /// Dispatch one inbound event. Errors are returned to the read loop,
    /// which reports them back to the sender; the session continues.
    pub fn route(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        match event.event_type.as_str() {
            protocol::EVENT_ROOM_STATUS => self.handle_room_status(client),
            protocol::EVENT_CREATE_ROOM => self.handle_create_room(event, client),
            protocol::EVENT_JOIN_ROOM => self.handle_join_room(event, client),
            protocol::EVENT_DEVICE_INFO => self.handle_device_info(event, client),
            protocol::EVENT_BATTERY_UPDATE => {
                self.handle_snapshot_update(event, client, cache::BATTERY, BATTERY_TTL)
            }
            protocol::EVENT_STORAGE_UPDATE => {
                self.handle_snapshot_update(event, client, cache::STORAGE, STORAGE_TTL)
            }
            protocol::EVENT_DOWNLOADS_UPDATE => {
                self.handle_snapshot_update(event, client, cache::DOWNLOADS, DOWNLOADS_TTL)
            }
            protocol::EVENT_ACTION_REQUEST => self.handle_action_request(event, client),
            protocol::EVENT_MEDIA_ACTION => self.handle_media_action(event, client),
            protocol::EVENT_ACTION_RESULT => self.handle_action_result(event, client),
            protocol::EVENT_REQUEST => self.handle_request(event, client),
            protocol::EVENT_RESPONSE => self.handle_response(event, client),
            other => Err(RouteError::UnknownEventType(other.to_string())),
        }
    }

    fn handle_create_room(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let payload: RoomRef = parse_payload(&event)?;
        if client.device_type != DeviceType::Mac {
            return Err(RouteError::CreateRequiresHost);
        }

        if let Some(existing) = self.get_room(&payload.room_id) {
            if existing.host_device_id != client.device_id {
                return Err(RouteError::RoomExists);
            }
            info!(
                target: "broker",
                room_id = %existing.id,
                device_id = %client.device_id,
                "host rejoining existing room"
            );
            existing.reactivate();
            existing.add_client(client.clone());
            let watch_connected = existing.peer(DeviceType::Watch).is_some();
            client.send(status_update(&existing.id, true, watch_connected));
            client.send(room_joined(&existing.id, "rejoined", "host"));
            return Ok(());
        }

        let room = self.create_room(&payload.room_id, &client.device_id);
        room.add_client(client.clone());
        client.send(status_update(&room.id, true, false));
        client.send(room_joined(&room.id, "created", "host"));
        Ok(())
    }

    fn handle_join_room(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let payload: RoomRef = parse_payload(&event)?;
        let room = self
            .get_room(&payload.room_id)
            .ok_or(RouteError::RoomNotFound)?;

        if client.device_type == DeviceType::Mac && room.peer(DeviceType::Mac).is_some() {
            return Err(RouteError::HostAlreadyPresent);
        }

        room.add_client(client.clone());
        self.send_cached_snapshots(client, &room);
        client.send(room_joined(&room.id, "joined", "client"));

        if client.device_type == DeviceType::Watch {
            if let Some(host) = room.peer(DeviceType::Mac) {
                host.send(status_update(&room.id, true, true));
            }
        }
        Ok(())
    }

    /// Replay whatever snapshots are still live to a freshly joined peer,
    /// so it renders state before the host's next publish cycle.
    fn send_cached_snapshots(&self, client: &Arc<Client>, room: &Arc<Room>) {
        if client.device_type != DeviceType::Watch {
            return;
        }
        let snapshots = [
            (cache::DEVICE_INFO, protocol::EVENT_DEVICE_INFO),
            (cache::BATTERY, protocol::EVENT_BATTERY_UPDATE),
            (cache::STORAGE, protocol::EVENT_STORAGE_UPDATE),
            (cache::DOWNLOADS, protocol::EVENT_DOWNLOADS_UPDATE),
        ];
        for (key, event_type) in snapshots {
            if let Some(data) = room.cache.get(key) {
                client.send(Event {
                    room_id: Some(room.id.clone()),
                    payload: Some(data),
                    ..Event::new(event_type)
                });
            }
        }
    }

    fn handle_device_info(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        // Clients may publish before joining; drop those silently.
        let Some(room) = client.room() else {
            return Ok(());
        };
        if client.device_type != DeviceType::Mac {
            return Err(RouteError::DeviceInfoRequiresHost);
        }
        let payload = event.payload.unwrap_or(Value::Null);
        room.cache.set(cache::DEVICE_INFO, payload.clone(), DEVICE_INFO_TTL);
        room.broadcast_except(
            &client.device_id,
            Event {
                room_id: Some(room.id.clone()),
                device_id: Some(client.device_id.clone()),
                payload: Some(payload),
                ..Event::new(protocol::EVENT_DEVICE_INFO)
            },
        );
        Ok(())
    }

    /// battery/storage/downloads: cache under `key` and rebroadcast.
    /// Accepted from either role — these are informational snapshots.
    fn handle_snapshot_update(
        &self,
        event: Event,
        client: &Arc<Client>,
        key: &str,
        ttl: std::time::Duration,
    ) -> Result<(), RouteError> {
        let Some(room) = client.room() else {
            return Ok(());
        };
        let payload = event.payload.unwrap_or(Value::Null);
        room.cache.set(key, payload.clone(), ttl);
        room.broadcast_except(
            &client.device_id,
            Event {
                room_id: Some(room.id.clone()),
                device_id: Some(client.device_id.clone()),
                payload: Some(payload),
                ..Event::new(&event.event_type)
            },
        );
        Ok(())
    }

    /// Forward a media control to the host. No waiter: a request_id is
    /// carried through but no correlated reply is expected.
    fn handle_media_action(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let room = client.room().ok_or(RouteError::NotInRoom)?;
        if client.device_type != DeviceType::Watch {
            return Err(RouteError::MediaActionRequiresPeer);
        }
        let payload: ActionPayload = parse_payload(&event)?;
        if !MEDIA_ACTIONS.contains(&payload.action.as_str()) {
            return Err(RouteError::InvalidMediaAction);
        }
        let Some(host) = room.peer(DeviceType::Mac) else {
            client.send_error(
                event.request_id,
                protocol::ERR_MAC_UNAVAILABLE,
                "Mac device not connected",
            );
            return Ok(());
        };
        host.send(Event {
            room_id: Some(room.id.clone()),
            device_id: Some(client.device_id.clone()),
            request_id: event.request_id,
            payload: event.payload,
            ..Event::new(protocol::EVENT_MEDIA_ACTION)
        });
        Ok(())
    }

    /// Forward a power action to the host. With a request_id a waiter is
    /// registered and its resolution comes back as `action_result` (or
    /// `error{timeout}`); without one the forward is fire-and-forget.
    fn handle_action_request(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let room = client.room().ok_or(RouteError::NotInRoom)?;
        if client.device_type != DeviceType::Watch {
            return Err(RouteError::ActionRequiresPeer);
        }
        let payload: ActionPayload = parse_payload(&event)?;
        if payload.action != "shutdown" && payload.action != "sleep" {
            return Err(RouteError::InvalidAction);
        }
        let Some(host) = room.peer(DeviceType::Mac) else {
            client.send_error(
                event.request_id,
                protocol::ERR_MAC_UNAVAILABLE,
                "Mac device not connected",
            );
            return Ok(());
        };
        let forwarded = Event {
            room_id: Some(room.id.clone()),
            device_id: Some(client.device_id.clone()),
            request_id: event.request_id.clone(),
            payload: event.payload,
            ..Event::new(protocol::EVENT_ACTION_REQUEST)
        };
        match event.request_id.filter(|id| !id.is_empty()) {
            Some(request_id) => {
                let rx = room.wait_for_response(&request_id);
                host.send(forwarded);
                spawn_response_waiter(
                    room,
                    client.clone(),
                    request_id,
                    protocol::EVENT_ACTION_RESULT,
                    "Mac did not respond in time",
                    rx,
                );
            }
            None => host.send(forwarded),
        }
        Ok(())
    }

    fn handle_action_result(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let room = client.room().ok_or(RouteError::NotInRoom)?;
        if client.device_type != DeviceType::Mac {
            return Err(RouteError::ActionResultRequiresHost);
        }
        room.fulfill_response(&event);
        Ok(())
    }

    /// Generic correlated request. Cacheable queries are answered
    /// straight from the snapshot store; everything else is forwarded to
    /// the opposite role with a waiter.
    fn handle_request(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let room = client.room().ok_or(RouteError::NotInRoom)?;
        let request_id = event
            .request_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(RouteError::MissingRequestId)?;

        let action = event
            .payload
            .as_ref()
            .and_then(|p| p.get("action"))
            .and_then(|a| a.as_str())
            .unwrap_or_default();
        let cache_key = match action {
            "get_device_info" => Some(cache::DEVICE_INFO),
            "get_battery" => Some(cache::BATTERY),
            _ => None,
        };
        if let Some(key) = cache_key {
            if let Some(data) = room.cache.get(key) {
                client.send(Event {
                    request_id: Some(request_id),
                    room_id: Some(room.id.clone()),
                    payload: Some(data),
                    ..Event::new(protocol::EVENT_RESPONSE)
                });
                return Ok(());
            }
        }

        let Some(target) = room.peer(client.device_type.opposite()) else {
            client.send_error(
                Some(request_id),
                protocol::ERR_PEER_UNAVAILABLE,
                "Target device not connected",
            );
            return Ok(());
        };
        let rx = room.wait_for_response(&request_id);
        target.send(event);
        spawn_response_waiter(
            room,
            client.clone(),
            request_id,
            protocol::EVENT_RESPONSE,
            "Peer did not respond in time",
            rx,
        );
        Ok(())
    }

    fn handle_response(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let room = client.room().ok_or(RouteError::NotInRoom)?;
        room.fulfill_response(&event);
        Ok(())
    }

    fn handle_room_status(&self, client: &Arc<Client>) -> Result<(), RouteError> {
        let in_room = client.room().is_some();
        client.send(Event {
            payload: Some(json!({ "status": in_room })),
            ..Event::new(protocol::EVENT_RESPONSE)
        });
        Ok(())
    }
}

/// Await the waiter's resolution off the handler path. Fulfillment is
/// relayed back to the requester as `reply_type`; a timeout cancels the
/// pending entry and reports `error{timeout}`. A channel closed by host
/// departure resolves silently — the requester already saw
/// `peer_disconnected`.
fn spawn_response_waiter(
    room: Arc<Room>,
    requester: Arc<Client>,
    request_id: String,
    reply_type: &'static str,
    timeout_message: &'static str,
    rx: oneshot::Receiver<Event>,
) {
    tokio::spawn(async move {
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                requester.send(Event {
                    request_id: response.request_id.clone(),
                    room_id: Some(room.id.clone()),
                    payload: response.payload,
                    ..Event::new(reply_type)
                });
            }
            Ok(Err(_)) => {
                debug!(
                    target: "broker",
                    request_id = %request_id,
                    "waiter closed before fulfillment"
                );
            }
            Err(_) => {
                room.cancel_response(&request_id);
                requester.send_error(Some(request_id), protocol::ERR_TIMEOUT, timeout_message);
            }
        }
    });
}

fn parse_payload<T: DeserializeOwned>(event: &Event) -> Result<T, RouteError> {
    let payload = event.payload.clone().unwrap_or(Value::Null);
    Ok(serde_json::from_value(payload)?)
}

fn status_update(room_id: &str, in_room: bool, watch_connected: bool) -> Event {
    Event {
        room_id: Some(room_id.to_string()),
        payload: Some(json!({
            "in_room": in_room,
            "watch_connected": watch_connected,
        })),
        ..Event::new(protocol::EVENT_STATUS_UPDATE)
    }
}

fn room_joined(room_id: &str, status: &str, role: &str) -> Event {
    Event {
        room_id: Some(room_id.to_string()),
        payload: Some(json!({ "status": status, "role": role })),
        ..Event::new(protocol::EVENT_ROOM_JOINED)
    }
}
