//! Room
//!
//! A named rendezvous holding at most one host (the creating Mac) and any
//! number of peers, keyed by device_id. The room owns membership; clients
//! only hold a weak back-reference. One mutex covers the membership map,
//! the pending-response table, and the active flag; it is never held
//! across an await, and a displaced client is shut down only after the
//! lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{self, DeviceType, Event};

use super::cache::RoomCache;
use super::client::Client;

pub struct Room {
    pub id: String,
    /// device_id of the privileged creator.
    pub host_device_id: String,
    pub cache: RoomCache,
    /// Handed to members as their back-reference.
    weak_self: Weak<Room>,
    inner: Mutex<RoomInner>,
}

struct RoomInner {
    clients: HashMap<String, Arc<Client>>,
    pending: HashMap<String, oneshot::Sender<Event>>,
    is_active: bool,
}

impl Room {
    pub fn new(id: &str, host_device_id: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: id.to_string(),
            host_device_id: host_device_id.to_string(),
            cache: RoomCache::new(),
            weak_self: weak.clone(),
            inner: Mutex::new(RoomInner {
                clients: HashMap::new(),
                pending: HashMap::new(),
                is_active: true,
            }),
        })
    }

    /// Register `client`, displacing any session already using its
    /// device_id. The displaced session is shut down outside the room
    /// lock so its disconnect handler cannot evict the fresh one.
    /// Broadcasts `peer_connected` to the other members.
    pub fn add_client(&self, client: Arc<Client>) {
        let displaced = {
            let mut inner = self.inner.lock();
            client.set_room(self.weak_self.clone());
            inner.clients.insert(client.device_id.clone(), client.clone())
        };
        if let Some(prior) = displaced {
            if !Arc::ptr_eq(&prior, &client) {
                debug!(
                    target: "broker",
                    room_id = %self.id,
                    device_id = %client.device_id,
                    "displacing stale session for reconnect"
                );
                prior.shutdown();
            }
        }
        self.broadcast_except(
            &client.device_id,
            Event {
                room_id: Some(self.id.clone()),
                device_id: Some(client.device_id.clone()),
                payload: Some(json!({ "device_type": client.device_type })),
                ..Event::new(protocol::EVENT_PEER_CONNECTED)
            },
        );
    }

    /// Remove `client` if, and only if, it is still the registered
    /// session for its device_id — a stale disconnect arriving after a
    /// reconnect must not touch the replacement.
    ///
    /// A departing host deactivates the room, drains the pending table
    /// (unblocking every waiter), and leaves each remaining member with a
    /// `peer_disconnected` plus an out-of-room `status_update`. A
    /// departing peer is announced to the remainder, and the host gets a
    /// refreshed `status_update`.
    pub fn remove_client(&self, client: &Arc<Client>) {
        let (remaining, was_host) = {
            let mut inner = self.inner.lock();
            match inner.clients.get(&client.device_id) {
                Some(existing) if Arc::ptr_eq(existing, client) => {}
                _ => return,
            }
            inner.clients.remove(&client.device_id);
            client.clear_room();
            let was_host = client.device_id == self.host_device_id;
            if was_host {
                inner.is_active = false;
                // Dropping the senders closes every waiter's channel.
                inner.pending.clear();
            }
            let remaining: Vec<_> = inner.clients.values().cloned().collect();
            (remaining, was_host)
        };

        let disconnect = Event {
            room_id: Some(self.id.clone()),
            device_id: Some(client.device_id.clone()),
            payload: Some(json!({ "device_type": client.device_type })),
            ..Event::new(protocol::EVENT_PEER_DISCONNECTED)
        };

        if was_host {
            let status = Event {
                room_id: Some(self.id.clone()),
                payload: Some(json!({ "in_room": false, "mac_disconnected": true })),
                ..Event::new(protocol::EVENT_STATUS_UPDATE)
            };
            for member in &remaining {
                member.send(disconnect.clone());
                member.send(status.clone());
            }
        } else {
            for member in &remaining {
                member.send(disconnect.clone());
            }
            if let Some(host) = remaining
                .iter()
                .find(|m| m.device_type == DeviceType::Mac)
            {
                let watch_connected = remaining
                    .iter()
                    .any(|m| m.device_type == DeviceType::Watch);
                host.send(Event {
                    room_id: Some(self.id.clone()),
                    payload: Some(json!({
                        "in_room": true,
                        "watch_connected": watch_connected,
                    })),
                    ..Event::new(protocol::EVENT_STATUS_UPDATE)
                });
            }
        }
    }

    /// Any member with the given role. Rooms hold at most one host and,
    /// in practice, one peer.
    pub fn peer(&self, device_type: DeviceType) -> Option<Arc<Client>> {
        self.inner
            .lock()
            .clients
            .values()
            .find(|c| c.device_type == device_type)
            .cloned()
    }

    /// Best-effort enqueue on every member except `exclude_device_id`.
    /// Senders never see echoes of their own updates.
    pub fn broadcast_except(&self, exclude_device_id: &str, event: Event) {
        let targets: Vec<_> = {
            let inner = self.inner.lock();
            inner
                .clients
                .iter()
                .filter(|(device_id, _)| device_id.as_str() != exclude_device_id)
                .map(|(_, client)| client.clone())
                .collect()
        };
        for target in targets {
            target.send(event.clone());
        }
    }

    /// Register a single-shot waiter for `request_id`. The receiver is
    /// resolved by `fulfill_response`, closed by host departure, or
    /// abandoned via `cancel_response` on timeout.
    pub fn wait_for_response(&self, request_id: &str) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().pending.insert(request_id.to_string(), tx);
        rx
    }

    /// Resolve the waiter for `event.request_id`, if one is registered.
    /// Consuming the sender guarantees at-most-once fulfillment; repeat
    /// calls for the same id return false.
    pub fn fulfill_response(&self, event: &Event) -> bool {
        let Some(request_id) = event.request_id.as_deref().filter(|id| !id.is_empty()) else {
            return false;
        };
        let Some(tx) = self.inner.lock().pending.remove(request_id) else {
            return false;
        };
        // The waiter may already have timed out; either way the slot is gone.
        let _ = tx.send(event.clone());
        true
    }

    /// Drop the waiter for `request_id` (timeout path), so a late
    /// fulfillment finds nothing.
    pub fn cancel_response(&self, request_id: &str) {
        self.inner.lock().pending.remove(request_id);
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active
    }

    /// Flip the room back to active when its owner rejoins.
    pub fn reactivate(&self) {
        self.inner.lock().is_active = true;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("host_device_id", &self.host_device_id)
            .field("clients", &inner.clients.len())
            .field("pending", &inner.pending.len())
            .field("is_active", &inner.is_active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::Egress;

    fn member(id: &str, device_type: DeviceType) -> (Arc<Client>, Egress) {
        Client::new(id.to_string(), device_type)
    }

    fn drain(egress: &mut Egress) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = egress.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn reconnect_displaces_the_stale_session() {
        let room = Room::new("r1", "m1");
        let (old, _old_rx) = member("w1", DeviceType::Watch);
        let (new, _new_rx) = member("w1", DeviceType::Watch);

        room.add_client(old.clone());
        room.add_client(new.clone());

        assert!(old.is_closed(), "displaced session must be shut down");
        assert!(!new.is_closed());
        assert_eq!(room.client_count(), 1);
        assert!(Arc::ptr_eq(&room.peer(DeviceType::Watch).unwrap(), &new));
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_evict_the_replacement() {
        let room = Room::new("r1", "m1");
        let (old, _old_rx) = member("w1", DeviceType::Watch);
        let (new, _new_rx) = member("w1", DeviceType::Watch);

        room.add_client(old.clone());
        room.add_client(new.clone());
        // The stale session's disconnect handler fires late.
        room.remove_client(&old);

        assert_eq!(room.client_count(), 1);
        assert!(Arc::ptr_eq(&room.peer(DeviceType::Watch).unwrap(), &new));
        assert!(new.room().is_some());
    }

    #[tokio::test]
    async fn broadcast_excludes_the_sender() {
        let room = Room::new("r1", "m1");
        let (host, mut host_rx) = member("m1", DeviceType::Mac);
        let (watch, mut watch_rx) = member("w1", DeviceType::Watch);
        room.add_client(host.clone());
        room.add_client(watch.clone());
        drain(&mut host_rx);
        drain(&mut watch_rx);

        room.broadcast_except("m1", Event::new(protocol::EVENT_BATTERY_UPDATE));

        assert!(drain(&mut host_rx).is_empty());
        assert_eq!(drain(&mut watch_rx).len(), 1);
    }

    #[tokio::test]
    async fn join_broadcasts_peer_connected_to_others() {
        let room = Room::new("r1", "m1");
        let (host, mut host_rx) = member("m1", DeviceType::Mac);
        let (watch, _watch_rx) = member("w1", DeviceType::Watch);
        room.add_client(host.clone());
        room.add_client(watch.clone());

        let events = drain(&mut host_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, protocol::EVENT_PEER_CONNECTED);
        assert_eq!(events[0].payload.as_ref().unwrap()["device_type"], "watch");
    }

    #[tokio::test]
    async fn host_departure_deactivates_and_notifies_peers() {
        let room = Room::new("r1", "m1");
        let (host, _host_rx) = member("m1", DeviceType::Mac);
        let (watch, mut watch_rx) = member("w1", DeviceType::Watch);
        room.add_client(host.clone());
        room.add_client(watch.clone());
        drain(&mut watch_rx);

        room.remove_client(&host);

        assert!(!room.is_active());
        let events = drain(&mut watch_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, protocol::EVENT_PEER_DISCONNECTED);
        assert_eq!(events[0].payload.as_ref().unwrap()["device_type"], "mac");
        assert_eq!(events[1].event_type, protocol::EVENT_STATUS_UPDATE);
        let status = events[1].payload.as_ref().unwrap();
        assert_eq!(status["in_room"], false);
        assert_eq!(status["mac_disconnected"], true);
    }

    #[tokio::test]
    async fn host_departure_drains_pending_waiters() {
        let room = Room::new("r1", "m1");
        let (host, _host_rx) = member("m1", DeviceType::Mac);
        room.add_client(host.clone());

        let rx = room.wait_for_response("q1");
        assert_eq!(room.pending_count(), 1);

        room.remove_client(&host);

        assert_eq!(room.pending_count(), 0);
        assert!(rx.await.is_err(), "waiter channel must be closed");
    }

    #[tokio::test]
    async fn peer_departure_updates_host_status() {
        let room = Room::new("r1", "m1");
        let (host, mut host_rx) = member("m1", DeviceType::Mac);
        let (watch, _watch_rx) = member("w1", DeviceType::Watch);
        room.add_client(host.clone());
        room.add_client(watch.clone());
        drain(&mut host_rx);

        room.remove_client(&watch);

        assert!(room.is_active());
        let events = drain(&mut host_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, protocol::EVENT_PEER_DISCONNECTED);
        let status = events[1].payload.as_ref().unwrap();
        assert_eq!(status["in_room"], true);
        assert_eq!(status["watch_connected"], false);
    }

    #[tokio::test]
    async fn fulfill_response_is_at_most_once() {
        let room = Room::new("r1", "m1");
        let rx = room.wait_for_response("q1");

        let reply = Event {
            request_id: Some("q1".to_string()),
            ..Event::new(protocol::EVENT_ACTION_RESULT)
        };
        assert!(room.fulfill_response(&reply));
        assert!(!room.fulfill_response(&reply), "second fulfillment is a no-op");

        let received = rx.await.unwrap();
        assert_eq!(received.event_type, protocol::EVENT_ACTION_RESULT);
    }

    #[tokio::test]
    async fn fulfill_without_request_id_is_rejected() {
        let room = Room::new("r1", "m1");
        assert!(!room.fulfill_response(&Event::new(protocol::EVENT_RESPONSE)));
    }

    #[tokio::test]
    async fn cancelled_waiter_ignores_late_fulfillment() {
        let room = Room::new("r1", "m1");
        let _rx = room.wait_for_response("q1");
        room.cancel_response("q1");
        let reply = Event {
            request_id: Some("q1".to_string()),
            ..Event::new(protocol::EVENT_RESPONSE)
        };
        assert!(!room.fulfill_response(&reply));
    }
}
