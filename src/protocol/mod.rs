//! Wire protocol
//!
//! Defines the single `Event` record exchanged over the WebSocket, the
//! closed event-type vocabulary, and the device role tags. Payloads stay
//! opaque (`serde_json::Value`) and are only interpreted by the handlers
//! that recognize the event type.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// Connection events
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";

// Room events
pub const EVENT_CREATE_ROOM: &str = "create_room";
pub const EVENT_JOIN_ROOM: &str = "join_room";
pub const EVENT_LEAVE_ROOM: &str = "leave_room";
pub const EVENT_ROOM_JOINED: &str = "room_joined";
pub const EVENT_ROOM_STATUS: &str = "room_status";

// Data sync events
pub const EVENT_DEVICE_INFO: &str = "device_info";
pub const EVENT_BATTERY_UPDATE: &str = "battery_update";
pub const EVENT_STORAGE_UPDATE: &str = "storage_update";
pub const EVENT_DOWNLOADS_UPDATE: &str = "downloads_update";

// Action events
pub const EVENT_ACTION: &str = "action";
pub const EVENT_ACTION_REQUEST: &str = "action_request";
pub const EVENT_ACTION_RESULT: &str = "action_result";
pub const EVENT_MEDIA_ACTION: &str = "media_action";

// Generic request/response
pub const EVENT_REQUEST: &str = "request";
pub const EVENT_RESPONSE: &str = "response";
pub const EVENT_ERROR: &str = "error";

// Peer events
pub const EVENT_PEER_CONNECTED: &str = "peer_connected";
pub const EVENT_PEER_DISCONNECTED: &str = "peer_disconnected";

// Status events
pub const EVENT_STATUS_UPDATE: &str = "status_update";

/// Full wire vocabulary. Only a subset is routable; the rest exists so
/// clients and server agree on the namespace.
pub const EVENT_TYPES: [&str; 21] = [
    EVENT_CONNECT,
    EVENT_DISCONNECT,
    EVENT_CREATE_ROOM,
    EVENT_JOIN_ROOM,
    EVENT_LEAVE_ROOM,
    EVENT_ROOM_JOINED,
    EVENT_ROOM_STATUS,
    EVENT_DEVICE_INFO,
    EVENT_BATTERY_UPDATE,
    EVENT_STORAGE_UPDATE,
    EVENT_DOWNLOADS_UPDATE,
    EVENT_ACTION,
    EVENT_ACTION_REQUEST,
    EVENT_ACTION_RESULT,
    EVENT_MEDIA_ACTION,
    EVENT_REQUEST,
    EVENT_RESPONSE,
    EVENT_ERROR,
    EVENT_PEER_CONNECTED,
    EVENT_PEER_DISCONNECTED,
    EVENT_STATUS_UPDATE,
];

// Error codes carried in `error` event payloads
pub const ERR_INVALID_JSON: &str = "invalid_json";
pub const ERR_ROUTING: &str = "routing_error";
pub const ERR_MAC_UNAVAILABLE: &str = "mac_unavailable";
pub const ERR_PEER_UNAVAILABLE: &str = "peer_unavailable";
pub const ERR_TIMEOUT: &str = "timeout";

/// Milliseconds since the Unix epoch; the wire timestamp format.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Device role inside a room. The Mac is the privileged host; Watches are
/// peers. Role checks are explicit matches in the handlers, never dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mac,
    Watch,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Mac => "mac",
            DeviceType::Watch => "watch",
        }
    }

    /// The role a request gets forwarded to.
    pub fn opposite(self) -> DeviceType {
        match self {
            DeviceType::Mac => DeviceType::Watch,
            DeviceType::Watch => DeviceType::Mac,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown device type: {0}")]
pub struct UnknownDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mac" => Ok(DeviceType::Mac),
            "watch" => Ok(DeviceType::Watch),
            other => Err(UnknownDeviceType(other.to_string())),
        }
    }
}

/// The sole wire record. `timestamp` is stamped on ingress; whatever the
/// sender put there is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            room_id: None,
            device_id: None,
            request_id: None,
            timestamp: now_ms(),
            payload: None,
        }
    }

    /// An `error` event addressed back at the offending client.
    pub fn error(request_id: Option<String>, code: &str, message: &str) -> Self {
        Event {
            request_id,
            payload: Some(json!({ "code": code, "message": message })),
            ..Event::new(EVENT_ERROR)
        }
    }
}
