//! Liveness endpoint for probes and dashboards.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u64,
    pub rooms: usize,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_ms: state.started.elapsed().as_millis() as u64,
        rooms: state.manager.room_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[tokio::test]
    async fn healthz_reports_room_count() {
        let settings = Settings {
            bind: "127.0.0.1:0".parse().unwrap(),
            jwt_secret: "test".to_string(),
        };
        let state = AppState::new(&settings);
        let Json(body) = healthz(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.rooms, 0);
    }

    #[tokio::test]
    async fn healthz_wire_keys_are_snake_case() {
        let settings = Settings {
            bind: "127.0.0.1:0".parse().unwrap(),
            jwt_secret: "test".to_string(),
        };
        let state = AppState::new(&settings);
        let Json(body) = healthz(State(state)).await;
        let value = serde_json::to_value(&body).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["rooms", "status", "uptime_ms"]);
        assert_eq!(value["status"], "ok");
        assert_eq!(value["rooms"], 0);
        assert!(value["uptime_ms"].is_u64());
    }
}
