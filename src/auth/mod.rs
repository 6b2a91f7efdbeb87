//! Admission
//!
//! Clients present a bearer token in the upgrade request; the token is an
//! HS256 JWT whose claims identify the device. Validation happens before
//! any session state exists — a rejected token never reaches the broker.
//!
//! Required claims: `device_id` (non-empty) and `device_type` (`mac` or
//! `watch`). `exp` is honored when present but tokens are not required to
//! carry one.

use axum::http::StatusCode;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::protocol::DeviceType;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("missing or invalid device_id in token")]
    InvalidDeviceId,
    #[error("invalid device_type in token")]
    InvalidDeviceType,
}

impl AuthError {
    /// HTTP status the upgrade handler answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthError::InvalidDeviceId | AuthError::InvalidDeviceType => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_type: String,
}

/// Identity extracted from a validated token.
#[derive(Debug, Clone)]
pub struct DeviceClaims {
    pub device_id: String,
    pub device_type: DeviceType,
}

/// Validates bearer tokens against the process-wide signing secret.
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens may omit exp; when present it is still enforced.
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<DeviceClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<RawClaims>(token, &self.key, &self.validation)?;
        if data.claims.device_id.is_empty() {
            return Err(AuthError::InvalidDeviceId);
        }
        let device_type = data
            .claims
            .device_type
            .parse::<DeviceType>()
            .map_err(|_| AuthError::InvalidDeviceType)?;
        Ok(DeviceClaims {
            device_id: data.claims.device_id,
            device_type,
        })
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}
