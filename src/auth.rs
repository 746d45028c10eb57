//! API-key authentication.
//!
//! Agents hold per-device keys issued by auto-registration. Only the
//! SHA-256 hash of a key is stored; the middleware resolves the `X-API-Key`
//! header (or `Authorization: Bearer`) against the relational store and
//! attaches the owning identity to the request.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::errors::AppError;
use crate::store::relational::RelationalStore;

/// Identity resolved from a valid API key, available to handlers via
/// request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub project_id: String,
    pub key_hash: String,
}

/// Hex SHA-256 of an API key; the only form that touches disk.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Generate a fresh API key. Returned to the agent exactly once.
pub fn generate_api_key() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 24] = rng.random();
    format!("mx-{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Authentication middleware for the protected routes.
pub async fn auth_middleware(
    State(store): State<Arc<RelationalStore>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.to_string())
        })
    else {
        return AppError::MissingApiKey.into_response();
    };

    let key_hash = hash_api_key(&key);
    let record = match store.api_key_by_hash(&key_hash) {
        Ok(Some(record)) => record,
        Ok(None) => return AppError::InvalidApiKey.into_response(),
        Err(e) => return AppError::StorageError(e.to_string()).into_response(),
    };

    if let Err(e) = store.touch_api_key(&key_hash) {
        tracing::debug!("Failed to update key last_used_at: {}", e);
    }

    request.extensions_mut().insert(AuthContext {
        user_id: record.user_id,
        project_id: record.project_id,
        key_hash,
    });

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_stable_hex() {
        let h1 = hash_api_key("mx-abc");
        let h2 = hash_api_key("mx-abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(h1, hash_api_key("mx-abd"));
    }

    #[test]
    fn generated_keys_are_unique_and_prefixed() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert!(a.starts_with("mx-"));
        assert_eq!(a.len(), 3 + 48);
        assert_ne!(a, b);
    }
}
