//! Authentication for the REST API
//!
//! Every `/api/v1` route requires the API key, sent either as
//! `X-API-Key: <key>` or `Authorization: Bearer <key>`. When no key is
//! configured one is generated at startup and written to the token file.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Authentication state shared across handlers
#[derive(Clone)]
pub struct AuthState {
    key: Arc<String>,
}

impl AuthState {
    pub fn new(key: String) -> Self {
        Self { key: Arc::new(key) }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn accepts(&self, presented: &str) -> bool {
        constant_time_eq(presented.as_bytes(), self.key.as_bytes())
    }
}

/// Generate a cryptographically secure 32-byte token, base64-encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Write the token to `path`, readable by owner and group only
pub fn write_token_file(token: &str, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    let mut file = options.open(path)?;

    // The mode above only applies to new files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o640))?;
    }
    file.write_all(token.as_bytes())?;

    tracing::info!("API token written to {}", path.display());
    Ok(())
}

/// Axum middleware rejecting requests without a valid API key
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let headers = request.headers();

    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer "))
        });

    let rejection = match presented {
        Some(key) if auth.accepts(key.trim()) => None,
        Some(_) => Some("invalid API key"),
        None => Some("missing API key"),
    };

    match rejection {
        None => next.run(request).await,
        Some(reason) => {
            tracing::warn!("Rejected {}: {}", request.uri().path(), reason);
            unauthorized(reason)
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "code": "unauthorized",
            "message": message,
        })),
    )
        .into_response()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
