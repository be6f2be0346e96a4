//! Token verification and websocket credential extraction
//!
//! Browsers cannot set headers on websocket upgrades, so the stream
//! endpoint accepts a token from several places, in order: an explicit
//! `token` query parameter, a session cookie (only from an allow-listed
//! origin), a bearer `Authorization` header, and finally the
//! `Sec-WebSocket-Protocol` list.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Verifies HS256 access tokens and yields the subject.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<String, AppError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {e}")))?;
        Ok(data.claims.sub)
    }
}

/// Why a websocket credential could not be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsAuthError {
    MissingToken,
    OriginNotAllowed,
}

/// Normalize an origin to `scheme://host[:port]`, lowercased. Anything
/// without a scheme and authority is unusable.
pub fn normalize_origin(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (scheme, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if scheme.is_empty() || authority.is_empty() {
        return None;
    }
    Some(format!(
        "{}://{}",
        scheme.to_ascii_lowercase(),
        authority.to_ascii_lowercase()
    ))
}

/// Extract the websocket access token by precedence.
pub fn extract_ws_token(
    headers: &HeaderMap,
    query_token: Option<&str>,
    allowed_origins: &BTreeSet<String>,
) -> Result<String, WsAuthError> {
    if let Some(token) = query_token.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }

    if let Some(token) = cookie_token(headers) {
        // Cookie credentials are only honored for allow-listed origins.
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_origin);
        return match origin {
            Some(origin) if allowed_origins.contains(&origin) => Ok(token),
            _ => Err(WsAuthError::OriginNotAllowed),
        };
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ").map(str::trim) {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
    }

    if let Some(token) = subprotocol_token(headers) {
        return Ok(token);
    }

    Err(WsAuthError::MissingToken)
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    for pair in raw.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if matches!(name.trim(), "token" | "access_token") {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// `Sec-WebSocket-Protocol: bearer,<token>` (or `token,<token>`); a lone
/// segment is taken as the token itself.
fn subprotocol_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("sec-websocket-protocol")?.to_str().ok()?;
    let segments: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [prefix, token, ..] if prefix.eq_ignore_ascii_case("bearer")
            || prefix.eq_ignore_ascii_case("token") =>
        {
            Some(token.to_string())
        }
        [token] => Some(token.to_string()),
        _ => None,
    }
}
