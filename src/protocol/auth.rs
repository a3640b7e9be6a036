//! Bearer-token cache and device-credential exchange.
//!
//! The long-lived device credential is exchanged for a short-lived bearer
//! token via a form-encoded POST. The response body is newline-delimited
//! `key=value` text, not a wire message. The token is cached with its
//! expiry; one lock guards refresh so concurrent callers never issue
//! redundant exchanges.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::ProtocolError;
use super::transport::{maybe_gunzip, Transport};

const AUTH_URL: &str = "https://android.googleapis.com/auth";

/// Refresh this many seconds before the server-reported expiry.
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Fallback token lifetime when the response omits `Expiry`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// The long-lived credential identifying one device/account pair.
#[derive(Clone)]
pub struct DeviceCredential {
    pub email: String,
    pub device_token: String,
    pub device_id: String,
}

impl std::fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("email", &self.email)
            .field("device_token", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    /// Unix seconds.
    expires_at: i64,
}

/// Per-client token cache. Never a process-wide singleton: multiple clients
/// with different credentials can coexist.
pub struct TokenCache {
    transport: Arc<dyn Transport>,
    credential: DeviceCredential,
    auth_url: String,
    /// Held across the whole exchange, so waiters observe the fresh token
    /// instead of racing their own refresh.
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(transport: Arc<dyn Transport>, credential: DeviceCredential) -> Self {
        Self {
            transport,
            credential,
            auth_url: AUTH_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, refreshing it first when the cached one
    /// is absent or within the expiry buffer.
    pub async fn token(&self) -> Result<String, ProtocolError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - EXPIRY_BUFFER_SECS > now {
                return Ok(token.value.clone());
            }
        }

        debug!("exchanging device credential for a fresh bearer token");
        let fresh = self.exchange().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token; the next `token()` call performs an exchange.
    /// Used when the server rejects a request as unauthorized.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    async fn exchange(&self) -> Result<CachedToken, ProtocolError> {
        let form = form_encode(&[
            ("androidId", self.credential.device_id.as_str()),
            ("app", "com.google.android.apps.photos"),
            ("callerPkg", "com.google.android.apps.photos"),
            ("Email", self.credential.email.as_str()),
            ("Token", self.credential.device_token.as_str()),
            ("has_permission", "1"),
            ("oauth2_foreground", "1"),
            ("lang", "en-US"),
            ("device_country", "us"),
            (
                "service",
                "oauth2:https://www.googleapis.com/auth/photos.native",
            ),
        ]);
        let headers = vec![(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )];

        let resp = self
            .transport
            .post(&self.auth_url, &headers, Bytes::from(form))
            .await?;

        match resp.status {
            200 => {}
            status if status >= 500 => return Err(ProtocolError::Server { status }),
            status => {
                return Err(ProtocolError::AuthRejected(format!(
                    "exchange returned HTTP {status}"
                )))
            }
        }

        let body = maybe_gunzip(resp.header("content-encoding"), &resp.body)?;
        let text = String::from_utf8(body)
            .map_err(|_| ProtocolError::AuthRejected("response is not UTF-8".into()))?;
        parse_auth_response(&text)
    }

    #[cfg(test)]
    fn with_auth_url(mut self, url: &str) -> Self {
        self.auth_url = url.to_string();
        self
    }
}

/// Parse the newline-delimited `key=value` exchange response.
fn parse_auth_response(text: &str) -> Result<CachedToken, ProtocolError> {
    let mut auth = None;
    let mut expiry = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "Error" => return Err(ProtocolError::AuthRejected(value.to_string())),
            "Auth" => auth = Some(value.to_string()),
            "Expiry" => expiry = value.trim().parse::<i64>().ok(),
            _ => {}
        }
    }

    let value = auth.ok_or_else(|| ProtocolError::AuthRejected("response missing Auth".into()))?;
    let expires_at = expiry.unwrap_or_else(|| Utc::now().timestamp() + DEFAULT_LIFETIME_SECS);
    Ok(CachedToken { value, expires_at })
}

/// Minimal application/x-www-form-urlencoded encoder.
fn form_encode(pairs: &[(&str, &str)]) -> String {
    fn escape(out: &mut String, value: &str) {
        for byte in value.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                b' ' => out.push('+'),
                _ => out.push_str(&format!("%{byte:02X}")),
            }
        }
    }

    let mut out = String::new();
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        escape(&mut out, key);
        out.push('=');
        escape(&mut out, value);
    }
    out
}
