//! Request authentication for the exchange REST API.
//!
//! Signature: HMAC-SHA256 over `api_key || stamp`, where the stamp is a
//! strictly increasing millisecond value per process and the secret is the
//! base64-decoded API secret. The signature is emitted base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::clock::Clock;
use crate::error::{LirabotError, Result};

type HmacSha256 = Hmac<Sha256>;

/// API credentials. The decoded secret is zeroized on drop and never
/// included in error or debug output.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ApiCredentials {
    api_key: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &redact(&self.api_key))
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn redact(value: &str) -> String {
    if value.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &value[..4])
    }
}

impl ApiCredentials {
    /// Build credentials from the raw key and the base64-encoded secret.
    pub fn new(api_key: impl Into<String>, secret_base64: &str) -> Result<Self> {
        let secret = BASE64
            .decode(secret_base64.trim())
            .map_err(|_| LirabotError::InvalidConfig("api secret is not valid base64".into()))?;
        if secret.is_empty() {
            return Err(LirabotError::InvalidConfig("api secret is empty".into()));
        }
        Ok(Self {
            api_key: api_key.into(),
            secret,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

/// Auth header material for one request.
#[derive(Debug, Clone)]
pub struct AuthStamp {
    pub api_key: String,
    pub stamp_ms: i64,
    pub signature_base64: String,
}

/// Signs requests with a strictly increasing stamp.
pub struct RequestSigner {
    credentials: ApiCredentials,
    clock: Arc<dyn Clock>,
}

impl RequestSigner {
    pub fn new(credentials: ApiCredentials, clock: Arc<dyn Clock>) -> Self {
        Self { credentials, clock }
    }

    /// Produce the auth material for the next request. Each call consumes a
    /// fresh stamp, so stamps never repeat even under concurrent signing.
    pub fn sign_next(&self) -> Result<AuthStamp> {
        let stamp_ms = self.clock.monotonic_millis();
        let message = format!("{}{}", self.credentials.api_key, stamp_ms);

        let mut mac = HmacSha256::new_from_slice(&self.credentials.secret)
            .map_err(|_| LirabotError::Internal("hmac key of invalid length".into()))?;
        mac.update(message.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(AuthStamp {
            api_key: self.credentials.api_key.clone(),
            stamp_ms,
            signature_base64: BASE64.encode(signature),
        })
    }
}
