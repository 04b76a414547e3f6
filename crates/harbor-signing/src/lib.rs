//! Canonical request signing for Beach Harbor's privileged callbacks.
//!
//! Game servers prove they were provisioned by the broker by signing each
//! callback with a shared secret. The signed message is
//!
//! ```text
//! METHOD\nPATH\nQUERY\nTIMESTAMP\nhex(sha256(body))
//! ```
//!
//! and the lowercase hex HMAC-SHA256 of that message travels in
//! [`SIGNATURE_HEADER`] next to the caller's Unix timestamp in
//! [`TIMESTAMP_HEADER`]. There is no nonce: a captured signature can be
//! replayed until its timestamp leaves the skew window, which is acceptable
//! because every protected operation is idempotent.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "Request-Timestamp";
pub const SIGNATURE_HEADER: &str = "Request-Signature";
pub const DEFAULT_MAX_SKEW_SECS: u64 = 300;

/// The parts of an HTTP request covered by the signature, minus the timestamp.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Raw query string without the leading `?`; empty when absent.
    pub query: &'a str,
    pub body: &'a [u8],
}

impl<'a> RequestParts<'a> {
    pub fn new(method: &'a str, path: &'a str) -> Self {
        Self {
            method,
            path,
            query: "",
            body: &[],
        }
    }

    pub fn with_query(mut self, query: &'a str) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: &'a [u8]) -> Self {
        self.body = body;
        self
    }
}

/// Header values a client attaches to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub signature: String,
}

pub fn canonical_message(parts: &RequestParts<'_>, timestamp: &str) -> String {
    let method = parts.method.to_ascii_uppercase();
    let body_digest = hex::encode(Sha256::digest(parts.body));
    [
        method.as_str(),
        parts.path,
        parts.query,
        timestamp,
        body_digest.as_str(),
    ]
    .join("\n")
}

pub fn sign(secret: &[u8], parts: &RequestParts<'_>, timestamp: &str) -> String {
    hex::encode(keyed_mac(secret, parts, timestamp).finalize().into_bytes())
}

/// Signs `parts` with the current time as the timestamp.
pub fn sign_now(secret: &[u8], parts: &RequestParts<'_>) -> SignedHeaders {
    let timestamp = unix_now().to_string();
    let signature = sign(secret, parts, &timestamp);
    SignedHeaders {
        timestamp,
        signature,
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

fn keyed_mac(secret: &[u8], parts: &RequestParts<'_>, timestamp: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(canonical_message(parts, timestamp).as_bytes());
    mac
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no signing secret configured")]
    NotConfigured,
    #[error("timestamp or signature header missing")]
    MissingHeaders,
    #[error("timestamp is not an integer")]
    MalformedTimestamp,
    #[error("timestamp outside skew window ({skew_secs}s)")]
    Stale { skew_secs: u64 },
    #[error("signature mismatch")]
    SignatureMismatch,
}

/// What a rejected caller is allowed to learn.
///
/// Missing headers, malformed timestamps and bad signatures all collapse into
/// [`Rejection::Unauthorized`] so the verifier cannot be used as an oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unavailable,
    Unauthorized,
    Stale,
}

impl VerifyError {
    pub fn rejection(&self) -> Rejection {
        match self {
            VerifyError::NotConfigured => Rejection::Unavailable,
            VerifyError::Stale { .. } => Rejection::Stale,
            VerifyError::MissingHeaders
            | VerifyError::MalformedTimestamp
            | VerifyError::SignatureMismatch => Rejection::Unauthorized,
        }
    }
}

#[derive(Clone)]
pub struct Verifier {
    secret: Option<Vec<u8>>,
    max_skew_secs: u64,
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("configured", &self.is_configured())
            .field("max_skew_secs", &self.max_skew_secs)
            .finish()
    }
}

impl Verifier {
    /// An empty secret counts as unconfigured; the verifier then fails closed.
    pub fn new(secret: Option<Vec<u8>>, max_skew_secs: u64) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            max_skew_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn max_skew_secs(&self) -> u64 {
        self.max_skew_secs
    }

    pub fn verify(
        &self,
        parts: &RequestParts<'_>,
        timestamp: Option<&str>,
        signature: Option<&str>,
        now_secs: i64,
    ) -> Result<(), VerifyError> {
        let secret = self.secret.as_deref().ok_or(VerifyError::NotConfigured)?;

        let timestamp = timestamp.filter(|value| !value.is_empty());
        let signature = signature.filter(|value| !value.is_empty());
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(VerifyError::MissingHeaders);
        };

        let issued_at: i64 = timestamp
            .parse()
            .map_err(|_| VerifyError::MalformedTimestamp)?;

        let skew_secs = now_secs.abs_diff(issued_at);
        if skew_secs > self.max_skew_secs {
            return Err(VerifyError::Stale { skew_secs });
        }

        let provided = hex::decode(signature).map_err(|_| VerifyError::SignatureMismatch)?;
        keyed_mac(secret, parts, timestamp)
            .verify_slice(&provided)
            .map_err(|_| VerifyError::SignatureMismatch)
    }
}
