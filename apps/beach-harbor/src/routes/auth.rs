use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    http::{HeaderMap, Uri},
};
use harbor_signing::{unix_now, RequestParts, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use tracing::warn;

use super::ApiError;
use crate::state::AppState;

const MAX_SIGNED_BODY_BYTES: usize = 64 * 1024;

/// A request whose signature has been checked. Handlers read their query and
/// body from here so nothing is parsed before authentication succeeds.
#[derive(Debug)]
pub struct Signed {
    pub uri: Uri,
    pub body: Bytes,
}

#[async_trait]
impl FromRequest<AppState> for Signed {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES)
            .await
            .map_err(|_| ApiError::BadRequest("request body too large".into()))?;

        let request = RequestParts::new(parts.method.as_str(), parts.uri.path())
            .with_query(parts.uri.query().unwrap_or(""))
            .with_body(&body);

        state
            .verifier()
            .verify(
                &request,
                header_str(&parts.headers, TIMESTAMP_HEADER),
                header_str(&parts.headers, SIGNATURE_HEADER),
                unix_now(),
            )
            .map_err(|err| {
                warn!(
                    method = %parts.method,
                    path = %parts.uri.path(),
                    reason = %err,
                    "rejected signed request"
                );
                ApiError::from(err.rejection())
            })?;

        Ok(Signed {
            uri: parts.uri,
            body,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
