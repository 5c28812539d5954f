//! Versioned request/response envelopes shared by every HTTP surface
//!
//! Compatibility rules:
//! - every body is a JSON object carrying `schema_version` (currently 1);
//! - a reader accepts any body with the same major version and rejects others;
//! - new fields are optional (`#[serde(default)]`) and readers ignore fields
//!   they do not know, so older readers keep working against newer writers.
//!
//! Errors travel as `{ "schema_version": 1, "error": ErrorBody }` and are
//! rebuilt into the same [`Error`] variant by [`HttpTransport`](crate::transport::HttpTransport).

use crate::error::ErrorBody;
use crate::{Error, Result};
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current wire schema major version
pub const SCHEMA_VERSION: u32 = 1;

fn current_version() -> u32 {
    SCHEMA_VERSION
}

/// A body with its schema version alongside the payload fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default = "current_version")]
    pub schema_version: u32,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            body,
        }
    }

    /// Unwrap the payload if this reader understands its version
    pub fn into_body(self) -> Result<T> {
        check_version(self.schema_version)?;
        Ok(self.body)
    }
}

pub fn check_version(version: u32) -> Result<()> {
    if version != SCHEMA_VERSION {
        return Err(Error::InvalidRequest(format!(
            "unsupported schema_version {} (this reader speaks {})",
            version, SCHEMA_VERSION
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default = "current_version")]
    pub schema_version: u32,
    pub error: ErrorBody,
}

/// Empty payload for requests and responses with nothing to say
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// JSON extractor and response for enveloped bodies
#[derive(Debug, Clone)]
pub struct Wire<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for Wire<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(envelope) = Json::<Envelope<T>>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError(Error::InvalidRequest(rejection.body_text())))?;
        Ok(Wire(envelope.into_body()?))
    }
}

impl<T: Serialize> IntoResponse for Wire<T> {
    fn into_response(self) -> Response {
        Json(Envelope::new(self.0)).into_response()
    }
}

/// An [`Error`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorEnvelope {
            schema_version: SCHEMA_VERSION,
            error: ErrorBody::from(&self.0),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Wire<T>, ApiError>;

pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidRequest(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::ShardNotFound(_) | Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
        Error::NotPrimary { .. } | Error::RoutingMismatch { .. } => StatusCode::MISDIRECTED_REQUEST,
        Error::Conflict { .. }
        | Error::StaleEpoch { .. }
        | Error::LeaseDenied { .. }
        | Error::LeaseExpired { .. } => StatusCode::CONFLICT,
        Error::SnapshotRequired { .. } => StatusCode::GONE,
        Error::PartialFailure { .. } | Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Unavailable { .. } | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Error::WalFull => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
