//! Wire errors for whole requests.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use sqlrest_domain::{codes, OperationError};
use sqlrest_server::BatchError;

/// Code for bodies over the configured size limit.
pub const PAYLOAD_TOO_LARGE: &str = "payload.too.large";

/// A request-level failure, rendered as `{errors: [{code, message}]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError(pub OperationError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self(OperationError::new(400, codes::BATCH_MALFORMED, message))
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self(OperationError::new(413, PAYLOAD_TOO_LARGE, message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self(OperationError::internal(message))
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn error(&self) -> &OperationError {
        &self.0
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.0.to_body())).into_response()
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        Self(err.to_operation_error())
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        Self(err)
    }
}

/// JSON extractor whose rejections are `batch.malformed` (400) instead of
/// axum's 415/422, keeping 413 for oversized bodies.
pub struct JsonBadRequest<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBadRequest<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBadRequest(value)),
            Err(rejection) => Err(rejection_error(rejection)),
        }
    }
}

fn rejection_error(rejection: JsonRejection) -> ApiError {
    let too_large = matches!(rejection, JsonRejection::BytesRejection(_))
        && rejection.status() == StatusCode::PAYLOAD_TOO_LARGE;
    let message = rejection.body_text();
    if too_large {
        ApiError::payload_too_large(message)
    } else {
        ApiError::malformed(message)
    }
}
