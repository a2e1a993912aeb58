use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use gnode_rest::{MessageType, RestError};
use gnode_store::StoreError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::api::API_VERSION_HEADER;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Rest(#[from] RestError),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Failure of a request whose caller is known.
    #[error("{error}")]
    Authenticated {
        username: String,
        error: Box<ServerError>,
    },
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(what) => Self::Conflict(format!("{what} already exists")),
            other => Self::Rest(other.into()),
        }
    }
}

impl ServerError {
    /// Attach the caller so the error envelope reports `logged_in_as`.
    pub fn for_user(self, username: &str) -> Self {
        match self {
            ServerError::Authenticated { .. } => self,
            other => ServerError::Authenticated {
                username: username.to_string(),
                error: Box::new(other),
            },
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::Authenticated { error, .. } => error.status(),
            ServerError::Rest(e) => rest_status(e),
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn message_type(&self) -> MessageType {
        match self {
            ServerError::Authenticated { error, .. } => error.message_type(),
            ServerError::Rest(e) => e.message_type(),
            ServerError::Forbidden(_) => MessageType::NotAuthorized,
            ServerError::BadRequest(_) => MessageType::PostDataInvalid,
            ServerError::Conflict(_) => MessageType::BadParameter,
            ServerError::RateLimited => MessageType::TooManyRequests,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ServerError::Authenticated { error, .. } => error.details(),
            ServerError::Rest(e) => e.details(),
            ServerError::Forbidden(d) | ServerError::BadRequest(d) | ServerError::Conflict(d) => {
                Some(json!(d))
            }
            ServerError::RateLimited => None,
        }
    }
}

fn rest_status(e: &RestError) -> StatusCode {
    match e {
        RestError::DataParsing(_)
        | RestError::WrongParams(_)
        | RestError::BadParameter { .. }
        | RestError::PostDataInvalid(_)
        | RestError::BadFloatData { .. }
        | RestError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        RestError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        RestError::NotAuthorized => StatusCode::FORBIDDEN,
        RestError::DoesNotExist
        | RestError::WrongReference { .. }
        | RestError::InvalidObjectType(_) => StatusCode::NOT_FOUND,
        RestError::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
        RestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let message_type = self.message_type();
        let mut body = json!({
            "message_type": message_type.as_str(),
            "message": message_type.text(),
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }
        if let ServerError::Authenticated { username, .. } = &self {
            body["logged_in_as"] = json!(username);
        }

        let mut response = (status, axum::Json(body)).into_response();
        response.headers_mut().insert(
            API_VERSION_HEADER,
            HeaderValue::from_static(gnode_shared::constants::API_VERSION),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnode_shared::LocalId;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let cases = [
            (ServerError::from(RestError::DoesNotExist), StatusCode::NOT_FOUND),
            (
                ServerError::from(RestError::WrongReference {
                    field: "section".into(),
                    target: LocalId(3),
                }),
                StatusCode::NOT_FOUND,
            ),
            (ServerError::from(RestError::NotAuthorized), StatusCode::FORBIDDEN),
            (ServerError::from(RestError::NotAuthenticated), StatusCode::UNAUTHORIZED),
            (ServerError::from(RestError::InvalidMethod), StatusCode::METHOD_NOT_ALLOWED),
            (ServerError::from(StoreError::NotFound), StatusCode::NOT_FOUND),
            (ServerError::from(StoreError::NoDataDir), StatusCode::INTERNAL_SERVER_ERROR),
            (ServerError::from(StoreError::Duplicate("x".into())), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn authenticated_errors_name_the_caller() {
        let err = ServerError::from(RestError::NotAuthorized)
            .for_user("ada")
            .for_user("someone else");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message_type"], "not_authorized");
        assert_eq!(body["logged_in_as"], "ada");
    }

    #[tokio::test]
    async fn store_failures_hide_details() {
        let response = ServerError::from(StoreError::Migration("boom".into())).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message_type"], "server_error");
        assert!(body.get("details").is_none());
    }
}
