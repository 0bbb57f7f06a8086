use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frames::FrameError;
use crate::session::state::SessionOpResult;
use crate::session::{SessionId, TopicName};

/// Every error response carries this JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    RequestValidation(String),
    #[error("missing required query parameter: {0}")]
    MissingParam(&'static str),
    #[error("topic does not exist: {0}")]
    TopicNotFound(TopicName),

    #[error("authentication required")]
    AuthenticationMissing,
    #[error("invalid credentials")]
    AuthenticationFailed,
    #[error("invalid bearer token")]
    InvalidToken,
    #[error("access denied")]
    AuthorisationDenied,
    #[error("openid connect provider unreachable: {0}")]
    OpenIdConnect(String),

    #[error("connection limit reached for session {0}")]
    InstanceLimitReached(SessionId),
    #[error("a {0} socket cannot join this session")]
    WrongSessionKind(&'static str),
    #[error("session registry could not complete the request: {0}")]
    IncompleteOp(String),

    #[error("kafka error: {0}")]
    Kafka(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::RequestValidation(_)
            | ProxyError::MissingParam(_)
            | ProxyError::TopicNotFound(_)
            | ProxyError::WrongSessionKind(_) => StatusCode::BAD_REQUEST,

            ProxyError::AuthenticationMissing
            | ProxyError::AuthenticationFailed
            | ProxyError::InvalidToken => StatusCode::UNAUTHORIZED,

            ProxyError::AuthorisationDenied => StatusCode::FORBIDDEN,

            ProxyError::InstanceLimitReached(_) => StatusCode::CONFLICT,

            ProxyError::OpenIdConnect(_) => StatusCode::SERVICE_UNAVAILABLE,

            ProxyError::IncompleteOp(_) | ProxyError::Kafka(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorMessage {
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<FrameError> for ProxyError {
    fn from(value: FrameError) -> Self {
        ProxyError::RequestValidation(value.to_string())
    }
}

impl From<crate::commit::CommitError> for ProxyError {
    fn from(value: crate::commit::CommitError) -> Self {
        ProxyError::Kafka(value.to_string())
    }
}

/// Registry outcomes that refuse a socket, mapped for the HTTP response.
/// `Updated` and `Unchanged` never come through here.
pub fn rejection_for(session_id: &SessionId, result: &SessionOpResult) -> ProxyError {
    match result {
        SessionOpResult::InstanceLimitReached(_) => {
            ProxyError::InstanceLimitReached(session_id.clone())
        }
        SessionOpResult::InstanceTypeForSessionIncorrect(session) => {
            ProxyError::WrongSessionKind(match session.kind() {
                crate::session::SessionKind::Consumer => "producer",
                crate::session::SessionKind::Producer => "consumer",
            })
        }
        SessionOpResult::SessionNotFound(id) => {
            ProxyError::IncompleteOp(format!("session {id} not found"))
        }
        SessionOpResult::IncompleteOp(message) => ProxyError::IncompleteOp(message.clone()),
        SessionOpResult::Updated(_) | SessionOpResult::Unchanged(_) => {
            ProxyError::IncompleteOp("unexpected rejection of a successful op".to_string())
        }
    }
}
