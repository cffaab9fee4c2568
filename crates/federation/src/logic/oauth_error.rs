//! OAuth2/OIDC shaped authorization errors (RFC 6749 section 4.1.2.1).
//!
//! The `hint` is shown to the client; `debug` is for server logs only and is
//! never written into a response.

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeErrorKind {
    InvalidRequest,
    InvalidClient,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    InvalidState,
    ServerError,
}

impl AuthorizeErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            AuthorizeErrorKind::InvalidRequest => "invalid_request",
            AuthorizeErrorKind::InvalidClient => "invalid_client",
            AuthorizeErrorKind::UnauthorizedClient => "unauthorized_client",
            AuthorizeErrorKind::AccessDenied => "access_denied",
            AuthorizeErrorKind::UnsupportedResponseType => "unsupported_response_type",
            AuthorizeErrorKind::InvalidScope => "invalid_scope",
            AuthorizeErrorKind::InvalidState => "invalid_state",
            AuthorizeErrorKind::ServerError => "server_error",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AuthorizeErrorKind::InvalidRequest => {
                "The request is missing a required parameter, includes an invalid parameter value, includes a parameter more than once, or is otherwise malformed."
            }
            AuthorizeErrorKind::InvalidClient => {
                "Client authentication failed (e.g., unknown client, no client authentication included, or unsupported authentication method)."
            }
            AuthorizeErrorKind::UnauthorizedClient => {
                "The client is not authorized to request a token using this method."
            }
            AuthorizeErrorKind::AccessDenied => {
                "The resource owner or authorization server denied the request."
            }
            AuthorizeErrorKind::UnsupportedResponseType => {
                "The authorization server does not support obtaining a token using this method."
            }
            AuthorizeErrorKind::InvalidScope => {
                "The requested scope is invalid, unknown, or malformed."
            }
            AuthorizeErrorKind::InvalidState => "The state is missing or does not have enough characters and is therefore considered too weak.",
            AuthorizeErrorKind::ServerError => {
                "The authorization server encountered an unexpected condition that prevented it from fulfilling the request."
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthorizeErrorKind::InvalidClient => StatusCode::UNAUTHORIZED,
            AuthorizeErrorKind::AccessDenied | AuthorizeErrorKind::UnauthorizedClient => {
                StatusCode::FORBIDDEN
            }
            AuthorizeErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            AuthorizeErrorKind::InvalidRequest
            | AuthorizeErrorKind::UnsupportedResponseType
            | AuthorizeErrorKind::InvalidScope
            | AuthorizeErrorKind::InvalidState => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}", .kind.code())]
pub struct AuthorizeError {
    kind: AuthorizeErrorKind,
    hint: Option<String>,
    debug: Option<String>,
}

impl AuthorizeError {
    pub fn new(kind: AuthorizeErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            debug: None,
        }
    }

    pub fn access_denied() -> Self {
        Self::new(AuthorizeErrorKind::AccessDenied)
    }

    pub fn invalid_request() -> Self {
        Self::new(AuthorizeErrorKind::InvalidRequest)
    }

    pub fn server_error() -> Self {
        Self::new(AuthorizeErrorKind::ServerError)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attaches detail that is logged but never returned to the client.
    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    pub fn kind(&self) -> AuthorizeErrorKind {
        self.kind
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn debug(&self) -> Option<&str> {
        self.debug.as_deref()
    }

    /// Description plus hint, as written to `error_description`.
    pub fn error_description(&self) -> String {
        match &self.hint {
            Some(hint) => format!("{} {}", self.kind.description(), hint),
            None => self.kind.description().to_string(),
        }
    }

    pub fn to_response_body(&self, state: Option<&str>) -> AuthorizeErrorBody {
        AuthorizeErrorBody {
            error: self.kind.code().to_string(),
            error_description: self.error_description(),
            state: state.map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthorizeErrorBody {
    pub error: String,
    pub error_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

pub fn log_authorize_error(message: &str, err: &AuthorizeError) {
    tracing::info!(
        error = err.kind().code(),
        hint = err.hint().unwrap_or_default(),
        debug = err.debug().unwrap_or_default(),
        "{message}"
    );
}
