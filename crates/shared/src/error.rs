use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode, header};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("{msg}")]
    InvalidRequest {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("{msg}")]
    Forbidden {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("{msg}")]
    MethodNotAllowed {
        msg: String,
        /// Value of the `Allow` response header.
        #[serde(skip)]
        allowed: &'static str,
    },
    #[error("{msg}")]
    Unprocessable {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("{msg}")]
    BadGateway {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("internal server error")]
    Internal {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("serde json error")]
    SerdeSerializationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_json::Error,
    },
    #[error("address parse error")]
    AddrParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("reqwest error")]
    ReqwestError {
        #[serde(skip)]
        #[from]
        #[source]
        source: reqwest::Error,
    },
}

impl CommonError {
    /// Server-side fault with a message that is logged but never sent to the client.
    pub fn internal(msg: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        CommonError::Internal {
            msg: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CommonError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            CommonError::Forbidden { .. } => StatusCode::FORBIDDEN,
            CommonError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            CommonError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CommonError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            CommonError::Internal { .. }
            | CommonError::Unknown(_)
            | CommonError::IoError { .. }
            | CommonError::UrlParseError { .. }
            | CommonError::SerdeSerializationError { .. }
            | CommonError::AddrParseError { .. }
            | CommonError::ReqwestError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CommonError::InvalidRequest { .. } => "InvalidRequest",
            CommonError::Forbidden { .. } => "Forbidden",
            CommonError::MethodNotAllowed { .. } => "MethodNotAllowed",
            CommonError::Unprocessable { .. } => "Unprocessable",
            CommonError::BadGateway { .. } => "BadGateway",
            CommonError::Internal { .. }
            | CommonError::Unknown(_)
            | CommonError::IoError { .. }
            | CommonError::UrlParseError { .. }
            | CommonError::SerdeSerializationError { .. }
            | CommonError::AddrParseError { .. }
            | CommonError::ReqwestError { .. } => "InternalServerError",
        }
    }
}

impl IntoResponse for CommonError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let body = Json(ErrorResponse {
            name: self.name().to_string(),
            message: self.to_string(),
        });

        let mut response = (status, body).into_response();
        if let CommonError::MethodNotAllowed { allowed, .. } = self {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(allowed));
        }
        response
    }
}

/// Flattens an error and its sources into one line for server-side logs.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}

#[derive(Serialize)]
pub struct ErrorResponse {
    name: String,
    message: String,
}
