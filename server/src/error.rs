use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyError;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use displaydoc::Display;
use tracing_error::SpanTrace;

pub type ServerResult<T> = Result<T, ServerError>;

/// The kind of an error.
#[derive(Debug, Display)]
pub enum ErrorKind {
    /// The URL you requested was not found.
    NotFound,
    /// The requested store path does not exist.
    NoSuchPath,
    /// The requested NAR hash does not match the current store path.
    IncorrectNarHash,
    /// Store error: {0}
    StoreError(AnyError),
}
impl ErrorKind {
    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NoSuchPath => StatusCode::NOT_FOUND,
            Self::IncorrectNarHash => StatusCode::NOT_FOUND,
            Self::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body sent to clients.
    ///
    /// The 404 bodies are part of the binary-cache wire protocol;
    /// substituters match on them.
    fn client_body(&self) -> &'static str {
        match self {
            Self::NotFound => "File not found.\n",
            Self::NoSuchPath => "No such path.\n",
            Self::IncorrectNarHash => "Incorrect NAR hash. Maybe the path has been recreated.\n",
            Self::StoreError(_) => "Internal server error.\n",
        }
    }
}

/// A server error.
#[derive(Debug)]
pub struct ServerError {
    /// The kind of the error.
    kind: ErrorKind,
    /// Context of where the error occurred.
    context: SpanTrace,
}
impl ServerError {
    pub fn store_error(error: impl StdError + Send + Sync + 'static) -> Self {
        ErrorKind::StoreError(AnyError::new(error)).into()
    }
}
impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)?;
        Ok(())
    }
}
impl StdError for ServerError {}
impl From<ErrorKind> for ServerError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: SpanTrace::capture(),
        }
    }
}
impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(self.kind, ErrorKind::StoreError(_)) {
            tracing::error!("{}", self);
        }

        (
            self.kind.http_status_code(),
            [(header::CONTENT_TYPE, "text/plain")],
            self.kind.client_body(),
        )
            .into_response()
    }
}
