use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;

/// Coarse classification of an [`HttpError`]: 4xx is the caller's fault,
/// everything else is ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Server,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("downstream error: {0}")]
    Downstream(#[from] reqwest::Error),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    /// A status relayed from another process, preserved exactly.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// A call into another service failed. The callee's error is preserved,
    /// status included, with the service name prepended to the stack.
    #[error("in service \"{service}\": {source}")]
    Cascading {
        service: String,
        status: u16,
        #[source]
        source: Box<HttpError>,
    },
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HttpError::Forbidden(_) => StatusCode::FORBIDDEN,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::Conflict(_) => StatusCode::CONFLICT,
            HttpError::Downstream(_) | HttpError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            HttpError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            HttpError::Cascading { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.status().is_client_error() {
            ErrorKind::Client
        } else {
            ErrorKind::Server
        }
    }

    /// Wrap an error from a call into `service`, keeping the original status.
    pub fn in_service(service: impl Into<String>, source: HttpError) -> HttpError {
        HttpError::Cascading {
            service: service.into(),
            status: source.status().as_u16(),
            source: Box::new(source),
        }
    }

    /// The full error stack: this error's message followed by each source in
    /// the chain, one per line.
    pub fn stack(&self) -> String {
        let mut lines = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            lines.push(format!("  caused by: {}", err));
            source = err.source();
        }
        lines.join("\n")
    }
}

/// Render an error as a plain-text response. With `redact` set (production
/// and staging), only the top-line message is written; the source chain stays
/// in the logs.
pub fn error_response(err: &HttpError, redact: bool) -> Response {
    let body = if redact { err.to_string() } else { err.stack() };
    Response::builder()
        .status(err.status())
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            HttpError::NotFound("missing".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HttpError::Unavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            HttpError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_split() {
        assert_eq!(HttpError::BadRequest("x".into()).kind(), ErrorKind::Client);
        assert_eq!(HttpError::Forbidden("x".into()).kind(), ErrorKind::Client);
        assert_eq!(HttpError::BadGateway("x".into()).kind(), ErrorKind::Server);
    }

    #[test]
    fn test_cascading_preserves_status() {
        let inner = HttpError::NotFound("no such user".into());
        let wrapped = HttpError::in_service("user", inner);
        assert_eq!(wrapped.status(), StatusCode::NOT_FOUND);
        assert_eq!(wrapped.kind(), ErrorKind::Client);
        assert!(wrapped.to_string().starts_with("in service \"user\""));
    }

    #[test]
    fn test_stack_includes_sources() {
        let inner = HttpError::Unauthorized("token expired".into());
        let wrapped = HttpError::in_service("cache", HttpError::in_service("user", inner));
        let stack = wrapped.stack();
        assert_eq!(stack.lines().count(), 3);
        assert!(stack.contains("in service \"user\""));
        assert!(stack.contains("token expired"));
    }

    #[test]
    fn test_redacted_response_status() {
        let inner = HttpError::Internal("disk on fire".into());
        let wrapped = HttpError::in_service("files", inner);
        let redacted = error_response(&wrapped, true);
        assert_eq!(redacted.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
