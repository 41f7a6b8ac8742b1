use thiserror::Error;

/// Closed set of error kinds surfaced to the host framework.
///
/// Every failure path in this crate terminates in exactly one of these, the
/// same way the teacher's `S3Error` closed over a fixed set of S3 failure
/// modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidOp,
    InvalidArgs,
    InvalidAddr,
    InvalidResponse,
    CorruptedHeader,
    NotFound,
    FileLocked,
    Conflict,
    Overloaded,
    NotAuthorized,
    NotSupported,
    NotImplemented,
    OperationExpired,
    RedirectLimit,
    TimerExpired,
    ConnectionError,
    SocketError,
    TlsError,
    LoginFailed,
    ServerError,
    ReqTimedOut,
    OverQuota,
    Impossible,
    DataError,
    OsError,
    InternalError,
    ErrorResponse,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidOp => "InvalidOp",
            ErrorKind::InvalidArgs => "InvalidArgs",
            ErrorKind::InvalidAddr => "InvalidAddr",
            ErrorKind::InvalidResponse => "InvalidResponse",
            ErrorKind::CorruptedHeader => "CorruptedHeader",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::FileLocked => "FileLocked",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Overloaded => "Overloaded",
            ErrorKind::NotAuthorized => "NotAuthorized",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::OperationExpired => "OperationExpired",
            ErrorKind::RedirectLimit => "RedirectLimit",
            ErrorKind::TimerExpired => "TimerExpired",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::SocketError => "SocketError",
            ErrorKind::TlsError => "TlsError",
            ErrorKind::LoginFailed => "LoginFailed",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::ReqTimedOut => "ReqTimedOut",
            ErrorKind::OverQuota => "OverQuota",
            ErrorKind::Impossible => "Impossible",
            ErrorKind::DataError => "DataError",
            ErrorKind::OsError => "OSError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::ErrorResponse => "ErrorResponse",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Builds an error whose message embeds the first few KiB of a server
    /// response body, so the host gets useful diagnostics without this
    /// crate buffering arbitrarily large error bodies.
    pub fn with_body(kind: ErrorKind, message: impl Into<String>, body: &[u8]) -> Self {
        const MAX_BODY: usize = 4096;
        let truncated = &body[..body.len().min(MAX_BODY)];
        let body_str = String::from_utf8_lossy(truncated);
        Self {
            kind,
            message: format!("{}: {}", message.into(), body_str),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::new(ErrorKind::InvalidArgs, e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::OsError, e.to_string())
    }
}

impl From<http::header::ToStrError> for Error {
    fn from(e: http::header::ToStrError) -> Self {
        Error::new(ErrorKind::CorruptedHeader, e.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Error::new(ErrorKind::InvalidArgs, e.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Error::new(ErrorKind::InvalidArgs, e.to_string())
    }
}

impl From<quick_xml::de::DeError> for Error {
    fn from(e: quick_xml::de::DeError) -> Self {
        Error::new(ErrorKind::InvalidResponse, e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let kind = from_transport(&e);
        Error::new(kind, e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::new(ErrorKind::InternalError, e.to_string())
    }
}

/// HTTP status -> error-kind mapping.
pub fn from_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::InvalidArgs,
        401 | 402 | 403 | 407 => ErrorKind::NotAuthorized,
        404 | 410 => ErrorKind::NotFound,
        405 | 406 => ErrorKind::InvalidArgs,
        408 => ErrorKind::ReqTimedOut,
        409 => ErrorKind::Conflict,
        411..=418 => ErrorKind::InvalidArgs,
        421 | 422 => ErrorKind::InvalidArgs,
        423 => ErrorKind::FileLocked,
        424..=428 => ErrorKind::InvalidArgs,
        429 => ErrorKind::Overloaded,
        431 => ErrorKind::InvalidArgs,
        451 => ErrorKind::Impossible,
        500 | 501 | 502 | 503 | 508 | 510 | 511 => ErrorKind::ServerError,
        504 => ErrorKind::ReqTimedOut,
        507 => ErrorKind::OverQuota,
        200..=299 => ErrorKind::Unknown,
        _ => ErrorKind::ErrorResponse,
    }
}

/// Transport-level (connect/TLS/DNS/timeout) failure classification for a
/// `reqwest::Error`, applied before falling back to the coarse `From` impl.
pub fn from_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::ReqTimedOut
    } else if err.is_redirect() {
        ErrorKind::RedirectLimit
    } else if err.is_connect() {
        ErrorKind::ConnectionError
    } else if err.is_builder() || err.is_request() {
        ErrorKind::InvalidArgs
    } else if let Some(source) = std::error::Error::source(err) {
        let text = source.to_string();
        if text.contains("certificate") || text.to_lowercase().contains("tls") {
            ErrorKind::TlsError
        } else if text.contains("dns") || text.contains("lookup") {
            ErrorKind::InvalidAddr
        } else {
            ErrorKind::SocketError
        }
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_map_representative_rows() {
        assert_eq!(from_status(404), ErrorKind::NotFound);
        assert_eq!(from_status(401), ErrorKind::NotAuthorized);
        assert_eq!(from_status(429), ErrorKind::Overloaded);
        assert_eq!(from_status(507), ErrorKind::OverQuota);
        assert_eq!(from_status(423), ErrorKind::FileLocked);
        assert_eq!(from_status(451), ErrorKind::Impossible);
        assert_eq!(from_status(200), ErrorKind::Unknown);
        assert_eq!(from_status(599), ErrorKind::ErrorResponse);
    }

    #[test]
    fn error_with_body_truncates() {
        let body = vec![b'a'; 5000];
        let err = Error::with_body(ErrorKind::ServerError, "failed", &body);
        assert!(err.message.len() < 5000);
    }
}
