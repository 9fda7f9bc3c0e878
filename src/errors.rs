//! Error taxonomy shared by the parser, the pool, and the connection state
//! machine.
//!
//! `ErrorKind` names the protocol/resource taxonomy; each variant also knows
//! how to render itself as a literal wire response via [`ErrorKind::as_http`]
//! (status line + `Connection: close` + either a JSON body or an empty one),
//! so the connection can fail a request without building a `Response`.
//! Errors that are programmer mistakes rather than attacker input (queuing
//! two responses, calling a builder method out of order) are `debug_assert!`
//! panics elsewhere, not `ErrorKind` variants — this enum is only ever
//! constructed from fallible, externally-triggerable conditions.

use crate::{query, Version};
use std::io;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub(crate) enum ErrorKind {
    #[error("invalid HTTP method")]
    InvalidMethod,

    #[error("invalid URL format")]
    InvalidUrl,
    #[error("invalid query string: {0}")]
    Query(#[from] query::Error),

    #[error("invalid HTTP version")]
    InvalidVersion,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("invalid header format")]
    InvalidHeader,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("invalid Connection header")]
    InvalidConnection,
    #[error("invalid chunked transfer-encoding framing")]
    ChunkedFraming,

    /// Resource exhaustion discovered while still inside the request line
    /// (no URL parsed yet): mapped to `414 URI Too Long`.
    #[error("request line too long")]
    UriTooLong,
    /// Resource exhaustion discovered anywhere past the request line
    /// (headers or body): mapped to `413 Payload Too Large`.
    #[error("request too large")]
    BodyTooLarge,
    #[error("body length mismatch: expected {expected}, available {available}")]
    BodyMismatch { expected: usize, available: usize },
    #[error("unexpected request body of {0} bytes")]
    UnexpectedBody(usize),

    #[error("peer disconnected")]
    PeerDisconnect,
    #[error("connection timed out")]
    TimeoutReached,
    #[error("application handler rejected the connection")]
    ApplicationError,
    #[error("daemon is shutting down")]
    DaemonShutdown,

    #[error("service temporarily unavailable")]
    ServiceUnavailable,
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;

        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        Query: "400 Bad Request", "55"
            => r#"{"error":"Invalid query string","code":"INVALID_QUERY"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidConnection: "400 Bad Request", "65"
            => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;
        ChunkedFraming: "400 Bad Request", "59"
            => r#"{"error":"Invalid chunked framing","code":"CHUNKED_FRAMING"}"#;

        UriTooLong: "414 URI Too Long", "52"
            => r#"{"error":"Request-URI too long","code":"URI_TOO_LONG"}"#;
        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        BodyMismatch: "400 Bad Request", "55"
            => r#"{"error":"Body length mismatch","code":"BODY_MISMATCH"}"#;
        UnexpectedBody: "400 Bad Request", "60"
            => r#"{"error":"Unexpected request body","code":"UNEXPECTED_BODY"}"#;

        PeerDisconnect: "400 Bad Request", "54"
            => r#"{"error":"Peer disconnected","code":"PEER_DISCONNECT"}"#;
        TimeoutReached: "408 Request Timeout", "52"
            => r#"{"error":"Connection timed out","code":"TIMEOUT"}"#;
        ApplicationError: "500 Internal Server Error", "58"
            => r#"{"error":"Application rejected request","code":"APPLICATION_ERROR"}"#;
        DaemonShutdown: "503 Service Unavailable", "56"
            => r#"{"error":"Server is shutting down","code":"SHUTTING_DOWN"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }

    /// Whether this error represents resource exhaustion discovered before
    /// any URL was parsed (§7 `ResourceExhaustion`/`ProtocolLimitExceeded`
    /// split between 414 and 413).
    pub(crate) fn is_uri_phase(&self) -> bool {
        matches!(self, ErrorKind::UriTooLong)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_json_and_plain_variants() {
        let err = ErrorKind::TooManyHeaders;
        let json = err.as_http(Version::Http11, true);
        let plain = err.as_http(Version::Http11, false);

        assert!(json.starts_with(b"HTTP/1.1 431"));
        assert!(plain.starts_with(b"HTTP/1.1 431"));
        assert!(plain.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn uri_phase_split_between_413_and_414() {
        assert!(ErrorKind::UriTooLong.is_uri_phase());
        assert!(!ErrorKind::BodyTooLarge.is_uri_phase());
        assert!(ErrorKind::UriTooLong
            .as_http(Version::Http11, false)
            .starts_with(b"HTTP/1.1 414"));
        assert!(ErrorKind::BodyTooLarge
            .as_http(Version::Http11, false)
            .starts_with(b"HTTP/1.1 413"));
    }
}
