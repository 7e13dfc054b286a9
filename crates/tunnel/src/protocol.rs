//! Session protocol: one logical TCP connection as a series of HTTP requests
//!
//! Every request targets `/{session_id}`:
//!
//! | Method | Body              | Meaning                              |
//! |--------|-------------------|--------------------------------------|
//! | POST   | `host`, `port`    | open a session towards the target    |
//! | GET    | -                 | read what the target has sent        |
//! | PUT    | `data`            | write bytes to the target            |
//! | DELETE | -                 | close the session (idempotent)       |
//!
//! Bodies are `application/x-www-form-urlencoded`. Payloads are binary, so the
//! codec here works on bytes rather than strings.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use hyper::StatusCode;
use percent_encoding::{percent_decode, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use uuid::Uuid;

use crate::addr::Address;
use crate::error::ProtocolError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum payload moved by a single Read or Write call.
pub const BUFFER_SIZE: usize = 50 * 1024;
/// How long a Read waits for the target socket to become readable.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a Write waits for the target socket to become writable.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between downlink polls that returned nothing.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Inactivity after which a local connection is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const MAX_SESSION_ID_LEN: usize = 64;

// ============================================================================
// Session ID
// ============================================================================

/// Opaque session token chosen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random id (UUID v4 text).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let valid = !s.is_empty()
            && s.len() <= MAX_SESSION_ID_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(ProtocolError::InvalidSessionId(s.to_string()))
        }
    }

    /// Extract the id from a request path of the form `/{id}`.
    pub fn from_path(path: &str) -> Result<Self, ProtocolError> {
        match path.strip_prefix('/') {
            Some(rest) if !rest.contains('/') => Self::parse(rest),
            _ => Err(ProtocolError::InvalidSessionId(path.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Request path addressing this session.
    pub fn path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of an Open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Created,
    /// Missing or malformed `host` / `port`.
    BadRequest,
    /// The id is already in use.
    Duplicate,
    /// Target could not be resolved or no socket could be allocated.
    ConnectFailed,
}

impl OpenOutcome {
    pub fn status(self) -> StatusCode {
        match self {
            OpenOutcome::Created => StatusCode::OK,
            OpenOutcome::BadRequest => StatusCode::BAD_REQUEST,
            OpenOutcome::Duplicate => StatusCode::CONFLICT,
            OpenOutcome::ConnectFailed => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::OK => OpenOutcome::Created,
            StatusCode::CONFLICT => OpenOutcome::Duplicate,
            StatusCode::BAD_REQUEST => OpenOutcome::BadRequest,
            _ => OpenOutcome::ConnectFailed,
        }
    }
}

/// Result of a Read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes the target produced.
    Data(Bytes),
    /// The target closed its side of the connection.
    Eof,
    /// Nothing arrived within the read timeout.
    NoData,
    UnknownSession,
    /// Socket-level receive error; the session is kept.
    IoError,
}

impl ReadOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            ReadOutcome::Data(_) | ReadOutcome::Eof => StatusCode::OK,
            ReadOutcome::NoData => StatusCode::NO_CONTENT,
            ReadOutcome::UnknownSession => StatusCode::BAD_REQUEST,
            ReadOutcome::IoError => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Response body. Only `Data` carries one; `Eof` is an empty 200.
    pub fn into_body(self) -> Bytes {
        match self {
            ReadOutcome::Data(data) => data,
            _ => Bytes::new(),
        }
    }

    /// Classify a relay response. Unexpected statuses count as I/O errors.
    pub fn from_response(status: StatusCode, body: Bytes) -> Self {
        match status {
            StatusCode::OK if body.is_empty() => ReadOutcome::Eof,
            StatusCode::OK => ReadOutcome::Data(body),
            StatusCode::NO_CONTENT => ReadOutcome::NoData,
            StatusCode::BAD_REQUEST => ReadOutcome::UnknownSession,
            _ => ReadOutcome::IoError,
        }
    }
}

/// Result of a Write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    UnknownSession,
    /// Target never became writable; nothing was sent.
    Timeout,
    /// Socket-level send error, or a stall after part of the payload was sent.
    IoError,
    /// Payload exceeds [`BUFFER_SIZE`].
    TooLarge,
}

impl WriteOutcome {
    pub fn status(self) -> StatusCode {
        match self {
            WriteOutcome::Written => StatusCode::OK,
            WriteOutcome::UnknownSession => StatusCode::BAD_REQUEST,
            WriteOutcome::Timeout => StatusCode::GATEWAY_TIMEOUT,
            WriteOutcome::IoError => StatusCode::SERVICE_UNAVAILABLE,
            WriteOutcome::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::OK => WriteOutcome::Written,
            StatusCode::BAD_REQUEST => WriteOutcome::UnknownSession,
            StatusCode::GATEWAY_TIMEOUT => WriteOutcome::Timeout,
            StatusCode::PAYLOAD_TOO_LARGE => WriteOutcome::TooLarge,
            _ => WriteOutcome::IoError,
        }
    }
}

// ============================================================================
// Form encoding
// ============================================================================

/// Bytes left unescaped by `application/x-www-form-urlencoded`.
const FORM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*');

/// Encode name/value pairs. Values may be arbitrary bytes.
pub fn encode_form(pairs: &[(&str, &[u8])]) -> String {
    pairs
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                percent_encode(name.as_bytes(), FORM_ENCODE_SET),
                percent_encode(value, FORM_ENCODE_SET)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Decode a form body into name/value pairs, keeping blank values.
pub fn decode_form(body: &[u8]) -> Vec<(String, Vec<u8>)> {
    body.split(|&b| b == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = match pair.iter().position(|&b| b == b'=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, &pair[pair.len()..]),
            };
            let name = String::from_utf8_lossy(&form_unescape(name)).into_owned();
            (name, form_unescape(value))
        })
        .collect()
}

fn form_unescape(raw: &[u8]) -> Vec<u8> {
    let spaced: Vec<u8> = raw
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();
    percent_decode(&spaced).collect()
}

fn form_field(fields: &[(String, Vec<u8>)], name: &'static str) -> Result<Vec<u8>, ProtocolError> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
        .ok_or(ProtocolError::MissingField(name))
}

/// Body of an Open request.
pub fn encode_open(target: &Address) -> String {
    let port = target.port().to_string();
    encode_form(&[
        ("host", target.host().as_bytes()),
        ("port", port.as_bytes()),
    ])
}

pub fn decode_open(body: &[u8]) -> Result<Address, ProtocolError> {
    let fields = decode_form(body);
    let host = String::from_utf8(form_field(&fields, "host")?)
        .map_err(|_| ProtocolError::InvalidField("host"))?;
    if host.is_empty() {
        return Err(ProtocolError::InvalidField("host"));
    }
    let port = std::str::from_utf8(&form_field(&fields, "port")?)
        .ok()
        .and_then(|p| p.trim().parse::<u16>().ok())
        .ok_or(ProtocolError::InvalidField("port"))?;
    Ok(Address::new(host, port))
}

/// Body of a Write request.
pub fn encode_data(payload: &[u8]) -> String {
    encode_form(&[("data", payload)])
}

pub fn decode_data(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    form_field(&decode_form(body), "data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct_and_valid() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(SessionId::parse(a.as_str()).unwrap(), a);
        assert_eq!(SessionId::from_path(&a.path()).unwrap(), a);
    }

    #[test]
    fn test_session_id_rejects_bad_paths() {
        assert!(SessionId::from_path("/").is_err());
        assert!(SessionId::from_path("abc").is_err());
        assert!(SessionId::from_path("/a/b").is_err());
        assert!(SessionId::from_path("/a%20b").is_err());
        assert!(SessionId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_read_outcome_distinguishes_eof_from_no_data() {
        assert_eq!(ReadOutcome::Eof.status(), StatusCode::OK);
        assert_eq!(ReadOutcome::NoData.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            ReadOutcome::from_response(StatusCode::OK, Bytes::new()),
            ReadOutcome::Eof
        );
        assert_eq!(
            ReadOutcome::from_response(StatusCode::NO_CONTENT, Bytes::new()),
            ReadOutcome::NoData
        );
        assert_eq!(
            ReadOutcome::from_response(StatusCode::OK, Bytes::from_static(b"hi")),
            ReadOutcome::Data(Bytes::from_static(b"hi"))
        );
        assert_eq!(
            ReadOutcome::from_response(StatusCode::BAD_REQUEST, Bytes::new()),
            ReadOutcome::UnknownSession
        );
    }

    #[test]
    fn test_write_outcome_status_mapping() {
        for outcome in [
            WriteOutcome::Written,
            WriteOutcome::UnknownSession,
            WriteOutcome::Timeout,
            WriteOutcome::IoError,
            WriteOutcome::TooLarge,
        ] {
            assert_eq!(WriteOutcome::from_status(outcome.status()), outcome);
        }
        assert_eq!(WriteOutcome::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_binary_payload_survives_form_encoding() {
        let payload: Vec<u8> = (0..=255u8).chain(b"a+b=c&d %".iter().copied()).collect();
        let body = encode_data(&payload);
        assert!(body.is_ascii());
        assert_eq!(decode_data(body.as_bytes()).unwrap(), payload);
    }

    #[test]
    fn test_decode_form_plus_and_blank_values() {
        let fields = decode_form(b"data=a+b%2B&empty=&flag");
        assert_eq!(fields[0], ("data".to_string(), b"a b+".to_vec()));
        assert_eq!(fields[1], ("empty".to_string(), Vec::new()));
        assert_eq!(fields[2], ("flag".to_string(), Vec::new()));
        assert_eq!(decode_data(b"data=").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_open_form() {
        let target = Address::new("example.com", 7000);
        let body = encode_open(&target);
        assert_eq!(decode_open(body.as_bytes()).unwrap(), target);

        assert_eq!(
            decode_open(b"port=80"),
            Err(ProtocolError::MissingField("host"))
        );
        assert_eq!(
            decode_open(b"host=a&port=http"),
            Err(ProtocolError::InvalidField("port"))
        );
    }
}
