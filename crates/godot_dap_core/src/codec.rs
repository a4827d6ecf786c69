//! DAP wire codec.
//!
//! A frame is an HTTP-like header block followed by a JSON body:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <length bytes of JSON>
//! ```
//!
//! The body is always consumed by its declared length, never by asking the
//! JSON parser where the message ends. Header lookup is case-insensitive and
//! bare `\n` line endings are tolerated on input.

use crate::{DapError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const CONTENT_LENGTH: &str = "Content-Length";

/// Upper bound for a header block. Anything longer without a blank line is
/// treated as an unterminated header.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Upper bound for a single body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub seq: u64,
    pub request_seq: u64,
    pub success: bool,
    // Some peers answer with a response subtype that leaves this empty.
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
    /// Well-framed JSON that is none of the three shapes above.
    Unknown(Value),
}

impl Request {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Value) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments,
        }
    }
}

impl Response {
    /// Failure text as the peer reported it. DAP error responses may carry
    /// the text in `body.error.format` instead of `message`.
    pub fn error_message(&self) -> String {
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            return message.to_string();
        }
        self.body
            .get("error")
            .and_then(|error| error.get("format"))
            .and_then(Value::as_str)
            .unwrap_or("unknown adapter error")
            .to_string()
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let body = if self.body.is_null() {
            Value::Object(Default::default())
        } else {
            self.body.clone()
        };
        serde_json::from_value(body).map_err(|e| DapError::InvalidResponse {
            command: self.command.clone(),
            reason: e.to_string(),
        })
    }
}

impl Event {
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        Self {
            event: event.into(),
            body,
        }
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let body = if self.body.is_null() {
            Value::Object(Default::default())
        } else {
            self.body.clone()
        };
        serde_json::from_value(body).map_err(|e| DapError::InvalidResponse {
            command: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
            Message::Unknown(_) => "other",
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut value = match self {
            Message::Request(request) => serde_json::to_value(request)?,
            Message::Response(response) => serde_json::to_value(response)?,
            Message::Event(event) => serde_json::to_value(event)?,
            Message::Unknown(value) => return Ok(value.clone()),
        };
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::String(self.kind().to_string()));
        }
        Ok(value)
    }

    /// Classifies a decoded JSON body. A body whose `type` is missing or
    /// whose fields do not fit the declared shape becomes `Unknown` so the
    /// dispatcher can log it instead of tearing the connection down.
    pub fn from_value(value: Value) -> Message {
        let parsed = match value.get("type").and_then(Value::as_str) {
            Some("request") => serde_json::from_value(value.clone()).map(Message::Request),
            Some("response") => serde_json::from_value(value.clone()).map(Message::Response),
            Some("event") => serde_json::from_value(value.clone()).map(Message::Event),
            _ => return Message::Unknown(value),
        };
        parsed.unwrap_or(Message::Unknown(value))
    }
}

/// Encodes one message into a complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&message.to_value()?)?;
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes exactly one complete frame.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let mut content_length = None;
    let mut pos = 0;

    let body_start = loop {
        let Some(offset) = frame[pos..].iter().position(|b| *b == b'\n') else {
            return Err(DapError::decode("unterminated header block"));
        };
        let line = trim_line_ending(&frame[pos..pos + offset]);
        pos += offset + 1;
        if line.is_empty() {
            break pos;
        }
        if let Some(length) = parse_header_line(line)? {
            content_length = Some(length);
        }
    };

    let length = content_length
        .ok_or_else(|| DapError::decode(format!("missing {CONTENT_LENGTH} header")))?;
    let body = &frame[body_start..];
    if body.len() != length {
        return Err(DapError::decode(format!(
            "declared {CONTENT_LENGTH} {length} but frame carries {} body bytes",
            body.len()
        )));
    }

    decode_body(body)
}

fn decode_body(body: &[u8]) -> Result<Message> {
    let value = serde_json::from_slice::<Value>(body)
        .map_err(|e| DapError::decode(format!("invalid JSON payload: {e}")))?;
    Ok(Message::from_value(value))
}

/// Reads one raw frame (headers included) from the stream.
///
/// A clean end of stream before any header byte is reported as
/// `ConnectionLost`; any other short read is a decode error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let mut content_length = None;

    loop {
        let budget = MAX_HEADER_BYTES.saturating_sub(frame.len()) as u64;
        if budget == 0 {
            return Err(DapError::decode(format!(
                "header block exceeds {MAX_HEADER_BYTES} bytes without a blank line"
            )));
        }

        let start = frame.len();
        let read = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut frame)
            .await
            .map_err(|e| DapError::connection_lost(format!("read failed: {e}")))?;

        if read == 0 {
            return Err(if frame.is_empty() {
                DapError::connection_lost("peer closed the connection")
            } else {
                DapError::decode("stream ended inside header block")
            });
        }

        let line = &frame[start..];
        if !line.ends_with(b"\n") {
            continue;
        }
        let line = trim_line_ending(line);
        if line.is_empty() {
            break;
        }
        if let Some(length) = parse_header_line(line)? {
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| DapError::decode(format!("missing {CONTENT_LENGTH} header")))?;
    if length > MAX_BODY_BYTES {
        return Err(DapError::decode(format!(
            "body of {length} bytes exceeds maximum {MAX_BODY_BYTES}"
        )));
    }

    let start = frame.len();
    frame.resize(start + length, 0);
    reader
        .read_exact(&mut frame[start..])
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DapError::decode("stream ended inside body"),
            _ => DapError::connection_lost(format!("read failed: {e}")),
        })?;

    Ok(frame)
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Returns the body length for a `Content-Length` line, `None` for any other
/// well-formed header.
fn parse_header_line(line: &[u8]) -> Result<Option<usize>> {
    let line = std::str::from_utf8(line)
        .map_err(|_| DapError::decode("header line is not valid UTF-8"))?;
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| DapError::decode(format!("malformed header line: {line:?}")))?;

    if !key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }

    value
        .trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|e| DapError::decode(format!("invalid {CONTENT_LENGTH} value {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEADER_LOOKALIKE: &str = "Content-Length: 5\r\n\r\n{}\r\n";

    fn frame_of(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_request_round_trip_with_header_lookalike_payload() {
        let message = Message::Request(Request::new(
            7,
            "evaluate",
            json!({ "expression": HEADER_LOOKALIKE, "frameId": 0 }),
        ));
        let decoded = decode(&encode(&message).expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_response_round_trip() {
        let message = Message::Response(Response {
            seq: 12,
            request_seq: 3,
            success: false,
            command: "setVariable".into(),
            message: Some(HEADER_LOOKALIKE.into()),
            body: json!({ "error": { "id": 1, "format": "not supported" } }),
        });
        let decoded = decode(&encode(&message).expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_event_round_trip() {
        let message = Message::Event(Event::new(
            "output",
            json!({ "category": "stdout", "output": format!("\n\n{HEADER_LOOKALIKE}") }),
        ));
        let decoded = decode(&encode(&message).expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_encoded_header_counts_bytes_not_chars() {
        let message = Message::Event(Event::new("output", json!({ "output": "héllo ✓" })));
        let frame = encode(&message).expect("encode");
        let text = String::from_utf8(frame.clone()).expect("utf8");
        let (header, body) = text.split_once("\r\n\r\n").expect("header terminator");
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert!(body.len() > body.chars().count());
    }

    #[test]
    fn test_unrecognized_command_still_decodes_as_response() {
        let frame = frame_of(
            r#"{"seq":4,"type":"response","request_seq":2,"success":true,"command":"godotCustomThing","body":{"x":1}}"#,
        );
        match decode(&frame).expect("decode") {
            Message::Response(response) => {
                assert_eq!(response.command, "godotCustomThing");
                assert_eq!(response.request_seq, 2);
                assert_eq!(response.body, json!({ "x": 1 }));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_response_without_command_name_decodes() {
        let frame = frame_of(r#"{"seq":9,"type":"response","request_seq":5,"success":true}"#);
        match decode(&frame).expect("decode") {
            Message::Response(response) => {
                assert_eq!(response.request_seq, 5);
                assert!(response.command.is_empty());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_decodes_as_unknown() {
        let frame = frame_of(r#"{"seq":1,"type":"telemetry","data":[1,2]}"#);
        assert!(matches!(decode(&frame).expect("decode"), Message::Unknown(_)));

        let frame = frame_of(r#"{"seq":1,"type":"response","success":true}"#);
        assert!(
            matches!(decode(&frame).expect("decode"), Message::Unknown(_)),
            "response without request_seq cannot be routed"
        );
    }

    #[test]
    fn test_lowercase_header_and_extra_headers_accepted() {
        let body = r#"{"type":"event","event":"initialized"}"#;
        let frame = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            body.len(),
            body
        );
        assert!(matches!(
            decode(frame.as_bytes()).expect("decode"),
            Message::Event(Event { ref event, .. }) if event == "initialized"
        ));
    }

    #[test]
    fn test_malformed_headers_fail() {
        let err = decode(b"Content-Type: json\r\n\r\n{}").expect_err("missing length");
        assert!(matches!(err, DapError::ProtocolDecode(_)));

        let err = decode(b"Content-Length: ten\r\n\r\n{}").expect_err("bad length");
        assert!(err.to_string().contains("invalid Content-Length"), "{err}");

        let err = decode(b"Content-Length: 2\r\n{}").expect_err("unterminated");
        assert!(err.to_string().contains("unterminated header block"), "{err}");

        let err = decode(b"garbage line\r\n\r\n{}").expect_err("no colon");
        assert!(err.to_string().contains("malformed header line"), "{err}");
    }

    #[test]
    fn test_declared_length_must_match_body() {
        let err = decode(b"Content-Length: 10\r\n\r\n{}").expect_err("short body");
        assert!(matches!(err, DapError::ProtocolDecode(_)));

        let err = decode(b"Content-Length: 1\r\n\r\n{}").expect_err("long body");
        assert!(matches!(err, DapError::ProtocolDecode(_)));
    }

    #[test]
    fn test_invalid_json_body_fails() {
        let err = decode(&frame_of("{not json")).expect_err("invalid json");
        assert!(err.to_string().contains("invalid JSON payload"), "{err}");
    }

    #[test]
    fn test_error_message_prefers_message_then_error_format() {
        let mut response = Response {
            seq: 1,
            request_seq: 1,
            success: false,
            command: "launch".into(),
            message: Some("project not found".into()),
            body: json!({ "error": { "format": "fallback" } }),
        };
        assert_eq!(response.error_message(), "project not found");

        response.message = None;
        assert_eq!(response.error_message(), "fallback");

        response.body = Value::Null;
        assert_eq!(response.error_message(), "unknown adapter error");
    }

    #[tokio::test]
    async fn test_read_frame_splits_back_to_back_frames() {
        let first = Message::Event(Event::new("output", json!({ "output": HEADER_LOOKALIKE })));
        let second = Message::Event(Event::new("stopped", json!({ "reason": "breakpoint" })));
        let mut stream = encode(&first).expect("encode");
        stream.extend(encode(&second).expect("encode"));

        let mut reader: &[u8] = &stream;
        let frame = read_frame(&mut reader).await.expect("first frame");
        assert_eq!(decode(&frame).expect("decode"), first);
        let frame = read_frame(&mut reader).await.expect("second frame");
        assert_eq!(decode(&frame).expect("decode"), second);

        let err = read_frame(&mut reader).await.expect_err("eof");
        assert!(matches!(err, DapError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_read_frame_reports_truncation_as_decode_error() {
        let mut reader: &[u8] = b"Content-Length: 50\r\n\r\n{\"type\":";
        let err = read_frame(&mut reader).await.expect_err("truncated body");
        assert!(matches!(err, DapError::ProtocolDecode(_)));

        let mut reader: &[u8] = b"Content-Len";
        let err = read_frame(&mut reader).await.expect_err("truncated header");
        assert!(matches!(err, DapError::ProtocolDecode(_)));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_unbounded_header() {
        let stream = vec![b'x'; MAX_HEADER_BYTES + 10];
        let mut reader: &[u8] = &stream;
        let err = read_frame(&mut reader).await.expect_err("oversized header");
        assert!(err.to_string().contains("without a blank line"), "{err}");
    }
}
