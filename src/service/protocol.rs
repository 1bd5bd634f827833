//! Wire format for requests and responses.
//!
//! A request is one line of the form `<length>:<request_id>:<code>`. Only
//! the first two colons separate fields, so the code may contain colons.
//! The declared length is informational. Responses are rendered envelopes
//! (see [`crate::runtime::render_response`]) terminated by a newline.

use thiserror::Error;

use crate::runtime::{ExecutionResult, Limits, render_response};

/// Largest request id magnitude that survives a round trip through a JSON
/// number (2^53).
pub const MAX_REQUEST_ID: i64 = 1 << 53;

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Length prefix as sent by the client.
    pub declared_length: u64,
    /// Id echoed in the response.
    pub request_id: i64,
    /// Code to evaluate.
    pub code: String,
}

/// Malformed request lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Nothing left after stripping line terminators.
    #[error("empty request")]
    Empty,

    /// The bytes are not UTF-8 text.
    #[error("request is not valid UTF-8")]
    InvalidUtf8,

    /// Fewer than two `:` separators.
    #[error("expected '<length>:<request_id>:<code>'")]
    MissingSeparator,

    /// The length field is not a non-negative integer.
    #[error("invalid length field '{0}'")]
    InvalidLength(String),

    /// The request id field is not an integer.
    #[error("invalid request id '{0}'")]
    InvalidRequestId(String),

    /// The request id cannot be echoed exactly.
    #[error("request id {0} is out of range")]
    RequestIdOutOfRange(i64),
}

/// Drop trailing `\r` and `\n` bytes.
pub fn strip_line_terminator(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &bytes[..end]
}

/// Parse one received request.
pub fn parse_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let bytes = strip_line_terminator(bytes);
    if bytes.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let line = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    let mut fields = line.splitn(3, ':');
    let (Some(length), Some(id), Some(code)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(ProtocolError::MissingSeparator);
    };
    let declared_length = length
        .trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidLength(length.to_string()))?;
    let request_id = parse_request_id(id)?;
    Ok(Request {
        declared_length,
        request_id,
        code: code.to_string(),
    })
}

fn parse_request_id(field: &str) -> Result<i64, ProtocolError> {
    let id = field
        .trim()
        .parse::<i64>()
        .map_err(|_| ProtocolError::InvalidRequestId(field.to_string()))?;
    if id.unsigned_abs() > MAX_REQUEST_ID as u64 {
        return Err(ProtocolError::RequestIdOutOfRange(id));
    }
    Ok(id)
}

/// Best-effort request id from a line that failed to parse.
pub fn salvage_request_id(bytes: &[u8]) -> Option<i64> {
    let bytes = strip_line_terminator(bytes);
    let mut fields = bytes.splitn(3, |byte| *byte == b':');
    fields.next()?;
    let id = std::str::from_utf8(fields.next()?).ok()?;
    fields.next()?;
    parse_request_id(id).ok()
}

/// Encode a request line, without the trailing newline.
///
/// The length prefix counts the bytes of `"<id>:<code>"`.
pub fn encode_request(request_id: i64, code: &str) -> String {
    let message = format!("{request_id}:{code}");
    format!("{}:{message}", message.len())
}

/// Response for a request line that could not be parsed.
pub fn protocol_error_result(error: &ProtocolError, request_id: Option<i64>) -> ExecutionResult {
    ExecutionResult::failed(request_id, format!("protocol error: {error}"))
}

/// Render a response line for `result`.
pub fn format_response(result: &ExecutionResult, limits: &Limits) -> String {
    render_response(result, limits)
}
