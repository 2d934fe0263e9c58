//! Streaming decoder for control-plane responses.
//!
//! The decoder is a resumable state machine over a growable byte buffer.
//! Each [`ResponseDecoder::decode`] call either completes one response,
//! returns `Ok(None)` to ask for more bytes (state intact), or fails with a
//! fatal [`ProtocolError`]. Lambda-specific headers are extracted on a
//! colon-offset fast path without building a header map.

use crate::{Diagnostic, ProtocolError, RequestId};
use bytes::{Bytes, BytesMut};
use rand::RngCore;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// The control plane never delivers more than 6 MiB of payload; a larger
/// `content-length` is rejected before any body byte is buffered.
pub const MAX_PAYLOAD_SIZE: u64 = 6 * 1024 * 1024;

/// A header line must carry its colon and CRLF within this limit.
const MAX_HEADER_LINE: usize = 256;

/// Metadata describing one invocation, extracted from a `/next` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationMetadata {
    /// The request ID for this invocation.
    pub request_id: RequestId,
    /// The function deadline in milliseconds since the Unix epoch.
    pub deadline_ms: u64,
    /// The ARN of the Lambda function, version, or alias being invoked.
    pub invoked_function_arn: String,
    /// The X-Ray tracing header, synthesized when the control plane omits it.
    pub trace_id: String,
    /// Client context sent by the AWS Mobile SDK, verbatim.
    pub client_context: Option<String>,
    /// Cognito identity information, verbatim.
    pub cognito_identity: Option<String>,
}

impl InvocationMetadata {
    fn from_head(head: PartialHead) -> Result<InvocationMetadata, ProtocolError> {
        let request_id = head.request_id.ok_or(ProtocolError::MissingRequestId)?;
        let deadline_ms = head.deadline_ms.ok_or(ProtocolError::MissingDeadline)?;
        let invoked_function_arn = match head.invoked_function_arn {
            Some(arn) if !arn.is_empty() => arn,
            _ => return Err(ProtocolError::MissingFunctionArn),
        };
        let trace_id = match head.trace_id {
            Some(trace_id) if !trace_id.is_empty() => trace_id,
            _ => synthesize_trace_id(),
        };
        Ok(InvocationMetadata {
            request_id,
            deadline_ms,
            invoked_function_arn,
            trace_id,
            client_context: head.client_context,
            cognito_identity: head.cognito_identity,
        })
    }
}

/// Synthesize an X-Ray tracing header in the `Root=1-<time>-<random>`
/// format, unsampled.
pub fn synthesize_trace_id() -> String {
    let now_sec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut random = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut random);
    let mut trace_id = String::with_capacity(50);
    let _ = write!(trace_id, "Root=1-{:08x}-", now_sec as u32);
    for byte in random {
        let _ = write!(trace_id, "{byte:02x}");
    }
    trace_id.push_str(";Sampled=0");
    trace_id
}

/// A decoded response from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneResponse {
    /// A 200 `/next` response: invocation metadata plus the event payload.
    Next(InvocationMetadata, Bytes),
    /// A 202 acknowledgement of a report.
    Accepted,
    /// A 400/403 response carrying a JSON error record.
    Error {
        /// The HTTP status code the record arrived with.
        status: u16,
        /// The decoded error record.
        record: Diagnostic,
    },
}

/// Headers accumulated while a response head is being parsed.
#[derive(Debug, Default)]
struct PartialHead {
    status_code: u16,
    content_length: Option<u64>,
    connection_close: bool,
    request_id: Option<RequestId>,
    deadline_ms: Option<u64>,
    invoked_function_arn: Option<String>,
    trace_id: Option<String>,
    client_context: Option<String>,
    cognito_identity: Option<String>,
}

#[derive(Debug)]
enum DecodeState {
    Idle,
    WaitingForStatusLine,
    ParsingHeaders(PartialHead),
    WaitingForBody(PartialHead),
}

/// The resumable response decoder.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecodeState,
    connection_close: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        ResponseDecoder::new()
    }
}

impl ResponseDecoder {
    /// A decoder ready for the first status line.
    pub fn new() -> ResponseDecoder {
        ResponseDecoder {
            state: DecodeState::Idle,
            connection_close: false,
        }
    }

    /// Whether the last completed response asked for the channel to close.
    pub fn connection_close(&self) -> bool {
        self.connection_close
    }

    /// Drop any partial parse and return to the idle state.
    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.connection_close = false;
    }

    /// Consume as much of `buf` as possible. Returns `Ok(None)` when more
    /// bytes are needed; the partial parse is kept for resumption.
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<ControlPlaneResponse>, ProtocolError> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Idle) {
                DecodeState::Idle | DecodeState::WaitingForStatusLine => {
                    let Some(line) = split_line(buf).map_err(|e| self.fail(e))? else {
                        self.state = DecodeState::WaitingForStatusLine;
                        return Ok(None);
                    };
                    let head = parse_status_line(&line).map_err(|e| self.fail(e))?;
                    self.state = DecodeState::ParsingHeaders(head);
                }
                DecodeState::ParsingHeaders(mut head) => {
                    let Some(line) = split_line(buf).map_err(|e| self.fail(e))? else {
                        self.state = DecodeState::ParsingHeaders(head);
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = DecodeState::WaitingForBody(head);
                    } else {
                        parse_header_line(&line, &mut head).map_err(|e| self.fail(e))?;
                        self.state = DecodeState::ParsingHeaders(head);
                    }
                }
                DecodeState::WaitingForBody(head) => {
                    let expected = head.content_length.unwrap_or(0) as usize;
                    if buf.len() < expected {
                        self.state = DecodeState::WaitingForBody(head);
                        return Ok(None);
                    }
                    let body = buf.split_to(expected).freeze();
                    self.connection_close = head.connection_close;
                    self.state = DecodeState::Idle;
                    return Ok(Some(finish(head, body).map_err(|e| self.fail(e))?));
                }
            }
        }
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        self.state = DecodeState::Idle;
        err
    }
}

/// Split one CRLF-terminated line off the front of `buf`. A line that does
/// not complete within the limit is fatal.
fn split_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
    let window = buf.len().min(MAX_HEADER_LINE + 2);
    if let Some(pos) = buf[..window].windows(2).position(|w| w == b"\r\n") {
        let line = buf.split_to(pos);
        let _ = buf.split_to(2);
        return Ok(Some(line));
    }
    if buf.len() > MAX_HEADER_LINE {
        return Err(ProtocolError::HeadTooLong);
    }
    Ok(None)
}

fn parse_status_line(line: &[u8]) -> Result<PartialHead, ProtocolError> {
    if line.len() < 12 || &line[..9] != b"HTTP/1.1 " {
        return Err(ProtocolError::InvalidStatusLine);
    }
    let digits = &line[9..12];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidStatusLine);
    }
    if line.len() > 12 && line[12] != b' ' {
        return Err(ProtocolError::InvalidStatusLine);
    }
    let status_code = digits
        .iter()
        .fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));
    Ok(PartialHead {
        status_code,
        ..PartialHead::default()
    })
}

fn parse_header_line(line: &[u8], head: &mut PartialHead) -> Result<(), ProtocolError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ProtocolError::MissingColon)?;
    let name = &line[..colon];
    let value = trim_whitespace(&line[colon + 1..]);

    // Keyed on the colon offset first so the common case is one length
    // check plus one case-folded comparison.
    match colon {
        4 if name_matches(name, b"date") => {}
        10 if name_matches(name, b"connection") => {
            if name_matches(value, b"close") {
                head.connection_close = true;
            }
        }
        12 if name_matches(name, b"content-type") => {}
        14 if name_matches(name, b"content-length") => {
            let length =
                parse_decimal(value).map_err(|()| ProtocolError::InvalidContentLength)?;
            if length > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::InvalidContentLength);
            }
            head.content_length = Some(length);
        }
        17 if name_matches(name, b"transfer-encoding") => {
            return Err(ProtocolError::ChunkedNotSupported);
        }
        23 if name_matches(name, b"lambda-runtime-trace-id") => {
            head.trace_id = Some(string_value(value));
        }
        26 if name_matches(name, b"lambda-runtime-deadline-ms") => {
            head.deadline_ms =
                Some(parse_decimal(value).map_err(|()| ProtocolError::InvalidDeadline)?);
        }
        29 if name_matches(name, b"lambda-runtime-aws-request-id") => {
            let value = std::str::from_utf8(value).map_err(|_| ProtocolError::InvalidRequestId)?;
            head.request_id =
                Some(RequestId::parse(value).ok_or(ProtocolError::InvalidRequestId)?);
        }
        29 if name_matches(name, b"lambda-runtime-client-context") => {
            head.client_context = Some(string_value(value));
        }
        31 if name_matches(name, b"lambda-runtime-cognito-identity") => {
            head.cognito_identity = Some(string_value(value));
        }
        35 if name_matches(name, b"lambda-runtime-invoked-function-arn") => {
            head.invoked_function_arn = Some(string_value(value));
        }
        _ => {
            // Unknown headers are skipped as long as the name is a valid
            // RFC 7230 token.
            if name.is_empty() || !name.iter().copied().all(is_token_char) {
                return Err(ProtocolError::HeaderInvalidCharacter);
            }
        }
    }
    Ok(())
}

fn finish(head: PartialHead, body: Bytes) -> Result<ControlPlaneResponse, ProtocolError> {
    match head.status_code {
        200 => {
            if body.is_empty() {
                return Err(ProtocolError::InvocationMissingPayload);
            }
            let metadata = InvocationMetadata::from_head(head)?;
            Ok(ControlPlaneResponse::Next(metadata, body))
        }
        202 => Ok(ControlPlaneResponse::Accepted),
        400 | 403 => {
            let record: Diagnostic =
                serde_json::from_slice(&body).map_err(|_| ProtocolError::InvalidErrorResponse)?;
            Ok(ControlPlaneResponse::Error {
                status: head.status_code,
                record,
            })
        }
        code => Err(ProtocolError::UnexpectedStatusCode(code)),
    }
}

/// Case-insensitive ASCII comparison via bitwise fold.
fn name_matches(name: &[u8], expected: &[u8]) -> bool {
    name.len() == expected.len()
        && name
            .iter()
            .zip(expected)
            .all(|(&a, &b)| (a & 0xdf) == (b & 0xdf))
}

fn trim_whitespace(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn string_value(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// Decimal parse with overflow protection: bail out before a multiplication
/// could wrap.
fn parse_decimal(value: &[u8]) -> Result<u64, ()> {
    if value.is_empty() {
        return Err(());
    }
    let mut acc: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(());
        }
        if acc > u64::MAX / 100 {
            return Err(());
        }
        acc = acc * 10 + u64::from(b - b'0');
    }
    Ok(acc)
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
