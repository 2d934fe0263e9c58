use crate::{Diagnostic, RequestId};
use bytes::{Bytes, BytesMut};

/// Version prefix shared by every control-plane path.
pub const API_PREFIX: &str = "/2018-06-01/runtime";

// Preserved verbatim for wire compatibility with the control plane.
const USER_AGENT: &str = "Swift-Lambda/Unknown";

const FUNCTION_ERROR_HEADER: &[u8] = b"lambda-runtime-function-error-type: Unhandled\r\n";

/// An outbound request to the control plane.
#[derive(Debug, Clone)]
pub enum ControlPlaneRequest {
    /// `GET /invocation/next`, the long-poll for work.
    Next,
    /// `POST /invocation/<id>/response` carrying the handler's raw output.
    InvocationResponse(RequestId, Bytes),
    /// `POST /invocation/<id>/error` carrying a JSON error record.
    InvocationError(RequestId, Diagnostic),
    /// `POST /init/error` carrying a JSON error record.
    InitializationError(Diagnostic),
}

impl ControlPlaneRequest {
    /// Encode the request into `buf`. `scratch` is a reusable buffer for the
    /// JSON error record, kept alive across reports on the same connection.
    pub(crate) fn encode(
        &self,
        host: &str,
        keep_alive: bool,
        buf: &mut BytesMut,
        scratch: &mut BytesMut,
    ) {
        match self {
            ControlPlaneRequest::Next => {
                buf.extend_from_slice(b"GET ");
                buf.extend_from_slice(API_PREFIX.as_bytes());
                buf.extend_from_slice(b"/invocation/next HTTP/1.1\r\n");
                write_common_headers(host, keep_alive, buf);
                buf.extend_from_slice(b"\r\n");
            }
            ControlPlaneRequest::InvocationResponse(request_id, body) => {
                write_invocation_path(buf, request_id, b"/response");
                write_common_headers(host, keep_alive, buf);
                write_content_length(buf, body.len());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(body);
            }
            ControlPlaneRequest::InvocationError(request_id, diagnostic) => {
                scratch.clear();
                diagnostic.write_json(scratch);
                write_invocation_path(buf, request_id, b"/error");
                write_common_headers(host, keep_alive, buf);
                buf.extend_from_slice(FUNCTION_ERROR_HEADER);
                write_content_length(buf, scratch.len());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(scratch);
            }
            ControlPlaneRequest::InitializationError(diagnostic) => {
                scratch.clear();
                diagnostic.write_json(scratch);
                buf.extend_from_slice(b"POST ");
                buf.extend_from_slice(API_PREFIX.as_bytes());
                buf.extend_from_slice(b"/init/error HTTP/1.1\r\n");
                write_common_headers(host, keep_alive, buf);
                buf.extend_from_slice(FUNCTION_ERROR_HEADER);
                write_content_length(buf, scratch.len());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(scratch);
            }
        }
    }
}

fn write_invocation_path(buf: &mut BytesMut, request_id: &RequestId, suffix: &[u8]) {
    let mut rendered = [0u8; 36];
    request_id.write_lower(&mut rendered);
    buf.extend_from_slice(b"POST ");
    buf.extend_from_slice(API_PREFIX.as_bytes());
    buf.extend_from_slice(b"/invocation/");
    buf.extend_from_slice(&rendered);
    buf.extend_from_slice(suffix);
    buf.extend_from_slice(b" HTTP/1.1\r\n");
}

fn write_common_headers(host: &str, keep_alive: bool, buf: &mut BytesMut) {
    buf.extend_from_slice(b"host: ");
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(b"\r\nuser-agent: ");
    buf.extend_from_slice(USER_AGENT.as_bytes());
    buf.extend_from_slice(b"\r\n");
    if !keep_alive {
        buf.extend_from_slice(b"connection: close\r\n");
    }
}

fn write_content_length(buf: &mut BytesMut, len: usize) {
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    let mut value = len;
    loop {
        pos -= 1;
        digits[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(&digits[pos..]);
    buf.extend_from_slice(b"\r\n");
}
