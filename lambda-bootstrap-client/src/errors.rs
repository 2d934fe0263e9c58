//! Error taxonomy for the control-plane client.
//!
//! Protocol errors are fatal for the connection; transport errors are
//! recoverable by reconnecting at an invocation boundary; `Cancelled` is the
//! out-of-band shutdown path.

use std::{error, fmt, io};

/// A fatal violation of the control-plane wire protocol. The connection
/// that produced one of these is closed immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The response did not start with `HTTP/1.1 ` and a 3-digit status.
    InvalidStatusLine,
    /// A header line exceeded the decoder's line limit without a CRLF.
    HeadTooLong,
    /// A header line carried no colon.
    MissingColon,
    /// A header name contained a byte outside the RFC 7230 token set.
    HeaderInvalidCharacter,
    /// The control plane never chunks responses; seeing the header means we
    /// cannot slice-read the body.
    ChunkedNotSupported,
    /// `content-length` was not a decimal integer or exceeded the 6 MiB cap.
    InvalidContentLength,
    /// A `/next` response without `Lambda-Runtime-Aws-Request-Id`.
    MissingRequestId,
    /// The request ID header was not a canonical UUID.
    InvalidRequestId,
    /// A `/next` response without `Lambda-Runtime-Deadline-Ms`.
    MissingDeadline,
    /// The deadline header was not a decimal integer.
    InvalidDeadline,
    /// A `/next` response without `Lambda-Runtime-Invoked-Function-Arn`.
    MissingFunctionArn,
    /// A 200 `/next` response with no payload bytes.
    InvocationMissingPayload,
    /// A status code the control plane is never expected to return.
    UnexpectedStatusCode(u16),
    /// A 400/403 response whose body was not a JSON error record.
    InvalidErrorResponse,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidStatusLine => f.write_str("invalid HTTP status line"),
            ProtocolError::HeadTooLong => f.write_str("header line exceeds the line limit"),
            ProtocolError::MissingColon => f.write_str("header line without a colon"),
            ProtocolError::HeaderInvalidCharacter => {
                f.write_str("header name contains an invalid character")
            }
            ProtocolError::ChunkedNotSupported => {
                f.write_str("chunked transfer encoding is not supported")
            }
            ProtocolError::InvalidContentLength => f.write_str("invalid content length"),
            ProtocolError::MissingRequestId => f.write_str("response is missing the request id"),
            ProtocolError::InvalidRequestId => f.write_str("request id is not a canonical UUID"),
            ProtocolError::MissingDeadline => f.write_str("response is missing the deadline"),
            ProtocolError::InvalidDeadline => f.write_str("deadline is not a decimal integer"),
            ProtocolError::MissingFunctionArn => {
                f.write_str("response is missing the function ARN")
            }
            ProtocolError::InvocationMissingPayload => {
                f.write_str("invocation response carried no payload")
            }
            ProtocolError::UnexpectedStatusCode(code) => {
                write!(f, "unexpected status code {code}")
            }
            ProtocolError::InvalidErrorResponse => {
                f.write_str("error response body is not a JSON error record")
            }
        }
    }
}

impl error::Error for ProtocolError {}

/// Failure of a single request/response exchange on the persistent
/// connection.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Dialing the control-plane endpoint failed.
    Connect(io::Error),
    /// The channel failed mid-exchange.
    Io(io::Error),
    /// The peer closed the channel before delivering a full response.
    Reset,
    /// The per-request timer fired.
    Timeout,
    /// The in-flight request was cancelled out-of-band.
    Cancelled,
    /// The peer violated the wire protocol.
    Protocol(ProtocolError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Connect(err) => write!(f, "connect failed: {err}"),
            ConnectionError::Io(err) => write!(f, "channel error: {err}"),
            ConnectionError::Reset => f.write_str("connection reset by peer"),
            ConnectionError::Timeout => f.write_str("request timed out"),
            ConnectionError::Cancelled => f.write_str("request cancelled"),
            ConnectionError::Protocol(err) => write!(f, "protocol violation: {err}"),
        }
    }
}

impl error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ConnectionError::Connect(err) | ConnectionError::Io(err) => Some(err),
            ConnectionError::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> ConnectionError {
        ConnectionError::Protocol(err)
    }
}

/// The transport failure kinds a caller can recover from by reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// The per-request timer fired.
    Timeout,
    /// The peer reset the connection.
    ConnectionReset,
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamKind::Timeout => f.write_str("timeout"),
            UpstreamKind::ConnectionReset => f.write_str("connection reset"),
        }
    }
}

/// Failure of a runtime-client operation.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// A reporting call was answered with something other than 202, or
    /// `/next` with something other than 200.
    BadStatusCode(u16),
    /// The control plane stopped behaving like a loopback peer.
    UpstreamError(UpstreamKind),
    /// The peer violated the wire protocol.
    Protocol(ProtocolError),
    /// The in-flight request was cancelled out-of-band.
    Cancelled,
    /// The peer answered with a response kind the operation cannot use.
    UnexpectedResponse,
    /// Dialing the control-plane endpoint failed.
    Connect(io::Error),
    /// The channel failed mid-exchange.
    Io(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::BadStatusCode(code) => {
                write!(f, "control plane answered with status {code}")
            }
            ClientError::UpstreamError(kind) => write!(f, "upstream error: {kind}"),
            ClientError::Protocol(err) => write!(f, "protocol violation: {err}"),
            ClientError::Cancelled => f.write_str("request cancelled"),
            ClientError::UnexpectedResponse => f.write_str("unexpected response kind"),
            ClientError::Connect(err) => write!(f, "connect failed: {err}"),
            ClientError::Io(err) => write!(f, "channel error: {err}"),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ClientError::Connect(err) | ClientError::Io(err) => Some(err),
            ClientError::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConnectionError> for ClientError {
    fn from(err: ConnectionError) -> ClientError {
        match err {
            ConnectionError::Connect(err) => ClientError::Connect(err),
            ConnectionError::Io(err) => ClientError::Io(err),
            ConnectionError::Reset => ClientError::UpstreamError(UpstreamKind::ConnectionReset),
            ConnectionError::Timeout => ClientError::UpstreamError(UpstreamKind::Timeout),
            ConnectionError::Cancelled => ClientError::Cancelled,
            ConnectionError::Protocol(ProtocolError::UnexpectedStatusCode(code)) => {
                ClientError::BadStatusCode(code)
            }
            ConnectionError::Protocol(err) => ClientError::Protocol(err),
        }
    }
}
