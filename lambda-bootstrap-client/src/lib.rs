#![deny(clippy::all)]
#![warn(missing_docs, nonstandard_style, rust_2018_idioms)]

//! Wire-level client for the AWS Lambda [custom runtime API].
//!
//! The control plane is a loopback HTTP/1.1 server; this crate owns the
//! whole exchange with it: a hand-rolled request encoder and streaming
//! response decoder, a persistent single-request-at-a-time connection, and
//! the typed operations a runtime drives the invocation loop with.
//!
//! [custom runtime API]: https://docs.aws.amazon.com/lambda/latest/dg/runtimes-api.html

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

mod connection;
mod diagnostic;
mod errors;
mod request_id;
mod requests;
mod response;

pub use connection::{CancelHandle, Connection, ConnectionConfig};
pub use diagnostic::Diagnostic;
pub use errors::{ClientError, ConnectionError, ProtocolError, UpstreamKind};
pub use request_id::RequestId;
pub use requests::{ControlPlaneRequest, API_PREFIX};
pub use response::{
    synthesize_trace_id, ControlPlaneResponse, InvocationMetadata, ResponseDecoder,
    MAX_PAYLOAD_SIZE,
};

/// Options for [`RuntimeApiClient::new`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-request timer, rearmed on every request.
    pub request_timeout: Option<Duration>,
    /// Hold the channel open between requests.
    pub keep_alive: bool,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            request_timeout: None,
            keep_alive: true,
        }
    }
}

/// Typed facade over the control-plane connection.
///
/// All methods take `&mut self`: the runtime API serves exactly one
/// outstanding request per execution environment, and the borrow checker is
/// the cheapest way to keep it that way.
#[derive(Debug)]
pub struct RuntimeApiClient {
    connection: Connection,
}

impl RuntimeApiClient {
    /// Build a client for the given control-plane endpoint. Nothing is
    /// dialed until the first request (or an explicit [`connect`]).
    ///
    /// [`connect`]: RuntimeApiClient::connect
    pub fn new(endpoint: SocketAddr, options: ClientOptions) -> RuntimeApiClient {
        RuntimeApiClient {
            connection: Connection::new(ConnectionConfig {
                endpoint,
                request_timeout: options.request_timeout,
                keep_alive: options.keep_alive,
            }),
        }
    }

    /// A handle that cancels whatever request is in flight.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.connection.cancel_handle()
    }

    /// Dial the control plane eagerly.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.connection.connect().await.map_err(ClientError::from)
    }

    /// Long-poll for the next invocation. Blocks until the control plane
    /// has work, the request is cancelled, or the channel fails.
    pub async fn next_invocation(
        &mut self,
    ) -> Result<(InvocationMetadata, Bytes), ClientError> {
        match self.connection.send(&ControlPlaneRequest::Next).await? {
            ControlPlaneResponse::Next(metadata, payload) => Ok((metadata, payload)),
            ControlPlaneResponse::Error { status, record } => {
                tracing::error!(
                    status,
                    error_type = %record.error_type,
                    "control plane rejected the poll"
                );
                Err(ClientError::BadStatusCode(status))
            }
            ControlPlaneResponse::Accepted => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Report a successful invocation result. The control plane answers a
    /// report with 202; anything else is an error.
    pub async fn report_success(
        &mut self,
        request_id: RequestId,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        let response = self
            .connection
            .send(&ControlPlaneRequest::InvocationResponse(request_id, payload))
            .await?;
        expect_accepted(response)
    }

    /// Report a failed invocation.
    pub async fn report_failure(
        &mut self,
        request_id: RequestId,
        diagnostic: Diagnostic,
    ) -> Result<(), ClientError> {
        let response = self
            .connection
            .send(&ControlPlaneRequest::InvocationError(request_id, diagnostic))
            .await?;
        expect_accepted(response)
    }

    /// Report a failure of handler construction, before any invocation ran.
    pub async fn report_init_failure(
        &mut self,
        diagnostic: Diagnostic,
    ) -> Result<(), ClientError> {
        let response = self
            .connection
            .send(&ControlPlaneRequest::InitializationError(diagnostic))
            .await?;
        expect_accepted(response)
    }

    /// Pipelined report: write the success POST and the next GET
    /// back-to-back, then collect the 202 and the next invocation in order.
    pub async fn report_success_and_next(
        &mut self,
        request_id: RequestId,
        payload: Bytes,
    ) -> Result<(InvocationMetadata, Bytes), ClientError> {
        let (first, second) = self
            .connection
            .send_pipelined(
                &ControlPlaneRequest::InvocationResponse(request_id, payload),
                &ControlPlaneRequest::Next,
            )
            .await?;
        expect_accepted(first)?;
        match second {
            ControlPlaneResponse::Next(metadata, payload) => Ok((metadata, payload)),
            ControlPlaneResponse::Error { status, record } => {
                tracing::error!(
                    status,
                    error_type = %record.error_type,
                    "control plane rejected the pipelined poll"
                );
                Err(ClientError::BadStatusCode(status))
            }
            ControlPlaneResponse::Accepted => Err(ClientError::UnexpectedResponse),
        }
    }
}

fn expect_accepted(response: ControlPlaneResponse) -> Result<(), ClientError> {
    match response {
        ControlPlaneResponse::Accepted => Ok(()),
        ControlPlaneResponse::Error { status, record } => {
            tracing::error!(
                status,
                error_type = %record.error_type,
                error_message = %record.error_message,
                "control plane rejected the report"
            );
            Err(ClientError::BadStatusCode(status))
        }
        ControlPlaneResponse::Next(metadata, _) => {
            tracing::error!(
                request_id = %metadata.request_id,
                "control plane answered a report with an invocation"
            );
            Err(ClientError::UnexpectedResponse)
        }
    }
}
