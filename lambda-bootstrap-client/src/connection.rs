//! Persistent HTTP/1.1 channel to the control plane.
//!
//! One logical task owns the connection, so `&mut self` on the send path is
//! what enforces the single-request-at-a-time contract. The channel is
//! keep-alive by default (RFC 7230 section 6.3) and reconnects lazily at the
//! next send after a close.

use crate::requests::ControlPlaneRequest;
use crate::response::{ControlPlaneResponse, ResponseDecoder};
use crate::ConnectionError;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// Connection behavior knobs, resolved from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The control-plane endpoint, dialed numerically (no name resolution).
    pub endpoint: SocketAddr,
    /// Per-request timer, rearmed on every send.
    pub request_timeout: Option<Duration>,
    /// Whether to hold the channel open between requests.
    pub keep_alive: bool,
}

/// Fires an out-of-band cancel on whatever request is in flight.
///
/// Each cancel resolves exactly one exchange: the one in flight when it
/// fires, or the next one issued if the channel was idle. Whether a
/// cancellation is a clean shutdown or a failure is for the caller to
/// decide.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<u64>>,
}

impl CancelHandle {
    /// Resolve the in-flight request with `Cancelled` and close the channel.
    pub fn cancel(&self) {
        self.tx.send_modify(|version| *version += 1);
    }
}

/// A persistent single-request-at-a-time channel to the control plane.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    host: String,
    stream: Option<TcpStream>,
    decoder: ResponseDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    // reused across error reports on the same connection
    scratch: BytesMut,
    cancel_tx: Arc<watch::Sender<u64>>,
    cancel_rx: watch::Receiver<u64>,
}

impl Connection {
    /// A disconnected channel; the first send dials the endpoint.
    pub fn new(config: ConnectionConfig) -> Connection {
        let (cancel_tx, cancel_rx) = watch::channel(0);
        Connection {
            host: config.endpoint.to_string(),
            config,
            stream: None,
            decoder: ResponseDecoder::new(),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buf: BytesMut::new(),
            scratch: BytesMut::new(),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// A handle that cancels the in-flight request from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Dial the endpoint if the channel is down.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(self.config.endpoint)
                .await
                .map_err(ConnectionError::Connect)?;
            let _ = stream.set_nodelay(true);
            tracing::debug!(endpoint = %self.config.endpoint, "connected to the control plane");
            self.stream = Some(stream);
            self.decoder.reset();
            self.read_buf.clear();
        }
        Ok(())
    }

    /// Issue one request and await its response.
    pub async fn send(
        &mut self,
        request: &ControlPlaneRequest,
    ) -> Result<ControlPlaneResponse, ConnectionError> {
        let mut responses = self.exchange(std::slice::from_ref(request), 1).await?;
        Ok(responses.pop().expect("one response decoded"))
    }

    /// Write two requests back-to-back and await both responses in order.
    ///
    /// This is the pipelined report path: the result POST and the next GET
    /// leave before the 202 for the first arrives.
    pub async fn send_pipelined(
        &mut self,
        first: &ControlPlaneRequest,
        second: &ControlPlaneRequest,
    ) -> Result<(ControlPlaneResponse, ControlPlaneResponse), ConnectionError> {
        let requests = [first.clone(), second.clone()];
        let mut responses = self.exchange(&requests, 2).await?;
        let tail = responses.pop().expect("two responses decoded");
        let head = responses.pop().expect("two responses decoded");
        Ok((head, tail))
    }

    async fn exchange(
        &mut self,
        requests: &[ControlPlaneRequest],
        expected: usize,
    ) -> Result<Vec<ControlPlaneResponse>, ConnectionError> {
        self.connect().await?;

        self.write_buf.clear();
        for request in requests {
            request.encode(
                &self.host,
                self.config.keep_alive,
                &mut self.write_buf,
                &mut self.scratch,
            );
        }

        let result = match self.config.request_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.drive_exchange(expected)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout),
                }
            }
            None => self.drive_exchange(expected).await,
        };

        match &result {
            Ok(_) if self.decoder.connection_close() || !self.config.keep_alive => self.close(),
            Ok(_) => {}
            Err(_) => self.close(),
        }
        result
    }

    async fn drive_exchange(
        &mut self,
        expected: usize,
    ) -> Result<Vec<ControlPlaneResponse>, ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::Reset)?;
        let write_buf = &self.write_buf;
        let read_buf = &mut self.read_buf;
        let decoder = &mut self.decoder;
        // the connection-owned receiver tracks which cancels have been
        // observed, so each cancel resolves exactly one exchange
        let cancel_rx = &mut self.cancel_rx;

        let io = async move {
            stream
                .write_all(write_buf)
                .await
                .map_err(map_io_error)?;
            let mut responses = Vec::with_capacity(expected);
            loop {
                while let Some(response) = decoder.decode(read_buf)? {
                    responses.push(response);
                    if responses.len() == expected {
                        return Ok(responses);
                    }
                }
                let read = stream.read_buf(read_buf).await.map_err(map_io_error)?;
                if read == 0 {
                    return Err(ConnectionError::Reset);
                }
            }
        };

        tokio::select! {
            result = io => result,
            _ = cancel_rx.changed() => Err(ConnectionError::Cancelled),
        }
    }

    fn close(&mut self) {
        self.stream = None;
        self.decoder.reset();
        self.read_buf.clear();
    }
}

fn map_io_error(err: io::Error) -> ConnectionError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ConnectionError::Reset,
        _ => ConnectionError::Io(err),
    }
}
