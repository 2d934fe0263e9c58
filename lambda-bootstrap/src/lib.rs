#![deny(clippy::all)]
#![warn(missing_docs, nonstandard_style, rust_2018_idioms)]

//! A custom runtime for AWS Lambda: cold start, the `/next` long-poll loop,
//! handler dispatch, result reporting, shutdown hooks, and (in debug
//! builds) an in-process mock of the control plane for local testing.
//!
//! Handlers are [`tower::Service`]s over raw payload bytes; event models
//! and serialization live with the application, not here.
//!
//! ```no_run
//! use bytes::Bytes;
//! use lambda_bootstrap::{service_fn, Error, LambdaInvocation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     lambda_bootstrap::init_default_subscriber();
//!     let handler = service_fn(|invocation: LambdaInvocation| async move {
//!         Ok::<Bytes, Error>(invocation.payload)
//!     });
//!     lambda_bootstrap::run(handler).await
//! }
//! ```

use bytes::Bytes;
use futures::FutureExt;
use lambda_bootstrap_client::{ClientOptions, InvocationMetadata, RuntimeApiClient};
use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::{Service, ServiceExt};
use tracing::Instrument;

mod config;
mod context;
mod logging;
mod state;
mod terminator;

#[cfg(debug_assertions)]
mod pool;

#[cfg(debug_assertions)]
pub mod local_server;

pub use config::{Config, ConfigError, LogFormat, RUNTIME_ENDPOINT_VAR};
pub use context::{Context, InitContext};
pub use logging::{init_default_subscriber, init_subscriber};
pub use terminator::{HookFuture, RegistrationKey, TerminationError, Terminator};

pub use lambda_bootstrap_client::{
    CancelHandle, ClientError, Diagnostic, ProtocolError, RequestId, UpstreamKind,
};
pub use tower::{self, service_fn};

use state::StateMachine;

/// Error type the runtime and its handlers may produce.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// One unit of work: the raw event payload plus its execution context.
#[derive(Debug, Clone)]
pub struct LambdaInvocation {
    /// The event payload, exactly as the control plane delivered it.
    pub payload: Bytes,
    /// Per-invocation metadata and deadline arithmetic.
    pub context: Context,
}

impl LambdaInvocation {
    /// Split the invocation into its payload and context.
    pub fn into_parts(self) -> (Bytes, Context) {
        (self.payload, self.context)
    }
}

/// Handler construction failed; the failure was reported to
/// `/init/error` and the process should exit non-zero.
#[derive(Debug)]
pub struct InitError(pub Diagnostic);

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler initialization failed: {}: {}",
            self.0.error_type, self.0.error_message
        )
    }
}

impl std::error::Error for InitError {}

/// The invocation loop failed and one or more termination hooks failed on
/// the way out. Both sides are preserved.
#[derive(Debug)]
pub struct ShutdownError {
    /// What took the loop down.
    pub runtime_error: Error,
    /// The aggregated termination-hook failures.
    pub termination_error: TerminationError,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; shutdown also failed: {}",
            self.runtime_error, self.termination_error
        )
    }
}

impl std::error::Error for ShutdownError {}

/// Triggers orderly shutdown from another task, typically the stop-signal
/// listener.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    cancel: CancelHandle,
}

impl ShutdownHandle {
    /// Mark the runtime as shutting down and cancel the in-flight request.
    /// The loop drains the terminator and exits cleanly.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// The runtime: owns the control-plane client, the configuration, and the
/// shutdown-hook registry for one process lifetime.
pub struct Runtime {
    config: Config,
    client: RuntimeApiClient,
    terminator: Terminator,
    shutdown: Arc<AtomicBool>,
}

impl Runtime {
    /// Build a runtime from a resolved configuration.
    pub fn new(config: Config) -> Runtime {
        let client = RuntimeApiClient::new(
            config.api_endpoint,
            ClientOptions {
                request_timeout: config.request_timeout,
                keep_alive: config.keep_alive,
            },
        );
        Runtime {
            config,
            client,
            terminator: Terminator::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shutdown-hook registry. Hooks registered here run in reverse
    /// order after the loop exits.
    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    /// A handle that triggers orderly shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            cancel: self.client.cancel_handle(),
        }
    }

    /// A handle that cancels the in-flight control-plane request without
    /// marking the runtime as shutting down. A cancellation outside
    /// shutdown surfaces as a loop failure.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.client.cancel_handle()
    }

    /// Run an already-built handler. Equivalent to a factory that cannot
    /// fail.
    pub async fn run<S, R, E>(self, handler: S) -> Result<(), Error>
    where
        S: Service<LambdaInvocation, Response = R, Error = E>,
        R: Into<Bytes>,
        E: Into<Diagnostic> + fmt::Debug,
    {
        self.run_with_factory(move |_| std::future::ready(Ok::<S, Diagnostic>(handler)))
            .await
    }

    /// Cold-start the handler through `factory`, then poll for invocations
    /// until shutdown, a fatal error, or the configured invocation limit.
    ///
    /// A factory failure is reported to `/init/error` and surfaces as
    /// [`InitError`]. Termination hooks run on every exit path; their
    /// failures are combined with the loop result.
    pub async fn run_with_factory<F, Fut, S, R, E, IE>(mut self, factory: F) -> Result<(), Error>
    where
        F: FnOnce(InitContext) -> Fut,
        Fut: Future<Output = Result<S, IE>>,
        IE: Into<Diagnostic>,
        S: Service<LambdaInvocation, Response = R, Error = E>,
        R: Into<Bytes>,
        E: Into<Diagnostic> + fmt::Debug,
    {
        let mut machine = StateMachine::new();

        #[cfg(unix)]
        let signal_task =
            spawn_stop_signal_listener(self.config.stop_signal, self.shutdown_handle())?;

        let loop_result = self.run_loop(&mut machine, factory).await;
        if let Err(err) = &loop_result {
            tracing::error!(error = %err, "invocation loop failed");
        }
        let termination = self.terminator.terminate().await;

        #[cfg(unix)]
        signal_task.abort();

        match (loop_result, termination) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(runtime_error), Ok(())) => Err(runtime_error),
            (Ok(()), Err(termination_error)) => Err(Box::new(termination_error)),
            (Err(runtime_error), Err(termination_error)) => Err(Box::new(ShutdownError {
                runtime_error,
                termination_error,
            })),
        }
    }

    async fn run_loop<F, Fut, S, R, E, IE>(
        &mut self,
        machine: &mut StateMachine,
        factory: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(InitContext) -> Fut,
        Fut: Future<Output = Result<S, IE>>,
        IE: Into<Diagnostic>,
        S: Service<LambdaInvocation, Response = R, Error = E>,
        R: Into<Bytes>,
        E: Into<Diagnostic> + fmt::Debug,
    {
        machine.start();
        match self.client.connect().await {
            Ok(()) => machine.connection_ready(),
            Err(err) => {
                machine.connection_failed();
                return Err(Box::new(err));
            }
        }

        let init_context = InitContext {
            config: self.config.clone(),
            terminator: self.terminator.clone(),
        };
        let mut handler = match factory(init_context).await {
            Ok(handler) => {
                machine.handler_created();
                handler
            }
            Err(err) => {
                machine.handler_creation_failed();
                let diagnostic: Diagnostic = err.into();
                tracing::error!(
                    error_type = %diagnostic.error_type,
                    error_message = %diagnostic.error_message,
                    "handler initialization failed"
                );
                match self.client.report_init_failure(diagnostic.clone()).await {
                    Ok(()) => machine.accepted_received(),
                    Err(report_err) => {
                        machine.error_response_received();
                        tracing::error!(
                            error = %report_err,
                            "unable to report the initialization failure"
                        );
                    }
                }
                return Err(Box::new(InitError(diagnostic)));
            }
        };

        let mut processed: u32 = 0;
        let mut pending: Option<(InvocationMetadata, Bytes)> = None;

        loop {
            if self.shutting_down() && pending.is_none() {
                machine.channel_inactive(true);
                return Ok(());
            }

            let (metadata, payload) = match pending.take() {
                Some(prefetched) => prefetched,
                None => match self.client.next_invocation().await {
                    Ok(invocation) => invocation,
                    Err(ClientError::Cancelled) if self.shutting_down() => {
                        machine.channel_inactive(true);
                        return Ok(());
                    }
                    Err(err) => {
                        machine.channel_inactive(false);
                        return Err(Box::new(err));
                    }
                },
            };

            let context = Context::new(metadata);
            let request_id = context.request_id;
            machine.invocation_received(request_id);

            let span = context.request_span();
            let result = invoke(&mut handler, LambdaInvocation { payload, context })
                .instrument(span)
                .await;

            processed += 1;
            let at_limit =
                self.config.max_invocations > 0 && processed >= self.config.max_invocations;
            let pipeline = self.config.pipelining
                && result.is_ok()
                && !at_limit
                && !self.shutting_down();
            machine.invocation_finished(pipeline);

            let report = match result {
                Ok(payload) => {
                    if pipeline {
                        match self
                            .client
                            .report_success_and_next(request_id, payload)
                            .await
                        {
                            Ok(next) => {
                                pending = Some(next);
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    } else {
                        self.client.report_success(request_id, payload).await
                    }
                }
                Err(diagnostic) => self.client.report_failure(request_id, diagnostic).await,
            };

            match report {
                Ok(()) => machine.accepted_received(),
                Err(ClientError::Cancelled) if self.shutting_down() => {
                    machine.channel_inactive(true);
                    return Ok(());
                }
                Err(err) => {
                    machine.error_response_received();
                    return Err(Box::new(err));
                }
            }

            if at_limit {
                tracing::info!(processed, "configured invocation limit reached");
                machine.channel_inactive(true);
                return Ok(());
            }
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Drive one invocation through the handler, catching panics on both sides
/// of the await point.
async fn invoke<S, R, E>(
    handler: &mut S,
    invocation: LambdaInvocation,
) -> Result<Bytes, Diagnostic>
where
    S: Service<LambdaInvocation, Response = R, Error = E>,
    R: Into<Bytes>,
    E: Into<Diagnostic> + fmt::Debug,
{
    match handler.ready().await {
        Ok(handler) => {
            // Catches panics outside of the returned future
            let task = panic::catch_unwind(panic::AssertUnwindSafe(|| handler.call(invocation)));
            let task = match task {
                // Catches panics inside of the future
                Ok(task) => panic::AssertUnwindSafe(task).catch_unwind().await,
                Err(err) => Err(err),
            };
            match task {
                Ok(Ok(response)) => Ok(response.into()),
                Ok(Err(err)) => {
                    tracing::error!("handler error: {err:?}");
                    Err(err.into())
                }
                Err(err) => {
                    tracing::error!("{err:?}");
                    let error_type = type_name_of_val(&err);
                    let message = if let Some(message) = err.downcast_ref::<&str>() {
                        format!("Lambda panicked: {message}")
                    } else {
                        "Lambda panicked".to_string()
                    };
                    Err(Diagnostic::new(error_type, message))
                }
            }
        }
        Err(err) => {
            tracing::error!("handler not ready: {err:?}");
            Err(err.into())
        }
    }
}

fn type_name_of_val<T>(_: T) -> &'static str {
    type_name::<T>()
}

#[cfg(unix)]
fn spawn_stop_signal_listener(
    stop_signal: i32,
    handle: ShutdownHandle,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut stream = signal(SignalKind::from_raw(stop_signal))?;
    Ok(tokio::spawn(async move {
        if stream.recv().await.is_some() {
            tracing::info!(signal = stop_signal, "stop signal received, beginning shutdown");
            handle.shutdown();
        }
    }))
}

/// Start the runtime with an already-built handler, reading configuration
/// from the environment. In debug builds with
/// `LOCAL_LAMBDA_SERVER_ENABLED=true` the in-process control-plane mock is
/// started first.
pub async fn run<S, R, E>(handler: S) -> Result<(), Error>
where
    S: Service<LambdaInvocation, Response = R, Error = E>,
    R: Into<Bytes>,
    E: Into<Diagnostic> + fmt::Debug,
{
    run_with_factory(move |_| std::future::ready(Ok::<S, Diagnostic>(handler))).await
}

/// Start the runtime with a handler factory. The factory runs once, during
/// cold start; its failure is reported to the control plane and the process
/// exits non-zero.
pub async fn run_with_factory<F, Fut, S, R, E, IE>(factory: F) -> Result<(), Error>
where
    F: FnOnce(InitContext) -> Fut,
    Fut: Future<Output = Result<S, IE>>,
    IE: Into<Diagnostic>,
    S: Service<LambdaInvocation, Response = R, Error = E>,
    R: Into<Bytes>,
    E: Into<Diagnostic> + fmt::Debug,
{
    let config = Config::from_env()?;

    #[cfg(debug_assertions)]
    if config.local_server {
        let server = local_server::LocalServer::bind(&config).await?;
        tokio::spawn(server.serve());
    }

    Runtime::new(config).run_with_factory(factory).await
}
