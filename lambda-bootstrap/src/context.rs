use crate::terminator::Terminator;
use crate::Config;
use lambda_bootstrap_client::{InvocationMetadata, RequestId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The execution context for one invocation. Immutable; built from the
/// `/next` response headers and discarded when the result is reported.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// The AWS request ID generated by the Lambda service.
    pub request_id: RequestId,
    /// The execution deadline in milliseconds since the Unix epoch.
    pub deadline_ms: u64,
    /// The ARN of the Lambda function, version, or alias being invoked.
    pub invoked_function_arn: String,
    /// The X-Ray trace ID for the current invocation.
    pub xray_trace_id: String,
    /// Client context sent by the AWS Mobile SDK, verbatim JSON.
    pub client_context: Option<String>,
    /// Cognito identity information, verbatim JSON.
    pub cognito_identity: Option<String>,
}

impl Context {
    pub(crate) fn new(metadata: InvocationMetadata) -> Context {
        Context {
            request_id: metadata.request_id,
            deadline_ms: metadata.deadline_ms,
            invoked_function_arn: metadata.invoked_function_arn,
            xray_trace_id: metadata.trace_id,
            client_context: metadata.client_context,
            cognito_identity: metadata.cognito_identity,
        }
    }

    /// The deadline as wall-clock time.
    pub fn deadline(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.deadline_ms)
    }

    /// Milliseconds until the deadline. Negative once the deadline has
    /// passed.
    pub fn remaining_time_ms(&self) -> i64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.deadline_ms as i64 - now_ms
    }

    /// A span carrying the request and trace IDs; the runtime instruments
    /// handler execution with it so every log line correlates.
    pub fn request_span(&self) -> tracing::Span {
        tracing::info_span!(
            "lambda_invocation",
            requestId = %self.request_id,
            xrayTraceId = %self.xray_trace_id,
        )
    }
}

/// The cold-start context handed to the handler factory.
#[derive(Clone)]
pub struct InitContext {
    /// A view of the resolved runtime configuration.
    pub config: Config,
    /// The shutdown-hook registry; hooks registered here run in reverse
    /// order when the runtime exits.
    pub terminator: Terminator,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(deadline_ms: u64) -> InvocationMetadata {
        InvocationMetadata {
            request_id: RequestId::generate(),
            deadline_ms,
            invoked_function_arn: "arn:aws:lambda:us-east-1:1:function:f".to_owned(),
            trace_id: "Root=1-00000000-000000000000000000000000;Sampled=0".to_owned(),
            client_context: None,
            cognito_identity: None,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    #[test]
    fn remaining_time_counts_down_to_the_deadline() {
        let context = Context::new(metadata(now_ms() + 60_000));
        let remaining = context.remaining_time_ms();
        assert!(remaining > 55_000, "{remaining}");
        assert!(remaining <= 60_000, "{remaining}");
    }

    #[test]
    fn remaining_time_goes_negative_past_the_deadline() {
        let context = Context::new(metadata(now_ms().saturating_sub(5_000)));
        assert!(context.remaining_time_ms() < 0);
    }

    #[test]
    fn deadline_is_wall_clock_time() {
        let context = Context::new(metadata(1_542_409_706_888));
        assert_eq!(
            context.deadline(),
            UNIX_EPOCH + Duration::from_millis(1_542_409_706_888)
        );
    }
}
