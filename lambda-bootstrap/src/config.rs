use std::env;
use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// The environment variable carrying the Runtime API endpoint. Read once
/// at startup.
pub const RUNTIME_ENDPOINT_VAR: &str = "AWS_LAMBDA_RUNTIME_API";

const DEFAULT_ENDPOINT: &str = "127.0.0.1:7000";
const SIGTERM: i32 = 15;

/// Output shape of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event, for structured log sinks.
    Json,
}

/// Runtime configuration, resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// The control-plane endpoint (`AWS_LAMBDA_RUNTIME_API`).
    pub api_endpoint: SocketAddr,
    /// Default log level (`LOG_LEVEL`).
    pub log_level: String,
    /// Log output shape (`LOG_FORMAT`).
    pub log_format: LogFormat,
    /// Signal number that triggers orderly shutdown (`STOP_SIGNAL`).
    pub stop_signal: i32,
    /// Exit after this many invocations; 0 means unbounded (`MAX_REQUESTS`).
    pub max_invocations: u32,
    /// Per-request timer in milliseconds (`REQUEST_TIMEOUT`).
    pub request_timeout: Option<Duration>,
    /// Hold the control-plane channel open between requests.
    pub keep_alive: bool,
    /// Write `[report, next]` back-to-back after a success
    /// (`PIPELINE_REPORTS`).
    pub pipelining: bool,
    /// Start the in-process control-plane mock in debug builds
    /// (`LOCAL_LAMBDA_SERVER_ENABLED`).
    pub local_server: bool,
    /// Path the local server accepts test invocations on
    /// (`LOCAL_LAMBDA_INVOKE_ENDPOINT`).
    pub invoke_endpoint: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            api_endpoint: DEFAULT_ENDPOINT.parse().expect("default endpoint"),
            log_level: "info".to_owned(),
            log_format: LogFormat::Text,
            stop_signal: SIGTERM,
            max_invocations: 0,
            request_timeout: None,
            keep_alive: true,
            pipelining: false,
            local_server: false,
            invoke_endpoint: "/invoke".to_owned(),
        }
    }
}

impl Config {
    /// Read the configuration from environment variables. Malformed values
    /// fail initialization instead of being silently defaulted.
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let api_endpoint = match lookup(RUNTIME_ENDPOINT_VAR) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::invalid(RUNTIME_ENDPOINT_VAR, &value))?,
            None => defaults.api_endpoint,
        };
        let stop_signal = parse_var(&lookup, "STOP_SIGNAL")?.unwrap_or(defaults.stop_signal);
        let max_invocations =
            parse_var(&lookup, "MAX_REQUESTS")?.unwrap_or(defaults.max_invocations);
        let request_timeout =
            parse_var(&lookup, "REQUEST_TIMEOUT")?.map(Duration::from_millis);
        let log_format = match lookup("LOG_FORMAT") {
            None => defaults.log_format,
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(value) if value.eq_ignore_ascii_case("text") => LogFormat::Text,
            Some(value) => return Err(ConfigError::invalid("LOG_FORMAT", &value)),
        };
        Ok(Config {
            api_endpoint,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            stop_signal,
            max_invocations,
            request_timeout,
            keep_alive: true,
            pipelining: parse_bool(&lookup, "PIPELINE_REPORTS")?.unwrap_or(defaults.pipelining),
            local_server: parse_bool(&lookup, "LOCAL_LAMBDA_SERVER_ENABLED")?
                .unwrap_or(defaults.local_server),
            invoke_endpoint: lookup("LOCAL_LAMBDA_INVOKE_ENDPOINT")
                .unwrap_or(defaults.invoke_endpoint),
        })
    }
}

fn parse_var<T, L>(lookup: &L, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    L: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(var, &value)),
        None => Ok(None),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(var) {
        Some(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "True" => Ok(Some(true)),
            "0" | "false" | "FALSE" | "False" => Ok(Some(false)),
            _ => Err(ConfigError::invalid(var, &value)),
        },
        None => Ok(None),
    }
}

/// A malformed configuration value.
#[derive(Debug)]
pub struct ConfigError {
    var: &'static str,
    value: String,
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str) -> ConfigError {
        ConfigError {
            var,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value {:?} for {}", self.value, self.var)
    }
}

impl StdError for ConfigError {}
