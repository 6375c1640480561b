//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full control plane: manager, API, scheduler, callbacks.
    Server,
    /// Standalone executor service, driven over HTTP by a manager.
    Executor,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_address: String,
    /// Process role.
    pub mode: Mode,
    /// Store URI: `memory:-`, `sled:<path>` or `s3://...`.
    pub store_uri: String,
    /// When set, the manager delegates runs to this executor service.
    pub executor_url: Option<String>,
    /// Deadline for definitions without a timeout.
    pub default_timeout: Duration,
    /// Grace added to the wire deadline when delegating runs.
    pub retry_grace: Duration,
    pub browser: BrowserConfig,
    pub webhook: WebhookConfig,
    pub emitters: EmitterConfig,
}

/// Browser driver and worker supervision settings.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Remote debugging endpoint.
    pub server_url: String,
    /// Pin the endpoint IP per run (for DNS load-balanced endpoints).
    pub dns_discovery: bool,
    /// When set, a local browser worker is launched and supervised.
    pub binary_path: Option<String>,
    /// Arguments for the supervised worker.
    pub binary_args: Vec<String>,
    /// How often the supervised worker is recycled.
    pub recycle_interval: Duration,
}

/// Webhook callback endpoint settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Base URL advertised to systems under test.
    pub advertise_url: String,
    /// Route prefix for the per-invocation endpoints.
    pub path_prefix: String,
}

/// Emitter wiring.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Emit every result to stdout as JSON.
    pub stdout: bool,
    /// Pretty-print stdout results.
    pub stdout_pretty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            mode: Mode::Server,
            store_uri: "memory:-".to_string(),
            executor_url: None,
            default_timeout: Duration::from_secs(300),
            retry_grace: Duration::from_secs(20),
            browser: BrowserConfig {
                server_url: "http://127.0.0.1:9222".to_string(),
                dns_discovery: true,
                binary_path: None,
                binary_args: Vec::new(),
                recycle_interval: Duration::from_secs(3600),
            },
            webhook: WebhookConfig {
                advertise_url: "http://0.0.0.0:8080".to_string(),
                path_prefix: "/v1/callback".to_string(),
            },
            emitters: EmitterConfig {
                stdout: true,
                stdout_pretty: false,
            },
        }
    }
}

impl Config {
    /// Build the configuration from `VIGIL_*` environment variables, falling
    /// back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let mode = match env_string("VIGIL_MODE") {
            None => defaults.mode,
            Some(value) => match value.as_str() {
                "server" => Mode::Server,
                "executor" => Mode::Executor,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "VIGIL_MODE".to_string(),
                        message: format!("expected server or executor, got {other}"),
                    });
                }
            },
        };

        Ok(Self {
            listen_address: env_string("VIGIL_LISTEN_ADDRESS")
                .unwrap_or(defaults.listen_address),
            mode,
            store_uri: env_string("VIGIL_STORE_URI").unwrap_or(defaults.store_uri),
            executor_url: env_string("VIGIL_EXECUTOR_URL"),
            default_timeout: env_duration("VIGIL_DEFAULT_TIMEOUT", defaults.default_timeout)?,
            retry_grace: env_duration("VIGIL_RETRY_GRACE", defaults.retry_grace)?,
            browser: BrowserConfig {
                server_url: env_string("VIGIL_BROWSER_URL")
                    .unwrap_or(defaults.browser.server_url),
                dns_discovery: env_bool("VIGIL_BROWSER_DNS_DISCOVERY", true),
                binary_path: env_string("VIGIL_BROWSER_BINARY"),
                binary_args: env_string("VIGIL_BROWSER_ARGS")
                    .map(|args| args.split_whitespace().map(String::from).collect())
                    .unwrap_or_default(),
                recycle_interval: env_duration(
                    "VIGIL_BROWSER_RECYCLE_INTERVAL",
                    defaults.browser.recycle_interval,
                )?,
            },
            webhook: WebhookConfig {
                advertise_url: env_string("VIGIL_ADVERTISE_URL")
                    .unwrap_or(defaults.webhook.advertise_url),
                path_prefix: env_string("VIGIL_CALLBACK_PREFIX")
                    .unwrap_or(defaults.webhook.path_prefix),
            },
            emitters: EmitterConfig {
                stdout: env_bool("VIGIL_EMIT_STDOUT", defaults.emitters.stdout),
                stdout_pretty: env_bool("VIGIL_EMIT_STDOUT_PRETTY", false),
            },
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match env_string(key) {
        None => Ok(default),
        Some(value) => {
            humantime::parse_duration(&value).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        }
    }
}
