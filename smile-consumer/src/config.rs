//! Configuration types for the smile-consumer crate
//!
//! [`ClientConfig`] is the validated, immutable description of one consumer: where to
//! connect, how to authenticate, which durable subscription to attach to, and how to
//! behave on reconnect and shutdown. It is built either programmatically through
//! [`ClientConfigBuilder`] or from the flat settings mapping used by the config file.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::handler::{HandlerRegistry, MessageHandler, DEFAULT_HANDLER};
use crate::transport::{ConnectOptions, Credentials, SubscriptionRequest};
use crate::types::{DeliverStart, MaxAttempts};

/// Flat key/value settings, as loaded from a JSON object.
pub type Settings = Map<String, Value>;

pub const KEY_URL: &str = "NATS_URL";
pub const KEY_USERNAME: &str = "NATS_USERNAME";
pub const KEY_PASSWORD: &str = "NATS_PASSWORD";
pub const KEY_CERTFILE: &str = "NATS_SSL_CERTFILE";
pub const KEY_KEYFILE: &str = "NATS_SSL_KEYFILE";
pub const KEY_ROOT_CA: &str = "NATS_ROOT_CA";
pub const KEY_FILTER_SUBJECT: &str = "NATS_FILTER_SUBJECT";
pub const KEY_DURABLE: &str = "NATS_DURABLE";
pub const KEY_TIMEOUT: &str = "CLIENT_TIMEOUT";
pub const KEY_CALLBACK: &str = "CALLBACK";
pub const KEY_MAX_RECONNECT_ATTEMPTS: &str = "max_reconnect_attempts";
pub const KEY_RECONNECT_DELAY: &str = "reconnect_delay";
pub const KEY_MAX_DELIVER: &str = "max_deliver";
pub const KEY_SHUTDOWN_TIMEOUT: &str = "shutdown_timeout";
pub const KEY_REDELIVERY_DELAY: &str = "redelivery_delay";

/// Reconnect behaviour of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up
    /// Default: 60
    pub max_attempts: MaxAttempts,

    /// Fixed wait between attempts
    /// Default: 2 seconds
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::Limited(60),
            delay: Duration::from_secs(2),
        }
    }
}

/// Validated configuration for one consumer.
#[derive(Clone)]
pub struct ClientConfig {
    url: String,
    credentials: Credentials,
    subject: String,
    filter_subject: String,
    durable: String,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    start_time: Option<DateTime<Utc>>,
    max_deliver: Option<u32>,
    redelivery_delay: Duration,
    shutdown_timeout: Duration,
    idle_wait: Duration,
    install_signal_handlers: bool,
    handler: Arc<dyn MessageHandler>,
}

impl ClientConfig {
    /// Start building a configuration from its required parts.
    pub fn builder(
        url: impl Into<String>,
        filter_subject: impl Into<String>,
        durable: impl Into<String>,
        connect_timeout: Duration,
        handler: Arc<dyn MessageHandler>,
    ) -> ClientConfigBuilder {
        ClientConfigBuilder {
            url: url.into(),
            credentials: Credentials::None,
            subject: None,
            filter_subject: filter_subject.into(),
            durable: durable.into(),
            connect_timeout,
            reconnect: ReconnectPolicy::default(),
            start_time: None,
            max_deliver: None,
            redelivery_delay: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
            idle_wait: Duration::from_secs(5),
            install_signal_handlers: true,
            handler,
        }
    }

    /// Validate a flat settings mapping into a configuration.
    pub fn from_settings(
        settings: &Settings,
        handlers: &HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        ClientConfigBuilder::from_settings(settings, handlers)?.build()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Subject used to locate the stream.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn filter_subject(&self) -> &str {
        &self.filter_subject
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        self.reconnect
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn max_deliver(&self) -> Option<u32> {
        self.max_deliver
    }

    /// How long the server waits before redelivering a rejected message.
    pub fn redelivery_delay(&self) -> Duration {
        self.redelivery_delay
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn idle_wait(&self) -> Duration {
        self.idle_wait
    }

    pub fn install_signal_handlers(&self) -> bool {
        self.install_signal_handlers
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::clone(&self.handler)
    }

    /// Transport options for a connection attempt.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            url: self.url.clone(),
            credentials: self.credentials.clone(),
            connect_timeout: self.connect_timeout,
            client_name: format!("smile-client:{}", self.durable),
        }
    }

    /// Subscription parameters, anchored at `deliver_start`.
    pub fn subscription_request(&self, deliver_start: DeliverStart) -> SubscriptionRequest {
        SubscriptionRequest {
            subject: self.subject.clone(),
            filter_subject: self.filter_subject.clone(),
            durable: self.durable.clone(),
            deliver_start,
            max_deliver: self.max_deliver,
            redelivery_delay: self.redelivery_delay,
            idle_wait: self.idle_wait,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credentials = match &self.credentials {
            Credentials::None => "none",
            Credentials::UserPassword { .. } => "user/password",
            Credentials::Tls { .. } => "tls",
        };
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("credentials", &credentials)
            .field("subject", &self.subject)
            .field("filter_subject", &self.filter_subject)
            .field("durable", &self.durable)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect", &self.reconnect)
            .field("start_time", &self.start_time)
            .field("max_deliver", &self.max_deliver)
            .field("redelivery_delay", &self.redelivery_delay)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ClientConfig`]. All validation happens in [`build`](Self::build).
#[derive(Clone)]
pub struct ClientConfigBuilder {
    url: String,
    credentials: Credentials,
    subject: Option<String>,
    filter_subject: String,
    durable: String,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    start_time: Option<DateTime<Utc>>,
    max_deliver: Option<u32>,
    redelivery_delay: Duration,
    shutdown_timeout: Duration,
    idle_wait: Duration,
    install_signal_handlers: bool,
    handler: Arc<dyn MessageHandler>,
}

impl ClientConfigBuilder {
    /// Read the settings mapping. Required keys and credential groups are checked here;
    /// field-level invariants are checked again by [`build`](Self::build).
    pub fn from_settings(
        settings: &Settings,
        handlers: &HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        let url = required_string(settings, KEY_URL)?;
        let filter_subject = required_string(settings, KEY_FILTER_SUBJECT)?;
        let durable = required_string(settings, KEY_DURABLE)?;
        let connect_timeout = seconds(settings, KEY_TIMEOUT)?
            .ok_or_else(|| ConfigError::MissingKey(KEY_TIMEOUT.to_string()))?;

        let handler_name =
            optional_string(settings, KEY_CALLBACK)?.unwrap_or_else(|| DEFAULT_HANDLER.to_string());
        let handler = handlers
            .get(&handler_name)
            .ok_or(ConfigError::UnknownHandler(handler_name))?;

        let credentials = credentials_from_settings(settings)?;

        let mut reconnect = ReconnectPolicy::default();
        if let Some(raw) = integer(settings, KEY_MAX_RECONNECT_ATTEMPTS)? {
            reconnect.max_attempts =
                MaxAttempts::from_setting(raw).ok_or_else(|| ConfigError::InvalidValue {
                    key: KEY_MAX_RECONNECT_ATTEMPTS.to_string(),
                    reason: format!("expected -1 (unlimited) or a positive integer, got {raw}"),
                })?;
        }
        if let Some(delay) = seconds(settings, KEY_RECONNECT_DELAY)? {
            reconnect.delay = delay;
        }

        let max_deliver = match integer(settings, KEY_MAX_DELIVER)? {
            None | Some(-1) => None,
            Some(n) if n > 0 => Some(u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
                key: KEY_MAX_DELIVER.to_string(),
                reason: format!("{n} is out of range"),
            })?),
            Some(n) => {
                return Err(ConfigError::InvalidValue {
                    key: KEY_MAX_DELIVER.to_string(),
                    reason: format!("expected -1 (unlimited) or a positive integer, got {n}"),
                })
            }
        };

        let mut builder = ClientConfig::builder(url, filter_subject, durable, connect_timeout, handler)
            .with_credentials(credentials)
            .with_reconnect_policy(reconnect);
        builder.max_deliver = max_deliver;
        if let Some(timeout) = seconds(settings, KEY_SHUTDOWN_TIMEOUT)? {
            builder.shutdown_timeout = timeout;
        }
        if let Some(delay) = seconds(settings, KEY_REDELIVERY_DELAY)? {
            builder.redelivery_delay = delay;
        }

        Ok(builder)
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Subject used to locate the stream. Defaults to the filter subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max_attempts: MaxAttempts) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    /// Replay from the first message published at or after `start_time`.
    pub fn with_start_time(mut self, start_time: Option<DateTime<Utc>>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: Option<u32>) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Delay the server applies before redelivering a negatively acknowledged message.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Upper bound on waiting for the dispatch loop to drain during shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// How long one pull waits for a message before the loop re-checks for shutdown.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Whether `run()` listens for SIGINT/SIGTERM. Disable when embedding.
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.install_signal_handlers = enabled;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingKey(KEY_URL.to_string()));
        }
        validate_subject(KEY_FILTER_SUBJECT, &self.filter_subject)?;
        validate_durable(&self.durable)?;

        let subject = self.subject.unwrap_or_else(|| self.filter_subject.clone());
        validate_subject("subject", &subject)?;

        validate_positive(KEY_TIMEOUT, self.connect_timeout)?;
        validate_positive(KEY_SHUTDOWN_TIMEOUT, self.shutdown_timeout)?;
        validate_positive("idle_wait", self.idle_wait)?;
        validate_positive(KEY_REDELIVERY_DELAY, self.redelivery_delay)?;
        if let MaxAttempts::Limited(0) = self.reconnect.max_attempts {
            return Err(ConfigError::InvalidValue {
                key: KEY_MAX_RECONNECT_ATTEMPTS.to_string(),
                reason: "must be -1 (unlimited) or a positive integer".to_string(),
            });
        }
        if let Some(0) = self.max_deliver {
            return Err(ConfigError::InvalidValue {
                key: KEY_MAX_DELIVER.to_string(),
                reason: "must be -1 (unlimited) or a positive integer".to_string(),
            });
        }

        match &self.credentials {
            Credentials::None => {}
            Credentials::UserPassword { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(ConfigError::IncompleteCredentials(format!(
                        "{KEY_USERNAME} and {KEY_PASSWORD} must both be non-empty"
                    )));
                }
            }
            Credentials::Tls {
                cert_file,
                key_file,
                ..
            } => {
                if cert_file.as_os_str().is_empty() || key_file.as_os_str().is_empty() {
                    return Err(ConfigError::IncompleteCredentials(format!(
                        "{KEY_CERTFILE} and {KEY_KEYFILE} must both be non-empty"
                    )));
                }
            }
        }

        Ok(ClientConfig {
            url: self.url,
            credentials: self.credentials,
            subject,
            filter_subject: self.filter_subject,
            durable: self.durable,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect,
            start_time: self.start_time,
            max_deliver: self.max_deliver,
            redelivery_delay: self.redelivery_delay,
            shutdown_timeout: self.shutdown_timeout,
            idle_wait: self.idle_wait,
            install_signal_handlers: self.install_signal_handlers,
            handler: self.handler,
        })
    }
}

/// Parse a `YYYY-MM-DD` start date as midnight UTC.
pub fn parse_start_date(date: &str) -> Result<DateTime<Utc>, ConfigError> {
    let invalid = || ConfigError::InvalidStartDate(date.to_string());
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
    let midnight = day.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn credentials_from_settings(settings: &Settings) -> Result<Credentials, ConfigError> {
    let username = optional_string(settings, KEY_USERNAME)?;
    let password = optional_string(settings, KEY_PASSWORD)?;
    let cert_file = optional_string(settings, KEY_CERTFILE)?;
    let key_file = optional_string(settings, KEY_KEYFILE)?;
    let root_ca = optional_string(settings, KEY_ROOT_CA)?;

    let has_user = username.is_some() || password.is_some();
    let has_tls = cert_file.is_some() || key_file.is_some() || root_ca.is_some();

    if has_user && has_tls {
        return Err(ConfigError::ConflictingCredentials(format!(
            "{KEY_USERNAME}/{KEY_PASSWORD} cannot be combined with TLS client certificates"
        )));
    }

    if has_user {
        return match (username, password) {
            (Some(username), Some(password)) => Ok(Credentials::UserPassword { username, password }),
            _ => Err(ConfigError::IncompleteCredentials(format!(
                "{KEY_USERNAME} and {KEY_PASSWORD} must be supplied together"
            ))),
        };
    }

    if has_tls {
        return match (cert_file, key_file) {
            (Some(cert_file), Some(key_file)) => Ok(Credentials::Tls {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
                root_ca: root_ca.map(PathBuf::from),
            }),
            _ => Err(ConfigError::IncompleteCredentials(format!(
                "{KEY_CERTFILE} and {KEY_KEYFILE} must be supplied together"
            ))),
        };
    }

    Ok(Credentials::None)
}

fn optional_string(settings: &Settings, key: &str) -> Result<Option<String>, ConfigError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn required_string(settings: &Settings, key: &str) -> Result<String, ConfigError> {
    optional_string(settings, key)?.ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn seconds(settings: &Settings, key: &str) -> Result<Option<Duration>, ConfigError> {
    let raw = match settings.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match raw {
        Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).map(Some).map_err(|e| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("value is out of range for a duration: {e}"),
            }
        }),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "expected a positive number of seconds".to_string(),
        }),
    }
}

fn integer(settings: &Settings, key: &str) -> Result<Option<i64>, ConfigError> {
    let raw = match settings.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };

    raw.map(Some).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: "expected an integer".to_string(),
    })
}

fn validate_subject(key: &str, subject: &str) -> Result<(), ConfigError> {
    if subject.is_empty() {
        return Err(ConfigError::MissingKey(key.to_string()));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("subject '{subject}' contains whitespace"),
        });
    }
    if subject.split('.').any(str::is_empty) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("subject '{subject}' has an empty token"),
        });
    }
    Ok(())
}

fn validate_durable(durable: &str) -> Result<(), ConfigError> {
    if durable.is_empty() {
        return Err(ConfigError::MissingKey(KEY_DURABLE.to_string()));
    }
    if durable
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        return Err(ConfigError::InvalidValue {
            key: KEY_DURABLE.to_string(),
            reason: format!("durable name '{durable}' may not contain whitespace, '.', '*' or '>'"),
        });
    }
    Ok(())
}

fn validate_positive(key: &str, duration: Duration) -> Result<(), ConfigError> {
    if duration.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}
