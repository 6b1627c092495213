//! Configuration types.
//!
//! A single `RelayConfig` is built once at startup and handed by reference to
//! each component. Nothing reads the environment after that.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;
use crate::pipeline::delivery::RetryPolicy;

/// Default mailbox check interval: 5 minutes.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// IMAP mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub folder: String,
    pub username: String,
    pub password: SecretString,
    /// Applied to TCP connect, reads and writes.
    pub timeout: Duration,
}

/// SMTP submission settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub timeout: Duration,
}

/// What to do with a message that was not forwarded for routing reasons
/// (no `keyword - destination` subject, no active rule, or no resolvable recipient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmatchedPolicy {
    /// Mark it consumed so it is never reconsidered.
    #[default]
    MarkRead,
    /// Leave it unread so a later rule change can pick it up.
    LeaveUnread,
}

impl std::str::FromStr for UnmatchedPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mark-read" | "mark_read" => Ok(Self::MarkRead),
            "leave-unread" | "leave_unread" => Ok(Self::LeaveUnread),
            other => Err(ConfigError::InvalidValue {
                key: "RELAY_UNMATCHED".into(),
                message: format!("expected mark-read or leave-unread, got {other:?}"),
            }),
        }
    }
}

/// Limits on creating recipients for previously unknown destinations.
#[derive(Debug, Clone)]
pub struct ProvisionPolicy {
    /// `*`, `@domain`, `domain` or exact addresses. Empty denies all.
    pub allowed_destinations: Vec<String>,
    /// New recipients allowed per run. Zero disables auto-provisioning.
    pub max_new_per_run: usize,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            allowed_destinations: vec!["*".to_string()],
            max_new_per_run: 50,
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mailbox: MailboxConfig,
    pub smtp: SmtpConfig,
    /// Interval between scheduled runs.
    pub check_interval: Duration,
    pub retry: RetryPolicy,
    pub unmatched: UnmatchedPolicy,
    pub provisioning: ProvisionPolicy,
    pub db_path: PathBuf,
    pub http_port: u16,
    /// How long scheduler stop waits for an in-flight run.
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

        let username = required("GMAIL_USER")?;
        let password = SecretString::from(required("GMAIL_APP_PASSWORD")?);

        let timeout = Duration::from_secs(parse_or(&get, "RELAY_OPERATION_TIMEOUT_SECS", 30)?);

        let mailbox = MailboxConfig {
            host: get("RELAY_IMAP_HOST").unwrap_or_else(|| "imap.gmail.com".into()),
            port: parse_or(&get, "RELAY_IMAP_PORT", 993)?,
            folder: get("RELAY_IMAP_FOLDER").unwrap_or_else(|| "INBOX".into()),
            username: username.clone(),
            password: password.clone(),
            timeout,
        };

        let smtp = SmtpConfig {
            host: get("RELAY_SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".into()),
            port: parse_or(&get, "RELAY_SMTP_PORT", 587)?,
            from_address: get("RELAY_FROM_ADDRESS").unwrap_or_else(|| username.clone()),
            username,
            password,
            timeout,
        };

        let check_interval = match get("CHECK_INTERVAL") {
            None => DEFAULT_CHECK_INTERVAL,
            Some(raw) => match parse_interval(&raw) {
                Some(d) if !d.is_zero() => d,
                _ => {
                    warn!(value = %raw, "Invalid CHECK_INTERVAL, using default of 5m");
                    DEFAULT_CHECK_INTERVAL
                }
            },
        };

        let unmatched = match get("RELAY_UNMATCHED") {
            Some(raw) => raw.parse()?,
            None => UnmatchedPolicy::default(),
        };

        let provisioning = ProvisionPolicy {
            allowed_destinations: get("RELAY_ALLOWED_DESTINATIONS")
                .map(|raw| split_list(&raw))
                .unwrap_or_else(|| vec!["*".to_string()]),
            max_new_per_run: parse_or(&get, "RELAY_MAX_NEW_RECIPIENTS_PER_RUN", 50)?,
        };

        Ok(Self {
            mailbox,
            smtp,
            check_interval,
            retry: RetryPolicy::default(),
            unmatched,
            provisioning,
            db_path: get("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mail-relay.db")),
            http_port: parse_or(&get, "APP_PORT", 8080)?,
            shutdown_grace: Duration::from_secs(parse_or(&get, "RELAY_SHUTDOWN_GRACE_SECS", 30)?),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: e.to_string(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a Go-style duration such as `30s`, `5m`, `1h30m` or `1.5h`.
///
/// Supported units: `ms`, `s`, `m`, `h`. Returns `None` on any malformed input.
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total += value * seconds_per_unit;
    }

    if !total.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}
