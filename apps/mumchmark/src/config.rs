use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use fleet_core::{BackoffPolicy, RetryPolicy, SpawnRequest, DEFAULT_USERNAME_PREFIX};
use serde::Deserialize;
use shared::{
    domain::{ServerAddress, TlsPolicy},
    error::ConfigError,
};
use tokio::sync::Semaphore;
use voice_integration::LoopbackOptions;

pub const DEFAULT_CONFIG_FILE: &str = "mumchmark.toml";
const ENV_PREFIX: &str = "MUMCHMARK_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub address: String,
    pub tls: TlsPolicy,
    pub username_prefix: String,
    pub password: Option<String>,
    pub clients: usize,
    pub max_concurrent_connects: usize,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_jitter: f64,
    pub shutdown_deadline_ms: u64,
    pub audio_source: PathBuf,
    pub text_body: String,
    pub frame_duration_ms: u64,
    pub loopback_latency_ms: u64,
    pub loopback_welcome: Option<String>,
    pub loopback_trusted_certificate: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: "localhost:64738".into(),
            tls: TlsPolicy::Skip,
            username_prefix: DEFAULT_USERNAME_PREFIX.into(),
            password: None,
            clients: 10,
            max_concurrent_connects: 8,
            connect_timeout_ms: 5_000,
            command_timeout_ms: 2_000,
            max_retries: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            backoff_jitter: 0.2,
            shutdown_deadline_ms: 3_000,
            audio_source: PathBuf::from("audio.wav"),
            text_body: "testing".into(),
            frame_duration_ms: 10,
            loopback_latency_ms: 0,
            loopback_welcome: None,
            loopback_trusted_certificate: false,
        }
    }
}

/// Defaults, then the TOML file, then `MUMCHMARK_*` variables. An explicit
/// `path` must exist; the default file is optional.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = match path {
        Some(path) => read_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => Settings::default(),
    };
    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn read_file(path: &Path) -> anyhow::Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

pub(crate) fn apply_env(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("ADDRESS") {
        settings.address = v;
    }
    if let Some(v) = var("TLS") {
        settings.tls = v.parse()?;
    }
    if let Some(v) = var("USERNAME_PREFIX") {
        settings.username_prefix = v;
    }
    if let Some(v) = var("PASSWORD") {
        settings.password = Some(v).filter(|password| !password.is_empty());
    }
    if let Some(v) = var("CLIENTS") {
        settings.clients = parse_value("clients", &v)?;
    }
    if let Some(v) = var("MAX_CONCURRENT_CONNECTS") {
        settings.max_concurrent_connects = parse_value("max_concurrent_connects", &v)?;
    }
    if let Some(v) = var("CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = parse_value("connect_timeout_ms", &v)?;
    }
    if let Some(v) = var("COMMAND_TIMEOUT_MS") {
        settings.command_timeout_ms = parse_value("command_timeout_ms", &v)?;
    }
    if let Some(v) = var("MAX_RETRIES") {
        settings.max_retries = parse_value("max_retries", &v)?;
    }
    if let Some(v) = var("INITIAL_BACKOFF_MS") {
        settings.initial_backoff_ms = parse_value("initial_backoff_ms", &v)?;
    }
    if let Some(v) = var("MAX_BACKOFF_MS") {
        settings.max_backoff_ms = parse_value("max_backoff_ms", &v)?;
    }
    if let Some(v) = var("BACKOFF_JITTER") {
        settings.backoff_jitter = parse_value("backoff_jitter", &v)?;
    }
    if let Some(v) = var("SHUTDOWN_DEADLINE_MS") {
        settings.shutdown_deadline_ms = parse_value("shutdown_deadline_ms", &v)?;
    }
    if let Some(v) = var("AUDIO_SOURCE") {
        settings.audio_source = PathBuf::from(v);
    }
    if let Some(v) = var("FRAME_DURATION_MS") {
        settings.frame_duration_ms = parse_value("frame_duration_ms", &v)?;
    }
    if let Some(v) = var("LOOPBACK_LATENCY_MS") {
        settings.loopback_latency_ms = parse_value("loopback_latency_ms", &v)?;
    }
    if let Some(v) = var("LOOPBACK_TRUSTED_CERTIFICATE") {
        settings.loopback_trusted_certificate = parse_value("loopback_trusted_certificate", &v)?;
    }
    Ok(())
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidValue {
            key,
            reason: format!("'{raw}': {err}"),
        })
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_address()?;

        let positive = [
            ("max_concurrent_connects", self.max_concurrent_connects as u64),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("frame_duration_ms", self.frame_duration_ms),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidValue {
                key: *key,
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_connects > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_connects",
                reason: format!("must be at most {}", Semaphore::MAX_PERMITS),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                key: "initial_backoff_ms",
                reason: format!("exceeds max_backoff_ms ({})", self.max_backoff_ms),
            });
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "backoff_jitter",
                reason: format!("{} is outside 0.0..=1.0", self.backoff_jitter),
            });
        }
        if self.username_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "username_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn server_address(&self) -> Result<ServerAddress, ConfigError> {
        ServerAddress::parse(&self.address)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(self.initial_backoff_ms),
                max: Duration::from_millis(self.max_backoff_ms),
                jitter: self.backoff_jitter,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn spawn_request(&self, count: usize, address: ServerAddress) -> SpawnRequest {
        SpawnRequest {
            count,
            address,
            tls: self.tls,
            username_prefix: self.username_prefix.clone(),
            password: self.password.clone(),
            max_concurrent_connects: self.max_concurrent_connects,
            retry: self.retry_policy(),
        }
    }

    /// Unless `loopback_trusted_certificate` is set, `strict` runs against the
    /// in-process server fail with a TLS error the way they would against a
    /// self-signed server.
    pub fn loopback_options(&self) -> LoopbackOptions {
        let defaults = LoopbackOptions::default();
        LoopbackOptions {
            welcome_text: self
                .loopback_welcome
                .clone()
                .unwrap_or(defaults.welcome_text),
            latency: Duration::from_millis(self.loopback_latency_ms),
            password: self.password.clone(),
            trusted_certificate: self.loopback_trusted_certificate,
            ..defaults
        }
    }
}

/// Startup check that the configured host resolves at all.
pub async fn resolve_address(address: &ServerAddress) -> Result<(), ConfigError> {
    let unresolved = |reason: String| ConfigError::UnresolvedHost {
        address: address.to_string(),
        reason,
    };
    let mut resolved = tokio::net::lookup_host((address.host.as_str(), address.port))
        .await
        .map_err(|err| unresolved(err.to_string()))?;
    match resolved.next() {
        Some(_) => Ok(()),
        None => Err(unresolved("no addresses returned".to_string())),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
