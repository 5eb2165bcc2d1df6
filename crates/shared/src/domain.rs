use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ClientId);
id_newtype!(ChannelId);

impl ChannelId {
    /// Every server has a root channel with id 0; new users land there.
    pub const ROOT: ChannelId = ChannelId(0);
}

pub const DEFAULT_PORT: u16 = 64738;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_text: Option<String>,
}

impl SessionStatus {
    pub fn connecting() -> Self {
        Self {
            state: SessionState::Connecting,
            channel_id: None,
            last_error: None,
            welcome_text: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Accept any server certificate. Test servers are almost always self-signed.
    #[default]
    Skip,
    Strict,
}

impl FromStr for TlsPolicy {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "skip" | "insecure" => Ok(Self::Skip),
            "strict" | "verify" => Ok(Self::Strict),
            other => Err(ConfigError::InvalidTlsPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("skip"),
            Self::Strict => f.write_str("strict"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Accepts `host`, `host:port` and `mumble://host:port`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidAddress {
                address: raw.to_string(),
                reason: "address is empty".to_string(),
            });
        }

        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("mumble://{raw}")
        };
        let url = Url::parse(&candidate).map_err(|err| ConfigError::InvalidAddress {
            address: raw.to_string(),
            reason: err.to_string(),
        })?;

        if url.scheme() != "mumble" {
            return Err(ConfigError::InvalidAddress {
                address: raw.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidAddress {
                address: raw.to_string(),
                reason: "missing host".to_string(),
            })?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_without_scheme() {
        let address = ServerAddress::parse("localhost:64739").expect("address");
        assert_eq!(address.host, "localhost");
        assert_eq!(address.port, 64739);
    }

    #[test]
    fn defaults_to_mumble_port() {
        let address = ServerAddress::parse("mumble://voice.example.org").expect("address");
        assert_eq!(address.to_string(), "voice.example.org:64738");
    }

    #[test]
    fn rejects_foreign_scheme_and_empty_address() {
        assert!(ServerAddress::parse("https://example.org").is_err());
        assert!(ServerAddress::parse("   ").is_err());
    }

    #[test]
    fn tls_policy_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<TlsPolicy>().expect("strict"), TlsPolicy::Strict);
        assert_eq!("skip".parse::<TlsPolicy>().expect("skip"), TlsPolicy::Skip);
        assert!("maybe".parse::<TlsPolicy>().is_err());
    }
}
