use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Broker connection and call settings taken from the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Per-call reply timeout in seconds.
    pub timeout_secs: u64,
    pub exchange: String,
    pub routing_key: String,
    pub log_level: String,
    pub pool_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_credential() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, val)),
        None => Ok(default),
    }
}

impl BrokerConfig {
    /// Load from the environment, reading a `.env` file first if one exists.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`load`](Self::load), with `fallbacks` used for variables that are unset.
    pub fn load_or(fallbacks: &[(&str, &str)]) -> Result<Self> {
        dotenv().ok();
        Self::from_lookup_or(|key| env::var(key).ok(), fallbacks)
    }

    pub fn from_lookup_or(
        lookup: impl Fn(&str) -> Option<String>,
        fallbacks: &[(&str, &str)],
    ) -> Result<Self> {
        Self::from_lookup(|key| {
            lookup(key).or_else(|| {
                fallbacks
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, val)| val.to_string())
            })
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|val| !val.trim().is_empty())
                .ok_or_else(|| anyhow!("{} must be set", key))
        };

        Ok(BrokerConfig {
            host: lookup("AMQP_HOST").unwrap_or_else(default_host),
            port: parse_or(&lookup, "AMQP_PORT", default_port())?,
            user: lookup("AMQP_USER").unwrap_or_else(default_credential),
            password: lookup("AMQP_PASS").unwrap_or_else(default_credential),
            vhost: lookup("AMQP_VHOST").unwrap_or_else(default_vhost),
            timeout_secs: parse_or(&lookup, "AMQP_TIMEOUT", default_timeout_secs())?,
            exchange: required("AMQP_EXCHANGE")?,
            routing_key: required("ROUTING_KEY")?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(default_log_level),
            pool_size: parse_or(&lookup, "AMQP_POOL_SIZE", default_pool_size())?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connection URI. Built field by field, so the vhost needs no escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }
}
