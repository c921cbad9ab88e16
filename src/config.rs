// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::env::BrokerConfig;
use crate::rabbitmq::{DeadLetterPredicate, ExchangeSpec, ExchangeType, ProcessorKind};

/// Everything one RPC client needs to know about the service it calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Name of the service being called, used in errors and logs.
    pub service: String,
    pub exchange: ExchangeSpec,
    pub send_routing_key: String,
    /// Reply queue name, also sent as `reply_to`.
    pub response_routing_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub processor: ProcessorKind,
    /// Header whose presence marks a dead-lettered reply. `null` disables detection.
    #[serde(default = "default_dead_letter_header")]
    pub dead_letter_header: Option<String>,
}

/// Contents of a `rabbit_rpc.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsConfig {
    pub clients: Vec<ClientSettings>,
}

// Default values
fn default_timeout_secs() -> u64 {
    10
}
fn default_dead_letter_header() -> Option<String> {
    Some("x-death".to_string())
}

impl ClientSettings {
    /// Settings for `service` drawn from the environment configuration.
    pub fn from_env(
        config: &BrokerConfig,
        service: impl Into<String>,
        response_routing_key: impl Into<String>,
    ) -> Self {
        ClientSettings {
            service: service.into(),
            exchange: ExchangeSpec {
                name: config.exchange.clone(),
                kind: ExchangeType::Topic,
            },
            send_routing_key: config.routing_key.clone(),
            response_routing_key: response_routing_key.into(),
            timeout_secs: config.timeout_secs,
            processor: ProcessorKind::default(),
            dead_letter_header: default_dead_letter_header(),
        }
    }

    pub fn with_processor(mut self, processor: ProcessorKind) -> Self {
        self.processor = processor;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn dead_letter_predicate(&self) -> DeadLetterPredicate {
        match &self.dead_letter_header {
            Some(header) => DeadLetterPredicate::header_present(header.clone()),
            None => DeadLetterPredicate::never(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.service.is_empty() {
            return Err(anyhow!("Configuration error: service cannot be empty"));
        }
        if self.response_routing_key.is_empty() {
            return Err(anyhow!(
                "Configuration error: response_routing_key for {} cannot be empty",
                self.service
            ));
        }
        Ok(())
    }
}

impl ClientsConfig {
    pub fn client(&self, service: &str) -> Option<&ClientSettings> {
        self.clients.iter().find(|c| c.service == service)
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("rabbit_rpc.json")),
        ("Current directory (alternative)", Path::new("config/rabbit_rpc.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbit_rpc.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find rabbit_rpc.json configuration file. \
         Please create one in the current directory, config/, or your home directory."
    ))
}

pub fn load_config_from(path: &Path) -> Result<ClientsConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: ClientsConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    for client in &config.clients {
        client.validate()?;
    }
    Ok(config)
}

pub fn load_config() -> Result<ClientsConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}
