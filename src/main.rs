// src/main.rs
use anyhow::{anyhow, Context, Result};
use rabbit_rpc::config::{self, ClientSettings};
use rabbit_rpc::env::BrokerConfig;
use rabbit_rpc::rabbitmq::{
    AmqpBroker, BrokerPtr, CallOptions, MemoryBroker, RpcClient, RpcError,
};
use rabbit_rpc::status::status_message;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "rabbit_rpc";

// The in-memory broker needs no real exchange or routing key
const MEMORY_FALLBACKS: &[(&str, &str)] = &[
    ("AMQP_EXCHANGE", "rabbit_rpc"),
    ("ROUTING_KEY", "rabbit_rpc.call"),
];

struct Args {
    memory: bool,
    service: Option<String>,
    message: Value,
}

fn usage() -> anyhow::Error {
    anyhow!("usage: rabbit_rpc [--memory] [--service <name>] '<json message>'")
}

fn parse_args() -> Result<Args> {
    let mut memory = false;
    let mut service = None;
    let mut message = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--memory" => memory = true,
            "--service" => service = Some(args.next().ok_or_else(usage)?),
            _ if message.is_none() => {
                let value: Value = serde_json::from_str(&arg)
                    .with_context(|| format!("Message is not valid JSON: {}", arg))?;
                message = Some(value);
            }
            _ => return Err(usage()),
        }
    }

    Ok(Args {
        memory,
        service,
        message: message.ok_or_else(usage)?,
    })
}

/// Client settings from `rabbit_rpc.json` when one names the service,
/// otherwise from the environment.
fn client_settings(broker_config: &BrokerConfig, service: Option<&str>) -> Result<ClientSettings> {
    if let Some(name) = service {
        let clients = config::load_config()?;
        return clients
            .client(name)
            .cloned()
            .ok_or_else(|| anyhow!("No client named {} in configuration", name));
    }
    Ok(ClientSettings::from_env(
        broker_config,
        SERVICE,
        format!("{}_response", SERVICE),
    ))
}

fn call_failure(e: &RpcError) -> anyhow::Error {
    anyhow!(status_message(e.status_code(), &e.to_string(), &[]))
}

/// Answers every request with a success envelope echoing the request body.
fn echo_broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.respond_with(|request| {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        vec![MemoryBroker::reply(
            request,
            json!({"_status": {"code": "ok"}, "_response": body}),
        )]
    });
    broker
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let broker_config = if args.memory {
        BrokerConfig::load_or(MEMORY_FALLBACKS)?
    } else {
        BrokerConfig::load()?
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&broker_config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = client_settings(&broker_config, args.service.as_deref())?;

    let amqp = (!args.memory).then(|| Arc::new(AmqpBroker::from_config(&broker_config)));
    let broker: BrokerPtr = match &amqp {
        Some(amqp) => amqp.clone() as BrokerPtr,
        None => {
            info!("Using in-memory broker");
            Arc::new(echo_broker()) as BrokerPtr
        }
    };

    let mut client = RpcClient::new(broker, settings);
    info!(client = ?client, "Calling service");
    let outcome = client.call(&args.message, CallOptions::default()).await;

    if let Some(amqp) = amqp {
        if let Err(e) = amqp.close().await {
            warn!(error = %e, "Failed to close broker connections");
        }
    }

    let result = outcome.map_err(|e| call_failure(&e))?.unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_failure_carries_status_string() {
        let err = call_failure(&RpcError::Connection("refused".to_string()));
        assert_eq!(err.to_string(), "503--RabbitMQ connection error: refused");
    }

    #[test]
    fn test_memory_fallbacks_satisfy_required_variables() {
        let config = BrokerConfig::from_lookup_or(|_| None, MEMORY_FALLBACKS).unwrap();
        assert_eq!(config.exchange, "rabbit_rpc");
        assert_eq!(config.routing_key, "rabbit_rpc.call");
    }
}
