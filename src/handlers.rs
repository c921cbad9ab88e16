// src/handlers.rs
//! Query entry point sitting in front of a pass-through RPC client.
//!
//! Errors are plain `"<code>--<message>"` strings so the invoking front door can
//! map them to its own responses without knowing about [`RpcError`].

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ClientSettings;
use crate::rabbitmq::{BrokerPtr, CallOptions, ProcessorKind, RpcClient, RpcError};
use crate::status::{status_message, BAD_REQUEST};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    fn bad_request(message: &str) -> Self {
        HandlerError(status_message(BAD_REQUEST, message, &[]))
    }

    fn from_rpc(e: &RpcError) -> Self {
        HandlerError(status_message(
            e.status_code(),
            "Error in request for GET call!",
            &[],
        ))
    }
}

pub struct QueryHandler {
    client: RpcClient,
    routing_key: String,
}

impl QueryHandler {
    /// The client always uses the pass-through processor; the reply's own
    /// `success` flag is checked here instead.
    pub fn new(broker: BrokerPtr, settings: ClientSettings) -> Self {
        let routing_key = settings.send_routing_key.clone();
        let settings = settings.with_processor(ProcessorKind::PassThrough);
        Self {
            client: RpcClient::new(broker, settings),
            routing_key,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub async fn handle(&mut self, request: Value) -> Result<Value, HandlerError> {
        let request = parse_request(request)?;

        // Keep-warm call, answered without touching the broker
        if request.get("noop").is_some_and(is_truthy) {
            if !request.get("skiplog").is_some_and(is_truthy) {
                info!("NoOp called !");
            }
            return Ok(json!({
                "message": "No Op call successful",
                "success": true,
            }));
        }

        debug!(request = ?request, "Got request");

        let options = CallOptions::default().routing_key(self.routing_key.clone());
        let response = match self.client.call(&request, options).await {
            Ok(response) => response.unwrap_or(Value::Null),
            Err(e) => {
                error!(error = %e, service = %self.client.service(), "Error in RPC request");
                return Err(HandlerError::from_rpc(&e));
            }
        };

        if response.get("success").and_then(Value::as_bool) == Some(true) {
            info!(stuff_id = ?request.get("stuff_id"), "Found stuff");
            return Ok(response);
        }

        info!(response = %response, "Error response from service");
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Err(HandlerError::bad_request(message))
    }
}

fn parse_request(request: Value) -> Result<Map<String, Value>, HandlerError> {
    let request = match request {
        Value::String(text) => {
            info!("Got string request, converting to JSON.");
            serde_json::from_str(&text).map_err(|_| {
                warn!(request = %text, "Malformed JSON in request");
                HandlerError::bad_request("Malformed JSON in request.")
            })?
        }
        other => other,
    };

    match request {
        Value::Object(map) => Ok(map),
        other => {
            warn!(request = %other, "Request not validated");
            Err(HandlerError::bad_request("Parameter mismatch: validation failed."))
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::{ExchangeSpec, MemoryBroker};
    use std::sync::Arc;

    fn settings() -> ClientSettings {
        ClientSettings {
            service: "get_stuff".to_string(),
            exchange: ExchangeSpec::topic("stuff"),
            send_routing_key: "stuff.get".to_string(),
            response_routing_key: "get_stuff_response".to_string(),
            timeout_secs: 2,
            processor: ProcessorKind::Envelope,
            dead_letter_header: Some("x-death".to_string()),
        }
    }

    fn handler(broker: &MemoryBroker) -> QueryHandler {
        QueryHandler::new(Arc::new(broker.clone()), settings())
    }

    #[tokio::test]
    async fn test_noop_skips_broker() {
        let broker = MemoryBroker::new();
        let response = handler(&broker)
            .handle(json!({"noop": true, "skiplog": true}))
            .await
            .unwrap();

        assert_eq!(response["success"], json!(true));
        assert!(broker.published().is_empty());
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_string() {
        let broker = MemoryBroker::new();
        let err = handler(&broker)
            .handle(Value::String("{ nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "400--Malformed JSON in request.");
    }

    #[tokio::test]
    async fn test_non_mapping_rejected() {
        let broker = MemoryBroker::new();
        let err = handler(&broker).handle(json!([1, 2])).await.unwrap_err();
        assert_eq!(err.0, "400--Parameter mismatch: validation failed.");
    }

    #[tokio::test]
    async fn test_successful_lookup_from_string_request() {
        let broker = MemoryBroker::new();
        broker.respond_with(|request| {
            vec![MemoryBroker::reply(
                request,
                json!({"success": true, "message": "", "stuff": {"id": 7}}),
            )]
        });

        let response = handler(&broker)
            .handle(Value::String(r#"{"stuff_id": 7}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(response["stuff"]["id"], json!(7));

        let published = broker.published();
        assert_eq!(published[0].request.routing_key, "stuff.get");
        assert_eq!(published[0].request.reply_to, "get_stuff_response");
    }

    #[tokio::test]
    async fn test_unsuccessful_reply_uses_its_message() {
        let broker = MemoryBroker::new();
        broker.respond_with(|request| {
            vec![MemoryBroker::reply(
                request,
                json!({"success": false, "message": "no such stuff"}),
            )]
        });

        let err = handler(&broker)
            .with_routing_key("stuff.lookup")
            .handle(json!({"stuff_id": 8}))
            .await
            .unwrap_err();
        assert_eq!(err.0, "400--no such stuff");
        assert_eq!(broker.published()[0].request.routing_key, "stuff.lookup");
    }

    #[tokio::test]
    async fn test_transport_failure_maps_to_status() {
        let broker = MemoryBroker::new();
        broker.fail_acquire("connection refused");

        let err = handler(&broker)
            .handle(json!({"stuff_id": 9}))
            .await
            .unwrap_err();
        assert_eq!(err.0, "503--Error in request for GET call!");
    }
}
