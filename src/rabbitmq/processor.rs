// src/rabbitmq/processor.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error};

use super::errors::{Result, RpcError};
use super::message::CorrelationId;

pub const STATUS_KEY: &str = "_status";
pub const RESPONSE_KEY: &str = "_response";
pub const STATUS_OK: &str = "ok";

/// What a processor knows about the reply besides its body.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub service: String,
    pub correlation_id: Option<CorrelationId>,
    /// Set when the matched message carried the dead-letter marker.
    pub dead_lettered: bool,
}

/// Post-processing applied to a matched, decoded reply before it reaches the caller.
pub trait ResponseProcessor: Send + Sync {
    fn process(&self, ctx: &ResponseContext, body: Value) -> Result<Value>;
}

impl<F> ResponseProcessor for F
where
    F: Fn(&ResponseContext, Value) -> Result<Value> + Send + Sync,
{
    fn process(&self, ctx: &ResponseContext, body: Value) -> Result<Value> {
        self(ctx, body)
    }
}

pub type ProcessorPtr = Arc<dyn ResponseProcessor>;

/// Expects `{"_status": {"code": "ok"}, "_response": {...}}` and unwraps `_response`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeProcessor;

impl ResponseProcessor for EnvelopeProcessor {
    fn process(&self, ctx: &ResponseContext, body: Value) -> Result<Value> {
        debug!(service = %ctx.service, "Raw response received");

        if ctx.dead_lettered {
            return Err(RpcError::DeadLettered {
                service: ctx.service.clone(),
            });
        }

        let status = body
            .get(STATUS_KEY)
            .ok_or_else(|| RpcError::Malformed {
                service: ctx.service.clone(),
            })?;

        let code = status.get("code");
        if code.and_then(Value::as_str) != Some(STATUS_OK) {
            let code = match code {
                Some(Value::String(code)) => code.clone(),
                Some(other) => other.to_string(),
                None => "null".to_string(),
            };
            error!(service = %ctx.service, status_code = %code, "Bad status from service");
            return Err(RpcError::Remote {
                service: ctx.service.clone(),
                code,
            });
        }

        let data = body
            .get(RESPONSE_KEY)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        debug!(service = %ctx.service, data = %data, "Data from service");
        Ok(data)
    }
}

/// Returns the decoded body untouched. Bypasses the envelope contract entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ResponseProcessor for PassThrough {
    fn process(&self, ctx: &ResponseContext, body: Value) -> Result<Value> {
        debug!(service = %ctx.service, response = %body, "Passing response through");
        Ok(body)
    }
}

/// Processor selection as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    Envelope,
    PassThrough,
}

impl ProcessorKind {
    pub fn build(self) -> ProcessorPtr {
        match self {
            ProcessorKind::Envelope => Arc::new(EnvelopeProcessor),
            ProcessorKind::PassThrough => Arc::new(PassThrough),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::ErrorKind;
    use serde_json::json;

    fn ctx(dead_lettered: bool) -> ResponseContext {
        ResponseContext {
            service: "get_stuff".to_string(),
            correlation_id: None,
            dead_lettered,
        }
    }

    #[test]
    fn test_envelope_unwraps_response() {
        let body = json!({"_status": {"code": "ok"}, "_response": {"result": 42}});
        let data = EnvelopeProcessor.process(&ctx(false), body).unwrap();
        assert_eq!(data, json!({"result": 42}));
    }

    #[test]
    fn test_envelope_without_response_is_empty_mapping() {
        let body = json!({"_status": {"code": "ok"}});
        let data = EnvelopeProcessor.process(&ctx(false), body).unwrap();
        assert_eq!(data, json!({}));
    }

    #[test]
    fn test_envelope_error_code_is_remote_error() {
        let body = json!({"_status": {"code": "error"}});
        let err = EnvelopeProcessor.process(&ctx(false), body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        let message = err.to_string();
        assert!(message.contains("get_stuff"));
        assert!(message.contains("error"));
    }

    #[test]
    fn test_envelope_missing_code_is_remote_error() {
        let err = EnvelopeProcessor
            .process(&ctx(false), json!({"_status": {}}))
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { ref code, .. } if code == "null"));
    }

    #[test]
    fn test_envelope_missing_status_is_malformed() {
        let err = EnvelopeProcessor.process(&ctx(false), json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let message = err.to_string();
        assert!(message.contains("malformed response"));
        assert!(message.contains("get_stuff"));
    }

    #[test]
    fn test_envelope_rejects_dead_lettered_regardless_of_body() {
        let body = json!({"_status": {"code": "ok"}, "_response": {"result": 42}});
        let err = EnvelopeProcessor.process(&ctx(true), body).unwrap_err();
        assert!(matches!(err, RpcError::DeadLettered { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_pass_through_returns_body_unchanged() {
        let body = json!({"success": true, "message": ""});
        assert_eq!(PassThrough.process(&ctx(false), body.clone()).unwrap(), body);
    }

    #[test]
    fn test_closure_processor() {
        let processor =
            |_: &ResponseContext, body: Value| -> Result<Value> { Ok(body["items"].clone()) };
        let data = processor
            .process(&ctx(false), json!({"items": [1, 2]}))
            .unwrap();
        assert_eq!(data, json!([1, 2]));
    }

    #[test]
    fn test_processor_kind_from_config() {
        let kind: ProcessorKind = serde_json::from_str("\"pass_through\"").unwrap();
        assert_eq!(kind, ProcessorKind::PassThrough);
        let data = kind.build().process(&ctx(false), json!({})).unwrap();
        assert_eq!(data, json!({}));
    }
}
