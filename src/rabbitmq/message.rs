// src/rabbitmq/message.rs
// Wire-level types shared by the publisher, the listener and the broker backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::{Result, RpcError};

/// Opaque token linking a request to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh 128-bit random id, rendered as 32 hex characters.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchange kinds the client knows how to declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeType::Topic => "topic",
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Destination exchange for outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeType,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeType::Topic,
        }
    }

    /// The nameless default exchange cannot be declared.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

/// A request ready for the wire. Built fresh per call and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub correlation_id: Option<CorrelationId>,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub reply_to: String,
}

impl RpcRequest {
    pub fn new<T: Serialize + ?Sized>(
        routing_key: &str,
        message: &T,
        correlation_id: Option<CorrelationId>,
        reply_to: &str,
    ) -> Result<Self> {
        let body = serde_json::to_vec(message).map_err(RpcError::Encode)?;
        Ok(Self {
            correlation_id,
            routing_key: routing_key.to_string(),
            body,
            reply_to: reply_to.to_string(),
        })
    }
}

/// Inbound message headers. Values are kept for logging only.
pub type Headers = BTreeMap<String, Value>;

/// Body of an inbound message: either still raw bytes or already structured.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Bytes(Vec<u8>),
    Json(Value),
}

impl MessageBody {
    /// Structured bodies pass through; raw bodies are parsed as JSON text.
    pub fn decode(self) -> Result<Value> {
        match self {
            MessageBody::Json(value) => Ok(value),
            MessageBody::Bytes(bytes) => serde_json::from_slice(&bytes).map_err(RpcError::Decode),
        }
    }
}

/// One delivery drained from the reply queue.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub correlation_id: Option<CorrelationId>,
    pub headers: Headers,
    pub body: MessageBody,
}

impl InboundMessage {
    pub fn correlates_with(&self, expected: &CorrelationId) -> bool {
        self.correlation_id.as_ref() == Some(expected)
    }
}

/// Decides whether an inbound message was dead-lettered by the broker.
#[derive(Clone)]
pub struct DeadLetterPredicate(Arc<dyn Fn(&Headers) -> bool + Send + Sync>);

impl DeadLetterPredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Headers) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Presence of `header` alone marks the message; its value is ignored.
    pub fn header_present(header: impl Into<String>) -> Self {
        let header = header.into();
        Self::new(move |headers| headers.contains_key(&header))
    }

    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn is_dead_lettered(&self, headers: &Headers) -> bool {
        (self.0)(headers)
    }
}

impl Default for DeadLetterPredicate {
    fn default() -> Self {
        Self::header_present("x-death")
    }
}

impl fmt::Debug for DeadLetterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeadLetterPredicate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_unique() {
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 32);
    }

    #[test]
    fn test_decode_passes_structured_body_through() {
        let body = MessageBody::Json(json!({"_status": {"code": "ok"}}));
        assert_eq!(body.decode().unwrap(), json!({"_status": {"code": "ok"}}));
    }

    #[test]
    fn test_decode_parses_text() {
        let body = MessageBody::Bytes(br#"{"result": 42}"#.to_vec());
        assert_eq!(body.decode().unwrap(), json!({"result": 42}));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let body = MessageBody::Bytes(b"not json".to_vec());
        let err = body.decode().unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[test]
    fn test_dead_letter_presence_only() {
        let predicate = DeadLetterPredicate::default();
        let mut headers = Headers::new();
        assert!(!predicate.is_dead_lettered(&headers));

        headers.insert("x-death".into(), Value::Null);
        assert!(predicate.is_dead_lettered(&headers));
    }

    #[test]
    fn test_custom_dead_letter_predicate() {
        let predicate = DeadLetterPredicate::new(|headers| {
            headers.get("x-first-death-reason") == Some(&json!("rejected"))
        });
        let mut headers = Headers::new();
        headers.insert("x-first-death-reason".into(), json!("expired"));
        assert!(!predicate.is_dead_lettered(&headers));

        headers.insert("x-first-death-reason".into(), json!("rejected"));
        assert!(predicate.is_dead_lettered(&headers));
    }

    #[test]
    fn test_request_serializes_body() {
        let id = CorrelationId::generate();
        let request =
            RpcRequest::new("stuff.get", &json!({"stuff_id": 7}), Some(id.clone()), "replies").unwrap();
        assert_eq!(request.correlation_id, Some(id));
        assert_eq!(request.reply_to, "replies");
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body, json!({"stuff_id": 7}));
    }
}
