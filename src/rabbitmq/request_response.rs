// src/rabbitmq/request_response.rs
//! Synchronous request/reply over a shared response queue.
//!
//! [`RpcClient::call`] publishes one request and suspends the calling task
//! until the reply carrying the same correlation id arrives on the client's
//! response queue, or the configured timeout passes. One client holds one
//! session state, so calls on the same client never overlap; `call` takes
//! `&mut self` to make that a compile-time guarantee. Use one client per
//! in-flight call, or [`MultiplexClient`](super::multiplex::MultiplexClient)
//! to share a connection between concurrent callers.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use super::broker::{BrokerPtr, BrokerSession, ReplyStream};
use super::errors::Result;
use super::listener::{MatchedReply, ResponseListener};
use super::message::{CorrelationId, DeadLetterPredicate, RpcRequest};
use super::processor::{ProcessorPtr, ResponseContext, ResponseProcessor};
use super::publisher::Publisher;
use crate::config::ClientSettings;

/// Per-call switches.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Wait for and return the reply. When false the call returns right after publishing.
    pub response_required: bool,
    /// Propagate failures. When false any failure becomes `Ok(None)`.
    pub reraise_errors: bool,
    /// Used instead of the client's configured routing key.
    pub routing_key: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            response_required: true,
            reraise_errors: true,
            routing_key: None,
        }
    }
}

impl CallOptions {
    pub fn fire_and_forget() -> Self {
        Self {
            response_required: false,
            ..Self::default()
        }
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn suppress_errors(mut self) -> Self {
        self.reraise_errors = false;
        self
    }
}

/// Mutable state of the call currently in progress.
#[derive(Debug, Clone, Default)]
struct ClientSession {
    correlation_id: Option<CorrelationId>,
    pending_result: Option<Value>,
    saw_error: bool,
}

pub struct RpcClient {
    broker: BrokerPtr,
    settings: ClientSettings,
    publisher: Publisher,
    processor: ProcessorPtr,
    dead_letter: DeadLetterPredicate,
    session: ClientSession,
    exchange_declared: bool,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}Client timeout={}s>", self.settings.service, self.settings.timeout_secs)
    }
}

impl RpcClient {
    pub fn new(broker: BrokerPtr, settings: ClientSettings) -> Self {
        let publisher = Publisher::new(
            settings.exchange.clone(),
            settings.response_routing_key.clone(),
        );
        let processor = settings.processor.build();
        let dead_letter = settings.dead_letter_predicate();
        debug!(service = %settings.service, "Client initialised");

        Self {
            broker,
            settings,
            publisher,
            processor,
            dead_letter,
            session: ClientSession::default(),
            exchange_declared: false,
        }
    }

    /// Replace the response processor chosen by the settings.
    pub fn with_processor(mut self, processor: impl ResponseProcessor + 'static) -> Self {
        self.processor = std::sync::Arc::new(processor);
        self
    }

    pub fn with_dead_letter_predicate(mut self, predicate: DeadLetterPredicate) -> Self {
        self.dead_letter = predicate;
        self
    }

    pub fn service(&self) -> &str {
        &self.settings.service
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout()
    }

    /// Correlation id of the most recent call, if it expected a reply.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.session.correlation_id.as_ref()
    }

    /// Decoded body of the most recent matched reply, before processing.
    pub fn last_raw_response(&self) -> Option<&Value> {
        self.session.pending_result.as_ref()
    }

    /// Whether the most recent matched reply was dead-lettered.
    pub fn saw_error_response(&self) -> bool {
        self.session.saw_error
    }

    /// Send `message` and, unless told otherwise, wait for the processed reply.
    ///
    /// Returns `Ok(None)` when no reply was requested, or when a failure was
    /// suppressed through [`CallOptions::suppress_errors`].
    #[instrument(skip(self, message, options), fields(service = %self.settings.service))]
    pub async fn call<T>(&mut self, message: &T, options: CallOptions) -> Result<Option<Value>>
    where
        T: Serialize + ?Sized + Sync,
    {
        match self.try_call(message, &options).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Error in AMQP RPC call");
                if options.reraise_errors {
                    Err(e)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// `call` with default options; the processed reply is always present.
    pub async fn request<T>(&mut self, message: &T) -> Result<Value>
    where
        T: Serialize + ?Sized + Sync,
    {
        let reply = self.call(message, CallOptions::default()).await?;
        Ok(reply.unwrap_or(Value::Null))
    }

    async fn try_call<T>(&mut self, message: &T, options: &CallOptions) -> Result<Option<Value>>
    where
        T: Serialize + ?Sized + Sync,
    {
        let correlation_id = options.response_required.then(CorrelationId::generate);
        let routing_key = options
            .routing_key
            .as_deref()
            .unwrap_or(self.settings.send_routing_key.as_str());

        self.session = ClientSession {
            correlation_id: correlation_id.clone(),
            ..ClientSession::default()
        };

        let request = RpcRequest::new(
            routing_key,
            message,
            correlation_id.clone(),
            self.publisher.reply_to(),
        )?;

        // Released back to the pool when dropped, whichever way this returns
        let session = self.broker.acquire().await?;

        if !self.exchange_declared {
            session.declare_exchange(self.publisher.exchange()).await?;
            self.exchange_declared = true;
        }

        let Some(correlation_id) = correlation_id else {
            self.publisher.send_request(session.as_ref(), &request).await?;
            return Ok(None);
        };

        let mut replies = session
            .open_replies(&self.settings.response_routing_key)
            .await?;
        let outcome = self
            .exchange(session.as_ref(), replies.as_mut(), &request, correlation_id)
            .await;
        if let Err(e) = replies.close().await {
            warn!(error = %e, "Failed to cancel reply consumer");
        }
        let reply = outcome?;

        self.session.saw_error = reply.dead_lettered;
        self.session.pending_result = Some(reply.body.clone());
        debug!(result = %reply.body, "Result of call");

        let ctx = ResponseContext {
            service: self.settings.service.clone(),
            correlation_id: Some(reply.correlation_id),
            dead_lettered: reply.dead_lettered,
        };
        self.processor.process(&ctx, reply.body).map(Some)
    }

    async fn exchange(
        &self,
        session: &dyn BrokerSession,
        replies: &mut dyn ReplyStream,
        request: &RpcRequest,
        correlation_id: CorrelationId,
    ) -> Result<MatchedReply> {
        self.publisher.send_request(session, request).await?;

        let mut listener =
            ResponseListener::new(correlation_id, self.timeout(), self.dead_letter.clone());
        listener.listen(replies, &self.settings.service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;
    use crate::rabbitmq::message::ExchangeSpec;
    use crate::rabbitmq::processor::ProcessorKind;
    use serde_json::json;
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

    #[test]
    fn test_options() {
        let options = CallOptions::default();
        assert!(options.response_required);
        assert!(options.reraise_errors);
        assert!(options.routing_key.is_none());

        let options = CallOptions::fire_and_forget()
            .routing_key("stuff.put")
            .suppress_errors();
        assert!(!options.response_required);
        assert!(!options.reraise_errors);
        assert_eq!(options.routing_key.as_deref(), Some("stuff.put"));
    }

    #[test]
    fn test_debug_repr() {
        let client = RpcClient::new(Arc::new(MemoryBroker::new()), settings());
        assert_eq!(format!("{:?}", client), "<get_stuffClient timeout=2s>");
    }

    #[tokio::test]
    async fn test_session_state_tracks_last_call() {
        let broker = MemoryBroker::new();
        broker.respond_with(|request| {
            vec![MemoryBroker::reply(
                request,
                json!({"_status": {"code": "ok"}, "_response": {"n": 1}}),
            )]
        });
        let mut client = RpcClient::new(Arc::new(broker.clone()), settings());

        let result = client.request(&json!({"stuff_id": 1})).await.unwrap();
        assert_eq!(result, json!({"n": 1}));

        let published = broker.published();
        assert_eq!(client.correlation_id(), published[0].request.correlation_id.as_ref());
        assert_eq!(
            client.last_raw_response(),
            Some(&json!({"_status": {"code": "ok"}, "_response": {"n": 1}}))
        );
        assert!(!client.saw_error_response());
    }

    #[tokio::test]
    async fn test_exchange_declared_once() {
        let broker = MemoryBroker::new();
        let mut client = RpcClient::new(Arc::new(broker.clone()), settings());

        for _ in 0..3 {
            client
                .call(&json!({}), CallOptions::fire_and_forget())
                .await
                .unwrap();
        }
        assert_eq!(broker.declared_exchanges(), vec![ExchangeSpec::topic("stuff")]);
        assert_eq!(broker.published().len(), 3);
    }
}
