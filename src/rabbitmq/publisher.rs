// src/rabbitmq/publisher.rs

use tracing::debug;

use super::broker::BrokerSession;
use super::errors::Result;
use super::message::{ExchangeSpec, RpcRequest};

/// Sends requests to one exchange, always asking for replies on `reply_to`.
#[derive(Debug, Clone)]
pub struct Publisher {
    exchange: ExchangeSpec,
    reply_to: String,
}

impl Publisher {
    pub fn new(exchange: ExchangeSpec, reply_to: impl Into<String>) -> Self {
        Self {
            exchange,
            reply_to: reply_to.into(),
        }
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Publish once. A failure here is surfaced as is, never retried.
    pub async fn send_request(&self, session: &dyn BrokerSession, request: &RpcRequest) -> Result<()> {
        debug!(exchange = %self.exchange.name, kind = %self.exchange.kind, "Using exchange");
        session.publish(&self.exchange, request).await?;
        debug!(
            routing_key = %request.routing_key,
            correlation_id = ?request.correlation_id,
            "Message published"
        );
        Ok(())
    }
}
