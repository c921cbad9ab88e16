// src/rabbitmq/broker.rs

use async_trait::async_trait;
use std::sync::Arc;

use super::errors::Result;
use super::message::{ExchangeSpec, InboundMessage, RpcRequest};

/// Supplies scoped sessions on pooled, already-authenticated connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Acquire a session. Dropping it releases the underlying connection.
    async fn acquire(&self) -> Result<Box<dyn BrokerSession>>;
}

pub type BrokerPtr = Arc<dyn Broker>;

/// Operations available on one acquired connection.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare the exchange requests are published to.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    /// Publish exactly once. No retries at this layer.
    async fn publish(&self, exchange: &ExchangeSpec, request: &RpcRequest) -> Result<()>;

    /// Declare the reply queue and start a manual-ack consumer on it.
    async fn open_replies(&self, queue: &str) -> Result<Box<dyn ReplyStream>>;
}

/// Deliveries from the reply queue, each awaiting an explicit disposition.
#[async_trait]
pub trait ReplyStream: Send {
    /// Wait for the next delivery. `None` means the consumer was closed.
    async fn next(&mut self) -> Result<Option<InboundMessage>>;

    /// Consume the delivery permanently.
    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    /// Hand the delivery back to the broker for another consumer.
    async fn requeue(&mut self, delivery_tag: u64) -> Result<()>;

    /// Cancel the consumer. Unacknowledged deliveries return to the queue.
    async fn close(&mut self) -> Result<()>;
}
