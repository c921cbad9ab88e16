// src/rabbitmq/amqp.rs
// lapin-backed implementation of the broker seam.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery, options::*, types::FieldTable, BasicProperties, Channel, Consumer,
    ExchangeKind,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{Broker, BrokerSession, ReplyStream};
use super::connection::{ConnectionPool, PooledConnection};
use super::errors::{Result, RpcError};
use super::message::{
    CorrelationId, ExchangeSpec, ExchangeType, Headers, InboundMessage, MessageBody, RpcRequest,
};
use crate::env::BrokerConfig;

/// Broker backed by a pool of RabbitMQ connections.
pub struct AmqpBroker {
    pool: Arc<ConnectionPool>,
    prefetch_count: u16,
}

impl AmqpBroker {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool: Arc::new(pool),
            prefetch_count: 10,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(ConnectionPool::new(config.amqp_uri(), config.pool_size))
    }

    /// Number of unacknowledged replies a session may hold (0 means unlimited).
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn acquire(&self) -> Result<Box<dyn BrokerSession>> {
        let connection = self.pool.acquire().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RpcError::Channel(e.to_string()))?;

        if self.prefetch_count > 0 {
            debug!("Setting channel QoS to {}", self.prefetch_count);
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RpcError::Channel(format!("Failed to set QoS: {}", e)))?;
        }

        Ok(Box::new(AmqpSession {
            channel,
            _connection: connection,
        }))
    }
}

struct AmqpSession {
    channel: Channel,
    // Field order matters: the channel goes before the connection is handed back.
    _connection: PooledConnection,
}

fn exchange_kind(kind: &ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        if exchange.is_default() {
            return Ok(());
        }

        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Channel(format!("Failed to declare exchange: {}", e)))?;

        debug!(exchange = %exchange.name, kind = %exchange.kind, "Exchange declared");
        Ok(())
    }

    async fn publish(&self, exchange: &ExchangeSpec, request: &RpcRequest) -> Result<()> {
        let publish_error = |e: lapin::Error| RpcError::Publish {
            exchange: exchange.name.clone(),
            reason: e.to_string(),
        };

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_reply_to(request.reply_to.as_str().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        if let Some(correlation_id) = &request.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }

        self.channel
            .basic_publish(
                &exchange.name,
                &request.routing_key,
                BasicPublishOptions::default(),
                &request.body,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        Ok(())
    }

    async fn open_replies(&self, queue: &str) -> Result<Box<dyn ReplyStream>> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Channel(format!("Failed to declare queue: {}", e)))?;

        let consumer_tag = format!("rpc-reply-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Channel(format!("Failed to create consumer: {}", e)))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Listening for replies");

        Ok(Box::new(AmqpReplyStream {
            channel: self.channel.clone(),
            consumer,
            consumer_tag,
        }))
    }
}

impl Drop for AmqpSession {
    fn drop(&mut self) {
        if !self.channel.status().connected() {
            return;
        }
        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close(200, "RPC session finished").await {
                        debug!("Channel close after session failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to close channel; leaving it to the connection"),
        }
    }
}

struct AmqpReplyStream {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
}

fn to_inbound(delivery: Delivery) -> InboundMessage {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| CorrelationId::from(id.as_str()));

    let headers: Headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| {
                    (
                        key.as_str().to_string(),
                        serde_json::to_value(value).unwrap_or(Value::Null),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        correlation_id,
        headers,
        body: MessageBody::Bytes(delivery.data),
    }
}

#[async_trait]
impl ReplyStream for AmqpReplyStream {
    async fn next(&mut self) -> Result<Option<InboundMessage>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(to_inbound(delivery))),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn requeue(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await?;
            info!(consumer_tag = %self.consumer_tag, "Reply consumer cancelled");
        }
        Ok(())
    }
}
