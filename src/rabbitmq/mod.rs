// src/rabbitmq/mod.rs
// RPC over RabbitMQ: broker seam, call lifecycle and response handling

pub mod errors;
pub mod message;
pub mod broker;
pub mod connection;

// Broker implementations
pub mod amqp;
pub mod memory;

// Call pipeline
pub mod processor;
pub mod listener;
pub mod publisher;
pub mod request_response;
pub mod multiplex;

// Re-export specific items to simplify imports elsewhere
pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerPtr, BrokerSession, ReplyStream};
pub use connection::{ConnectionPool, PooledConnection};
pub use errors::{ErrorKind, Result, RpcError};
pub use listener::{disposition, Disposition, ListenerState, MatchedReply, ResponseListener};
pub use memory::{MemoryBroker, PublishedRequest, Redelivery};
pub use message::{
    CorrelationId, DeadLetterPredicate, ExchangeSpec, ExchangeType, Headers, InboundMessage,
    MessageBody, RpcRequest,
};
pub use multiplex::{MultiplexClient, PendingRegistry};
pub use processor::{
    EnvelopeProcessor, PassThrough, ProcessorKind, ProcessorPtr, ResponseContext,
    ResponseProcessor, RESPONSE_KEY, STATUS_KEY, STATUS_OK,
};
pub use publisher::Publisher;
pub use request_response::{CallOptions, RpcClient};
