// src/rabbitmq/memory.rs
//! In-process broker with shared reply queues.
//!
//! Mirrors the parts of RabbitMQ the RPC client relies on: named queues that
//! several consumers may share, manual acknowledgement, and reject-with-requeue.
//! By default a requeued message goes back to the head of its queue and is
//! redelivered after a short round trip, possibly to the consumer that
//! rejected it, as RabbitMQ does for a queue's only consumer. Other deliveries
//! keep flowing meanwhile, as they would within a prefetch window. Replies are
//! produced by an optional responder that sees every published request.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::broker::{Broker, BrokerSession, ReplyStream};
use super::errors::{Result, RpcError};
use super::message::{
    CorrelationId, ExchangeSpec, Headers, InboundMessage, MessageBody, RpcRequest,
};

type Responder = Arc<dyn Fn(&RpcRequest) -> Vec<InboundMessage> + Send + Sync>;

/// A request as it was handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRequest {
    pub exchange: String,
    pub request: RpcRequest,
}

/// What happens to a message after a consumer requeues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redelivery {
    /// Back to the head of the queue, visible to every consumer including the
    /// one that rejected it.
    #[default]
    SameConsumer,
    /// To the tail of the queue; the rejecting consumer never sees it again.
    OtherConsumers,
}

const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(10);

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<(u64, InboundMessage)>>,
    unacked: HashMap<u64, (String, u64, InboundMessage)>,
    next_message_id: u64,
    next_delivery_tag: u64,
    exchanges: Vec<ExchangeSpec>,
    published: Vec<PublishedRequest>,
    acked: Vec<InboundMessage>,
    requeued: Vec<InboundMessage>,
    open_sessions: usize,
    acquire_failure: Option<String>,
    publish_failure: Option<String>,
    consumers_closed: bool,
    redelivery: Redelivery,
    redelivery_delay: Duration,
    // Requeued message id -> when it becomes deliverable again
    held: HashMap<u64, Instant>,
}

impl State {
    fn enqueue(&mut self, queue: &str, message: InboundMessage) {
        self.next_message_id += 1;
        let id = self.next_message_id;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back((id, message));
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    responder: Mutex<Option<Responder>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    redelivery_delay: DEFAULT_REDELIVERY_DELAY,
                    ..State::default()
                }),
                notify: Notify::new(),
                responder: Mutex::new(None),
            }),
        }
    }

    pub fn with_redelivery(self, redelivery: Redelivery) -> Self {
        self.shared.lock().redelivery = redelivery;
        self
    }

    /// Time a requeued message spends away before it can be delivered again.
    pub fn with_redelivery_delay(self, delay: Duration) -> Self {
        self.shared.lock().redelivery_delay = delay;
        self
    }

    /// Install a responder producing the replies for each published request.
    /// Replies land on the request's `reply_to` queue.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&RpcRequest) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        let mut slot = match self.shared.responder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(responder));
    }

    /// A reply correlated to `request` carrying `body`.
    pub fn reply(request: &RpcRequest, body: Value) -> InboundMessage {
        InboundMessage {
            delivery_tag: 0,
            correlation_id: request.correlation_id.clone(),
            headers: Headers::new(),
            body: MessageBody::Json(body),
        }
    }

    /// A message carrying an arbitrary correlation id.
    pub fn message(correlation_id: Option<CorrelationId>, body: MessageBody) -> InboundMessage {
        InboundMessage {
            delivery_tag: 0,
            correlation_id,
            headers: Headers::new(),
            body,
        }
    }

    /// Put a message directly on `queue`, as if another service had replied there.
    pub fn inject(&self, queue: &str, message: InboundMessage) {
        self.shared.lock().enqueue(queue, message);
        self.shared.notify.notify_waiters();
    }

    pub fn fail_acquire(&self, reason: impl Into<String>) {
        self.shared.lock().acquire_failure = Some(reason.into());
    }

    pub fn fail_publish(&self, reason: impl Into<String>) {
        self.shared.lock().publish_failure = Some(reason.into());
    }

    /// End every reply stream, as a broker-side consumer cancel would.
    pub fn close_consumers(&self) {
        self.shared.lock().consumers_closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn published(&self) -> Vec<PublishedRequest> {
        self.shared.lock().published.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<ExchangeSpec> {
        self.shared.lock().exchanges.clone()
    }

    pub fn acked(&self) -> Vec<InboundMessage> {
        self.shared.lock().acked.clone()
    }

    pub fn requeued(&self) -> Vec<InboundMessage> {
        self.shared.lock().requeued.clone()
    }

    /// Messages currently waiting on `queue`, delivered or not.
    pub fn queued(&self, queue: &str) -> Vec<InboundMessage> {
        let state = self.shared.lock();
        let waiting = state
            .queues
            .get(queue)
            .into_iter()
            .flatten()
            .map(|(_, message)| message.clone());
        let in_flight = state
            .unacked
            .values()
            .filter(|(name, _, _)| name == queue)
            .map(|(_, _, message)| message.clone());
        waiting.chain(in_flight).collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.lock().open_sessions
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn acquire(&self) -> Result<Box<dyn BrokerSession>> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.acquire_failure {
            return Err(RpcError::Connection(reason.clone()));
        }
        state.open_sessions += 1;
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemorySession {
    shared: Arc<Shared>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared.lock().open_sessions -= 1;
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.exchanges.contains(exchange) {
            state.exchanges.push(exchange.clone());
        }
        Ok(())
    }

    async fn publish(&self, exchange: &ExchangeSpec, request: &RpcRequest) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if let Some(reason) = &state.publish_failure {
                return Err(RpcError::Publish {
                    exchange: exchange.name.clone(),
                    reason: reason.clone(),
                });
            }
            state.published.push(PublishedRequest {
                exchange: exchange.name.clone(),
                request: request.clone(),
            });
        }

        let responder = match self.shared.responder.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        if let Some(responder) = responder {
            let replies = responder(request);
            let mut state = self.shared.lock();
            for reply in replies {
                state.enqueue(&request.reply_to, reply);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn open_replies(&self, queue: &str) -> Result<Box<dyn ReplyStream>> {
        self.shared.lock().queues.entry(queue.to_string()).or_default();
        Ok(Box::new(MemoryReplyStream {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            rejected: HashSet::new(),
            delivered: HashSet::new(),
        }))
    }
}

struct MemoryReplyStream {
    shared: Arc<Shared>,
    queue: String,
    // Messages this consumer handed back under `Redelivery::OtherConsumers`
    rejected: HashSet<u64>,
    delivered: HashSet<u64>,
}

enum Take {
    Message(InboundMessage),
    Closed,
    // Nothing deliverable; the earliest held message frees up at this instant
    Wait(Option<Instant>),
}

impl MemoryReplyStream {
    fn try_take(&mut self) -> Take {
        let mut state = self.shared.lock();
        if state.consumers_closed {
            return Take::Closed;
        }

        let now = Instant::now();
        let mut wake_at: Option<Instant> = None;
        let position = {
            let state = &*state;
            let rejected = &self.rejected;
            state.queues.get(&self.queue).and_then(|queue| {
                queue.iter().position(|(id, _)| {
                    if rejected.contains(id) {
                        return false;
                    }
                    match state.held.get(id) {
                        Some(at) if *at > now => {
                            wake_at = Some(wake_at.map_or(*at, |w| w.min(*at)));
                            false
                        }
                        _ => true,
                    }
                })
            })
        };

        let taken = position.and_then(|position| {
            state
                .queues
                .get_mut(&self.queue)
                .and_then(|queue| queue.remove(position))
        });
        let Some((id, mut message)) = taken else {
            return Take::Wait(wake_at);
        };

        state.held.remove(&id);
        state.next_delivery_tag += 1;
        message.delivery_tag = state.next_delivery_tag;
        state
            .unacked
            .insert(message.delivery_tag, (self.queue.clone(), id, message.clone()));
        self.delivered.insert(message.delivery_tag);
        Take::Message(message)
    }

    fn return_unacked(&mut self) {
        let mut state = self.shared.lock();
        for tag in self.delivered.drain() {
            if let Some((queue, id, message)) = state.unacked.remove(&tag) {
                state
                    .queues
                    .entry(queue)
                    .or_default()
                    .push_front((id, message));
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl ReplyStream for MemoryReplyStream {
    async fn next(&mut self) -> Result<Option<InboundMessage>> {
        let shared = Arc::clone(&self.shared);
        loop {
            // Registered before the check so a concurrent notify is not missed
            let notified = shared.notify.notified();
            match self.try_take() {
                Take::Message(message) => return Ok(Some(message)),
                Take::Closed => return Ok(None),
                Take::Wait(Some(at)) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                Take::Wait(None) => notified.await,
            }
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        let mut state = self.shared.lock();
        let (_, _, message) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| RpcError::Channel(format!("unknown delivery tag {}", delivery_tag)))?;
        self.delivered.remove(&delivery_tag);
        state.acked.push(message);
        Ok(())
    }

    async fn requeue(&mut self, delivery_tag: u64) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let (queue, id, message) = state.unacked.remove(&delivery_tag).ok_or_else(|| {
                RpcError::Channel(format!("unknown delivery tag {}", delivery_tag))
            })?;
            self.delivered.remove(&delivery_tag);
            state.requeued.push(message.clone());
            match state.redelivery {
                Redelivery::SameConsumer => {
                    let at = Instant::now() + state.redelivery_delay;
                    state.held.insert(id, at);
                    state.queues.entry(queue).or_default().push_front((id, message));
                }
                Redelivery::OtherConsumers => {
                    self.rejected.insert(id);
                    state.queues.entry(queue).or_default().push_back((id, message));
                }
            }
        }
        debug!(delivery_tag, "Message requeued");
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.return_unacked();
        Ok(())
    }
}

impl Drop for MemoryReplyStream {
    fn drop(&mut self) {
        self.return_unacked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn foreign(id: &str) -> InboundMessage {
        MemoryBroker::message(Some(id.into()), MessageBody::Json(json!({"for": id})))
    }

    #[tokio::test]
    async fn test_requeued_message_goes_to_another_consumer() {
        let broker = MemoryBroker::new().with_redelivery(Redelivery::OtherConsumers);
        let session = broker.acquire().await.unwrap();
        let mut first = session.open_replies("replies").await.unwrap();
        let mut second = session.open_replies("replies").await.unwrap();

        broker.inject("replies", foreign("abc"));

        let delivered = first.next().await.unwrap().unwrap();
        first.requeue(delivered.delivery_tag).await.unwrap();

        let redelivered = second.next().await.unwrap().unwrap();
        assert_eq!(redelivered.correlation_id, Some("abc".into()));
        assert_ne!(redelivered.delivery_tag, delivered.delivery_tag);
        second.ack(redelivered.delivery_tag).await.unwrap();

        assert_eq!(broker.acked().len(), 1);
        assert_eq!(broker.requeued().len(), 1);
        assert!(broker.queued("replies").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sole_consumer_gets_its_requeued_message_back() {
        let broker = MemoryBroker::new();
        let session = broker.acquire().await.unwrap();
        let mut stream = session.open_replies("replies").await.unwrap();
        broker.inject("replies", foreign("abc"));

        let started = Instant::now();
        for _ in 0..3 {
            let delivered = stream.next().await.unwrap().unwrap();
            assert_eq!(delivered.correlation_id, Some("abc".into()));
            stream.requeue(delivered.delivery_tag).await.unwrap();
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_REDELIVERY_DELAY * 2);
        assert!(elapsed < DEFAULT_REDELIVERY_DELAY * 3);
        assert_eq!(broker.requeued().len(), 3);
        assert_eq!(broker.queued("replies").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_message_does_not_block_the_queue() {
        let broker = MemoryBroker::new();
        let session = broker.acquire().await.unwrap();
        let mut stream = session.open_replies("replies").await.unwrap();
        broker.inject("replies", foreign("first"));
        broker.inject("replies", foreign("second"));

        let first = stream.next().await.unwrap().unwrap();
        stream.requeue(first.delivery_tag).await.unwrap();

        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.correlation_id, Some("second".into()));
    }

    #[tokio::test]
    async fn test_unacked_messages_return_on_close() {
        let broker = MemoryBroker::new();
        let session = broker.acquire().await.unwrap();
        let mut stream = session.open_replies("replies").await.unwrap();
        broker.inject("replies", foreign("abc"));

        stream.next().await.unwrap().unwrap();
        stream.close().await.unwrap();

        assert_eq!(broker.queued("replies").len(), 1);
    }

    #[tokio::test]
    async fn test_ack_unknown_tag_fails() {
        let broker = MemoryBroker::new();
        let session = broker.acquire().await.unwrap();
        let mut stream = session.open_replies("replies").await.unwrap();
        assert!(matches!(stream.ack(99).await, Err(RpcError::Channel(_))));
    }

    #[tokio::test]
    async fn test_sessions_are_counted() {
        let broker = MemoryBroker::new();
        let session = broker.acquire().await.unwrap();
        assert_eq!(broker.open_sessions(), 1);
        drop(session);
        assert_eq!(broker.open_sessions(), 0);
    }
}
