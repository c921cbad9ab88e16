// src/rabbitmq/multiplex.rs
//! Concurrent calls over one connection.
//!
//! A single dispatcher task owns the reply consumer and hands each delivery to
//! the caller registered under its correlation id. Late replies to calls that
//! already timed out are acked and dropped. Deliveries for ids this client never
//! issued are requeued, as in the single-call client.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::broker::{BrokerPtr, BrokerSession, ReplyStream};
use super::errors::{Result, RpcError};
use super::message::{CorrelationId, DeadLetterPredicate, InboundMessage, RpcRequest};
use super::processor::{ProcessorPtr, ResponseContext, ResponseProcessor};
use super::publisher::Publisher;
use super::request_response::CallOptions;
use crate::config::ClientSettings;

type Slots = HashMap<CorrelationId, oneshot::Sender<InboundMessage>>;

/// How many timed-out ids are remembered for discarding their late replies.
pub const EXPIRED_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Correlation id → slot for the reply. `None` once the dispatcher has stopped.
pub struct PendingRegistry {
    slots: Mutex<Option<Slots>>,
    // Oldest first, bounded by `EXPIRED_CAPACITY`
    expired: Mutex<VecDeque<CorrelationId>>,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Some(Slots::new())),
            expired: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Slots>> {
        lock(&self.slots)
    }

    /// Reserve a slot for `id`. Fails once the registry is closed.
    pub fn register(&self, id: CorrelationId) -> Option<oneshot::Receiver<InboundMessage>> {
        let mut guard = self.lock();
        let slots = guard.as_mut()?;
        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Some(rx)
    }

    pub fn take(&self, id: &CorrelationId) -> Option<oneshot::Sender<InboundMessage>> {
        self.lock().as_mut()?.remove(id)
    }

    pub fn remove(&self, id: &CorrelationId) {
        if let Some(slots) = self.lock().as_mut() {
            slots.remove(id);
        }
    }

    /// Give up on `id`: drop its slot and remember it, so a reply arriving
    /// later can be recognised as ours and discarded.
    pub fn expire(&self, id: CorrelationId) {
        self.remove(&id);
        let mut expired = lock(&self.expired);
        if expired.len() >= EXPIRED_CAPACITY {
            expired.pop_front();
        }
        expired.push_back(id);
    }

    /// Whether `id` belongs to an expired call. Forgets it when it does.
    pub fn take_expired(&self, id: &CorrelationId) -> bool {
        let mut expired = lock(&self.expired);
        match expired.iter().position(|known| known == id) {
            Some(position) => {
                expired.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every slot; their waiters see the sender go away.
    pub fn close(&self) {
        self.lock().take();
    }
}

pub struct MultiplexClient {
    session: Box<dyn BrokerSession>,
    settings: ClientSettings,
    publisher: Publisher,
    processor: ProcessorPtr,
    dead_letter: DeadLetterPredicate,
    pending: Arc<PendingRegistry>,
    dispatcher: JoinHandle<()>,
}

impl MultiplexClient {
    /// Acquire a long-lived session and start the dispatcher on the reply queue.
    pub async fn connect(broker: BrokerPtr, settings: ClientSettings) -> Result<Self> {
        let session = broker.acquire().await?;
        let publisher = Publisher::new(
            settings.exchange.clone(),
            settings.response_routing_key.clone(),
        );
        session.declare_exchange(publisher.exchange()).await?;
        let replies = session.open_replies(&settings.response_routing_key).await?;

        let pending = Arc::new(PendingRegistry::new());
        let dispatcher = tokio::spawn(dispatch(
            replies,
            Arc::clone(&pending),
            settings.service.clone(),
        ));
        info!(service = %settings.service, "Multiplexed client started");

        Ok(Self {
            session,
            processor: settings.processor.build(),
            dead_letter: settings.dead_letter_predicate(),
            settings,
            publisher,
            pending,
            dispatcher,
        })
    }

    pub fn with_processor(mut self, processor: impl ResponseProcessor + 'static) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    pub fn with_dead_letter_predicate(mut self, predicate: DeadLetterPredicate) -> Self {
        self.dead_letter = predicate;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout()
    }

    /// Calls currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Same contract as [`RpcClient::call`](super::request_response::RpcClient::call),
    /// but callable from many tasks at once.
    #[instrument(skip(self, message, options), fields(service = %self.settings.service))]
    pub async fn call<T>(&self, message: &T, options: CallOptions) -> Result<Option<Value>>
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

    async fn try_call<T>(&self, message: &T, options: &CallOptions) -> Result<Option<Value>>
    where
        T: Serialize + ?Sized + Sync,
    {
        let routing_key = options
            .routing_key
            .as_deref()
            .unwrap_or(self.settings.send_routing_key.as_str());

        if !options.response_required {
            let request = RpcRequest::new(routing_key, message, None, self.publisher.reply_to())?;
            self.publisher
                .send_request(self.session.as_ref(), &request)
                .await?;
            return Ok(None);
        }

        let correlation_id = CorrelationId::generate();
        let request = RpcRequest::new(
            routing_key,
            message,
            Some(correlation_id.clone()),
            self.publisher.reply_to(),
        )?;

        let slot = self
            .pending
            .register(correlation_id.clone())
            .ok_or_else(|| self.consumer_closed())?;

        if let Err(e) = self
            .publisher
            .send_request(self.session.as_ref(), &request)
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.timeout(), slot).await {
            Err(_) => {
                self.pending.expire(correlation_id.clone());
                warn!(correlation_id = %correlation_id, "Timed out waiting for response");
                return Err(RpcError::Timeout {
                    service: self.settings.service.clone(),
                    timeout: self.timeout(),
                });
            }
            Ok(Err(_)) => return Err(self.consumer_closed()),
            Ok(Ok(reply)) => reply,
        };

        let dead_lettered = self.dead_letter.is_dead_lettered(&reply.headers);
        let body = reply.body.decode()?;
        let ctx = ResponseContext {
            service: self.settings.service.clone(),
            correlation_id: Some(correlation_id),
            dead_lettered,
        };
        self.processor.process(&ctx, body).map(Some)
    }

    fn consumer_closed(&self) -> RpcError {
        RpcError::ConsumerClosed {
            service: self.settings.service.clone(),
        }
    }
}

impl Drop for MultiplexClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.pending.close();
    }
}

async fn dispatch(mut replies: Box<dyn ReplyStream>, pending: Arc<PendingRegistry>, service: String) {
    loop {
        let message = match replies.next().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!(service = %service, "Reply consumer closed");
                break;
            }
            Err(e) => {
                error!(service = %service, error = %e, "Error receiving reply");
                break;
            }
        };

        let id = message.correlation_id.clone();
        let slot = id.as_ref().and_then(|id| pending.take(id));

        match slot {
            Some(slot) => {
                if let Err(e) = replies.ack(message.delivery_tag).await {
                    error!(error = %e, "Failed to acknowledge reply");
                }
                if slot.send(message).is_err() {
                    debug!("Reply arrived after the caller gave up");
                }
            }
            None if id.as_ref().is_some_and(|id| pending.take_expired(id)) => {
                debug!(correlation_id = ?id, "Discarding reply to a timed-out call");
                if let Err(e) = replies.ack(message.delivery_tag).await {
                    error!(error = %e, "Failed to acknowledge late reply");
                }
            }
            None => {
                debug!(correlation_id = ?id, "Message requeued");
                if let Err(e) = replies.requeue(message.delivery_tag).await {
                    error!(error = %e, "Failed to requeue reply");
                }
            }
        }
    }

    pending.close();
    if let Err(e) = replies.close().await {
        debug!(error = %e, "Closing reply consumer failed");
    }
}
