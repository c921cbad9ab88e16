// src/rabbitmq/listener.rs
//! Waiting for the reply to one request on a shared response queue.
//!
//! The listener is a small state machine:
//!
//! ```text
//! Waiting --(matching id)--> Matched --(decoded)--> Done
//! Waiting --(deadline)-----> TimedOut -----------> Failed
//! ```
//!
//! Only a message carrying the awaited correlation id is acknowledged. Every
//! other delivery is rejected with requeue so the consumer it belongs to can
//! still claim it. The deadline is fixed when the listener is created and is
//! not extended by non-matching traffic.

use serde_json::Value;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::broker::ReplyStream;
use super::errors::{Result, RpcError};
use super::message::{CorrelationId, DeadLetterPredicate, InboundMessage};

/// What happens to one inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Consume permanently. Only for the message this call waits for.
    Ack,
    /// Return to the queue for another waiter.
    Requeue,
}

/// Acknowledge exactly the message whose correlation id is `expected`.
pub fn disposition(expected: &CorrelationId, message: &InboundMessage) -> Disposition {
    if message.correlates_with(expected) {
        Disposition::Ack
    } else {
        Disposition::Requeue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Waiting,
    Matched,
    Done,
    TimedOut,
    Failed,
}

impl ListenerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ListenerState::Done | ListenerState::Failed)
    }
}

/// The reply a listener accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedReply {
    pub correlation_id: CorrelationId,
    pub body: Value,
    pub dead_lettered: bool,
}

pub struct ResponseListener {
    correlation_id: CorrelationId,
    dead_letter: DeadLetterPredicate,
    timeout: Duration,
    deadline: Instant,
    state: ListenerState,
}

impl ResponseListener {
    pub fn new(
        correlation_id: CorrelationId,
        timeout: Duration,
        dead_letter: DeadLetterPredicate,
    ) -> Self {
        Self {
            correlation_id,
            dead_letter,
            timeout,
            deadline: Instant::now() + timeout,
            state: ListenerState::Waiting,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Feed one delivery. A match moves `Waiting` to `Matched`; anything else
    /// leaves the state alone.
    pub fn observe(&mut self, message: &InboundMessage) -> Disposition {
        if self.state != ListenerState::Waiting {
            return Disposition::Requeue;
        }
        let decision = disposition(&self.correlation_id, message);
        if decision == Disposition::Ack {
            self.state = ListenerState::Matched;
        }
        decision
    }

    /// Finish a `Matched` listener by decoding the body of the matched message.
    pub fn complete(&mut self, message: InboundMessage) -> Result<MatchedReply> {
        let dead_lettered = self.dead_letter.is_dead_lettered(&message.headers);
        match message.body.decode() {
            Ok(body) => {
                self.state = ListenerState::Done;
                Ok(MatchedReply {
                    correlation_id: self.correlation_id.clone(),
                    body,
                    dead_lettered,
                })
            }
            Err(e) => {
                warn!(correlation_id = %self.correlation_id, "Failed to decode response");
                self.state = ListenerState::Failed;
                Err(e)
            }
        }
    }

    /// The deadline passed without a match.
    pub fn expire(&mut self, service: &str) -> RpcError {
        self.state = ListenerState::TimedOut;
        warn!(
            correlation_id = %self.correlation_id,
            service = %service,
            "Timed out waiting for response"
        );
        RpcError::Timeout {
            service: service.to_string(),
            timeout: self.timeout,
        }
    }

    fn fail(&mut self, error: RpcError) -> RpcError {
        self.state = ListenerState::Failed;
        error
    }

    /// Drain `replies` until the awaited message arrives or the deadline passes.
    pub async fn listen(
        &mut self,
        replies: &mut dyn ReplyStream,
        service: &str,
    ) -> Result<MatchedReply> {
        while self.state == ListenerState::Waiting {
            let message = match timeout_at(self.deadline, replies.next()).await {
                Err(_) => {
                    let timeout = self.expire(service);
                    return Err(self.fail(timeout));
                }
                Ok(Err(e)) => return Err(self.fail(e)),
                Ok(Ok(None)) => {
                    return Err(self.fail(RpcError::ConsumerClosed {
                        service: service.to_string(),
                    }))
                }
                Ok(Ok(Some(message))) => message,
            };

            match self.observe(&message) {
                Disposition::Requeue => {
                    debug!(
                        expected = %self.correlation_id,
                        received = ?message.correlation_id,
                        "Message requeued"
                    );
                    if let Err(e) = replies.requeue(message.delivery_tag).await {
                        return Err(self.fail(e));
                    }
                }
                Disposition::Ack => {
                    debug!(correlation_id = %self.correlation_id, "Message received");
                    if let Err(e) = replies.ack(message.delivery_tag).await {
                        return Err(self.fail(e));
                    }
                    return self.complete(message);
                }
            }
        }

        Err(RpcError::Channel(format!(
            "listener for {} is no longer waiting",
            self.correlation_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::message::{Headers, MessageBody};
    use serde_json::json;

    fn message(id: Option<&str>, body: MessageBody) -> InboundMessage {
        InboundMessage {
            delivery_tag: 1,
            correlation_id: id.map(CorrelationId::from),
            headers: Headers::new(),
            body,
        }
    }

    fn listener(id: &str) -> ResponseListener {
        ResponseListener::new(
            id.into(),
            Duration::from_secs(5),
            DeadLetterPredicate::default(),
        )
    }

    #[test]
    fn test_disposition_acks_only_matching_id() {
        let expected = CorrelationId::from("abc");
        let body = || MessageBody::Json(json!({}));

        assert_eq!(disposition(&expected, &message(Some("abc"), body())), Disposition::Ack);
        assert_eq!(disposition(&expected, &message(Some("xyz"), body())), Disposition::Requeue);
        assert_eq!(disposition(&expected, &message(None, body())), Disposition::Requeue);
    }

    #[test]
    fn test_non_matching_keeps_waiting() {
        let mut listener = listener("abc");
        let other = message(Some("xyz"), MessageBody::Json(json!({"_status": {"code": "ok"}})));

        assert_eq!(listener.observe(&other), Disposition::Requeue);
        assert_eq!(listener.state(), ListenerState::Waiting);
    }

    #[test]
    fn test_match_then_complete() {
        let mut listener = listener("abc");
        let reply = message(Some("abc"), MessageBody::Bytes(br#"{"result": 1}"#.to_vec()));

        assert_eq!(listener.observe(&reply), Disposition::Ack);
        assert_eq!(listener.state(), ListenerState::Matched);

        let matched = listener.complete(reply).unwrap();
        assert_eq!(matched.body, json!({"result": 1}));
        assert!(!matched.dead_lettered);
        assert_eq!(listener.state(), ListenerState::Done);
        assert!(listener.state().is_terminal());
    }

    #[test]
    fn test_second_match_is_not_accepted() {
        let mut listener = listener("abc");
        let reply = message(Some("abc"), MessageBody::Json(json!({})));
        assert_eq!(listener.observe(&reply), Disposition::Ack);
        assert_eq!(listener.observe(&reply), Disposition::Requeue);
    }

    #[test]
    fn test_undecodable_match_fails() {
        let mut listener = listener("abc");
        let reply = message(Some("abc"), MessageBody::Bytes(b"<html>".to_vec()));
        listener.observe(&reply);

        let err = listener.complete(reply).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        assert_eq!(listener.state(), ListenerState::Failed);
    }

    #[test]
    fn test_dead_letter_flag_is_recorded() {
        let mut listener = listener("abc");
        let mut reply = message(Some("abc"), MessageBody::Json(json!({})));
        reply.headers.insert("x-death".into(), json!([]));
        listener.observe(&reply);

        assert!(listener.complete(reply).unwrap().dead_lettered);
    }

    #[test]
    fn test_expire_moves_to_timed_out() {
        let mut listener = listener("abc");
        let err = listener.expire("get_stuff");
        assert!(err.is_timeout());
        assert_eq!(listener.state(), ListenerState::TimedOut);
        assert_eq!(listener.observe(&message(Some("abc"), MessageBody::Json(json!({})))), Disposition::Requeue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_fixed_at_creation() {
        let listener = listener("abc");
        let created = Instant::now();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(listener.deadline(), created + Duration::from_secs(5));
    }
}
