//! Agent Communication Protocol for agentshard.
//!
//! Routes messages between agents known to an [`AgentRegistry`]:
//! - Bounded per-recipient priority queues, drained by one delivery task per
//!   recipient so handlers for the same agent never overlap
//! - Fixed-window per-sender rate limiting
//! - Request/response correlation with timeouts
//! - Shard broadcast fan-out
//! - Periodic garbage collection of old messages and rate-limit windows

pub mod queue;
pub mod rate_limit;
pub mod types;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::events::{EventChannel, Subscription};
use crate::registry::AgentRegistry;

use queue::QueueSet;
use rate_limit::RateLimiter;

pub use types::{
    BroadcastReport, Message, MessageStatus, MessageType, Priority, SendOptions, SendOutcome,
};

/// Notifications published by the protocol.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    MessageSent(Message),
    MessageDelivered(Message),
    MessageFailed { message: Message, reason: String },
}

/// Counters reported by [`CommunicationProtocol::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub tracked_messages: usize,
    pub by_status: BTreeMap<MessageStatus, usize>,
    pub queued: usize,
    pub queue_lengths: BTreeMap<String, usize>,
    pub pending_requests: usize,
    pub rate_limited_senders: usize,
}

/// What one garbage-collection pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub messages: usize,
    pub rate_limits: usize,
    /// Waiters whose caller went away.
    pub requests: usize,
}

struct Record {
    message: Message,
    created: Instant,
}

type Waiter = oneshot::Sender<Result<Message>>;
type Reply = oneshot::Receiver<Result<Message>>;

struct ProtocolState {
    messages: HashMap<String, Record>,
    queues: QueueSet,
    rate_limiter: RateLimiter,
    /// Request id -> caller suspended in `send`.
    pending: HashMap<String, Waiter>,
    /// Recipients with a running delivery task.
    draining: HashSet<String>,
    closed: bool,
}

struct ProtocolInner {
    config: ProtocolConfig,
    registry: AgentRegistry,
    state: Mutex<ProtocolState>,
    events: EventChannel<ProtocolEvent>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

/// Held by a caller suspended on a request. If the caller's future is dropped,
/// the waiter is removed and the request marked expired.
struct PendingRequest<'a> {
    inner: &'a ProtocolInner,
    request_id: String,
    armed: bool,
}

impl PendingRequest<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        state.pending.remove(&self.request_id);
        if let Some(record) = state.messages.get_mut(&self.request_id) {
            record.message.mark_expired();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Drop for ProtocolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.gc_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Cloneable handle to the messaging layer.
#[derive(Clone)]
pub struct CommunicationProtocol {
    inner: Arc<ProtocolInner>,
}

impl CommunicationProtocol {
    /// Create a protocol bound to `registry` and start its GC sweep.
    ///
    /// Fails with `Error::Config` on a zero size, limit or interval. Must be
    /// called from within a Tokio runtime.
    pub fn new(registry: AgentRegistry, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let state = ProtocolState {
            messages: HashMap::new(),
            queues: QueueSet::new(config.max_queue_size),
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute),
            pending: HashMap::new(),
            draining: HashSet::new(),
            closed: false,
        };
        let protocol = Self {
            inner: Arc::new(ProtocolInner {
                config,
                registry,
                state: Mutex::new(state),
                events: EventChannel::default(),
                gc_task: Mutex::new(None),
            }),
        };
        protocol.start_gc();
        Ok(protocol)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> Subscription<ProtocolEvent> {
        self.inner.events.subscribe()
    }

    /// Send a message from one registered agent to another.
    ///
    /// Requests suspend until answered through [`respond`](Self::respond) or until
    /// their timeout elapses. Everything else returns once the message is queued.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        payload: Value,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.message_timeout());
        let message = Message::new(from, to, message_type, payload)
            .with_priority(options.priority)
            .with_timeout(timeout);
        self.dispatch(message).await
    }

    async fn dispatch(&self, message: Message) -> Result<SendOutcome> {
        let timeout = message.timeout();
        let (message_id, waiter) = self.enqueue(message)?;
        match waiter {
            None => Ok(SendOutcome::Queued(message_id)),
            Some(waiter) => self.await_response(message_id, waiter, timeout).await,
        }
    }

    /// Validate, rate-limit and queue a message, then make sure its recipient is
    /// being drained. A full queue is rejected before the sender's budget is charged.
    fn enqueue(&self, mut message: Message) -> Result<(String, Option<Reply>)> {
        if self.inner.state.lock().closed {
            return Err(Error::Shutdown);
        }
        let registry = &self.inner.registry;
        if !registry.contains(&message.from) {
            return Err(Error::UnknownAgent(message.from));
        }
        if !registry.contains(&message.to) {
            return Err(Error::UnknownAgent(message.to));
        }

        let message_id = message.id.clone();
        let recipient = message.to.clone();
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::Shutdown);
        }

        if state.queues.is_full(&recipient) {
            return Err(self.reject_full(state, message));
        }

        if !state.rate_limiter.try_acquire(&message.from) {
            drop(state);
            warn!(agent_id = %message.from, "Rate limit exceeded");
            return Err(Error::RateLimited {
                agent_id: message.from,
                limit: self.inner.config.rate_limit_per_minute,
            });
        }

        if !state
            .queues
            .push(&recipient, message_id.clone(), message.priority)
        {
            return Err(self.reject_full(state, message));
        }

        message.mark_sent();
        let waiter = if message.is_request() {
            let (tx, rx) = oneshot::channel();
            state.pending.insert(message_id.clone(), tx);
            Some(rx)
        } else {
            None
        };
        state.messages.insert(
            message_id.clone(),
            Record {
                message: message.clone(),
                created: Instant::now(),
            },
        );
        let start_drain = state.draining.insert(recipient.clone());
        drop(state);

        debug!(
            message_id = %message_id,
            from = %message.from,
            to = %recipient,
            message_type = ?message.message_type,
            priority = ?message.priority,
            "Message queued"
        );
        self.inner.events.publish(ProtocolEvent::MessageSent(message));
        if start_drain {
            self.spawn_drain(recipient);
        }
        Ok((message_id, waiter))
    }

    /// Record a message rejected for a full queue.
    fn reject_full(&self, mut state: MutexGuard<'_, ProtocolState>, mut message: Message) -> Error {
        let message_id = message.id.clone();
        let recipient = message.to.clone();
        let reason = format!("queue for {} is full", recipient);
        message.mark_failed(reason.clone());
        state.messages.insert(
            message_id.clone(),
            Record {
                message: message.clone(),
                created: Instant::now(),
            },
        );
        drop(state);

        warn!(message_id = %message_id, to = %recipient, "Message queue full");
        self.inner
            .events
            .publish(ProtocolEvent::MessageFailed { message, reason });
        Error::QueueFull {
            agent_id: recipient,
            max: self.inner.config.max_queue_size,
            message_id,
        }
    }

    async fn await_response(
        &self,
        request_id: String,
        waiter: Reply,
        timeout: Duration,
    ) -> Result<SendOutcome> {
        let guard = PendingRequest {
            inner: &self.inner,
            request_id: request_id.clone(),
            armed: true,
        };
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result.map(SendOutcome::Response)
            }
            // waiter dropped without an answer
            Ok(Err(_)) => {
                guard.disarm();
                Err(Error::Shutdown)
            }
            Err(_) => {
                drop(guard);
                warn!(message_id = %request_id, timeout_ms = millis(timeout), "Request timed out");
                Err(Error::RequestTimeout {
                    message_id: request_id,
                    timeout_ms: millis(timeout),
                })
            }
        }
    }

    /// Deliver the recipient's queue one message at a time until it is empty.
    fn spawn_drain(&self, recipient: String) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let protocol = CommunicationProtocol { inner };
                let Some(message) = protocol.next_for(&recipient) else {
                    break;
                };
                protocol.deliver(&recipient, message).await;
            }
        });
    }

    /// Pop the recipient's next deliverable message, or release its drain slot.
    fn next_for(&self, recipient: &str) -> Option<Message> {
        let mut state = self.inner.state.lock();
        loop {
            let Some(message_id) = state.queues.pop(recipient) else {
                state.draining.remove(recipient);
                return None;
            };
            match state.messages.get(&message_id) {
                Some(record) if record.message.status != MessageStatus::Expired => {
                    return Some(record.message.clone());
                }
                Some(_) => debug!(message_id = %message_id, "Skipping delivery of expired request"),
                None => {}
            }
        }
    }

    /// Hand one popped message to its recipient.
    async fn deliver(&self, recipient: &str, message: Message) {
        let Some(agent) = self.inner.registry.get_agent(recipient) else {
            let reason = Error::RecipientGone(recipient.to_string()).to_string();
            let failed = self.update(&message.id, |m| m.mark_failed(reason.clone()));
            warn!(message_id = %message.id, to = %recipient, "Delivery failed: recipient gone");
            if let Some(failed) = failed {
                self.inner
                    .events
                    .publish(ProtocolEvent::MessageFailed { message: failed, reason });
            }
            return;
        };

        let (delivered, waiter) = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.messages.get_mut(&message.id) else {
                return;
            };
            record.message.mark_delivered();
            let delivered = record.message.clone();
            let waiter = match (&delivered.message_type, &delivered.in_reply_to) {
                (MessageType::Response, Some(request_id)) => state.pending.remove(request_id),
                _ => None,
            };
            (delivered, waiter)
        };

        debug!(message_id = %delivered.id, to = %recipient, "Message delivered");
        self.inner
            .events
            .publish(ProtocolEvent::MessageDelivered(delivered.clone()));

        if let Some(waiter) = waiter {
            // the requester may have given up in the meantime
            let _ = waiter.send(Ok(delivered.clone()));
        }

        if let Err(e) = agent.receive(delivered).await {
            debug!(agent_id = %recipient, error = %e, "Recipient handler reported an error");
        }
    }

    fn update<F: FnOnce(&mut Message)>(&self, message_id: &str, f: F) -> Option<Message> {
        let mut state = self.inner.state.lock();
        let record = state.messages.get_mut(message_id)?;
        f(&mut record.message);
        Some(record.message.clone())
    }

    /// Answer a request. Returns the id of the response message.
    pub async fn respond(&self, request_id: &str, payload: Value) -> Result<String> {
        let response = {
            let mut state = self.inner.state.lock();
            let record = state
                .messages
                .get_mut(request_id)
                .ok_or_else(|| Error::MessageNotFound(request_id.to_string()))?;
            let request = &mut record.message;
            if !request.is_request() {
                return Err(Error::NotARequest(request_id.to_string()));
            }
            if request.response_id.is_some() {
                return Err(Error::AlreadyResponded(request_id.to_string()));
            }

            let response = Message::new(
                request.to.clone(),
                request.from.clone(),
                MessageType::Response,
                payload,
            )
            .with_priority(request.priority)
            .with_timeout(self.inner.config.message_timeout())
            .in_reply_to(request_id);
            // reserved until the response is queued
            request.response_id = Some(response.id.clone());
            response
        };

        let response_id = response.id.clone();
        if let Err(e) = self.dispatch(response).await {
            self.update(request_id, |m| m.response_id = None);
            return Err(e);
        }
        Ok(response_id)
    }

    /// Send `payload` to every member of `shard_id` except the sender.
    pub async fn broadcast(
        &self,
        from: &str,
        shard_id: &str,
        payload: Value,
        priority: Priority,
    ) -> BroadcastReport {
        let mut report = BroadcastReport {
            shard_id: shard_id.to_string(),
            ..BroadcastReport::default()
        };

        let members = self.inner.registry.agents_by_shard(shard_id);
        for member in members.iter().filter(|a| a.id() != from) {
            let result = self
                .send(
                    from,
                    member.id(),
                    MessageType::Broadcast,
                    payload.clone(),
                    SendOptions::priority(priority),
                )
                .await;
            match result {
                Ok(outcome) => {
                    report.sent += 1;
                    report.message_ids.push(outcome.message_id().to_string());
                }
                Err(e) => {
                    report.failed += 1;
                    report.failures.push((member.id().to_string(), e.to_string()));
                }
            }
        }

        info!(
            from = %from,
            shard_id = %shard_id,
            sent = report.sent,
            failed = report.failed,
            "Broadcast complete"
        );
        report
    }

    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        self.inner
            .state
            .lock()
            .messages
            .get(message_id)
            .map(|r| r.message.clone())
    }

    pub fn queue_len(&self, agent_id: &str) -> usize {
        self.inner.state.lock().queues.len(agent_id)
    }

    /// Ids of requests still waiting for a response.
    pub fn pending_requests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> ProtocolStats {
        let state = self.inner.state.lock();
        let mut by_status: BTreeMap<MessageStatus, usize> =
            MessageStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in state.messages.values() {
            *by_status.entry(record.message.status).or_insert(0) += 1;
        }
        ProtocolStats {
            tracked_messages: state.messages.len(),
            by_status,
            queued: state.queues.total(),
            queue_lengths: state.queues.lengths().into_iter().collect(),
            pending_requests: state.pending.len(),
            rate_limited_senders: state.rate_limiter.tracked_senders(),
        }
    }

    /// Drop messages older than twice their timeout, expired rate-limit windows
    /// and waiters nobody is listening on.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let before = state.messages.len();
        state.messages.retain(|_, r| {
            now.saturating_duration_since(r.created) <= r.message.timeout().saturating_mul(2)
        });
        let messages = before - state.messages.len();

        let before = state.pending.len();
        let tracked = &state.messages;
        state
            .pending
            .retain(|id, waiter| !waiter.is_closed() && tracked.contains_key(id));
        let report = SweepReport {
            messages,
            rate_limits: state.rate_limiter.purge_expired(),
            requests: before - state.pending.len(),
        };
        drop(guard);

        if report != SweepReport::default() {
            debug!(
                messages = report.messages,
                rate_limits = report.rate_limits,
                requests = report.requests,
                "Protocol sweep"
            );
        }
        report
    }

    fn start_gc(&self) {
        let period = self.inner.config.gc_interval();
        let protocol = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = protocol.upgrade() else {
                    break;
                };
                CommunicationProtocol { inner }.sweep();
            }
        });
        if let Some(previous) = self.inner.gc_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Reject every pending request, clear all queues and refuse further sends.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.gc_task.lock().take() {
            handle.abort();
        }

        let (pending, cleared) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let pending: Vec<(String, Waiter)> = state.pending.drain().collect();
            let cleared = state.queues.clear();
            for id in &cleared {
                if let Some(record) = state.messages.get_mut(id) {
                    record.message.mark_failed("protocol shut down");
                }
            }
            (pending, cleared)
        };

        let rejected = pending.len();
        for (_, waiter) in pending {
            let _ = waiter.send(Err(Error::Shutdown));
        }
        info!(
            rejected_requests = rejected,
            cleared_messages = cleared.len(),
            "Communication protocol shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentBehavior, AgentEvent};
    use crate::config::RegistryConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup(config: ProtocolConfig, ids: &[&str]) -> (CommunicationProtocol, Vec<Agent>) {
        crate::logging::init_test();
        let registry = AgentRegistry::new(RegistryConfig::default()).unwrap();
        let mut agents = Vec::new();
        for id in ids {
            let agent = Agent::builder("s1", "worker").id(*id).build().unwrap();
            registry.register(&agent).unwrap();
            agent.spawn().await.unwrap();
            agents.push(agent);
        }
        (CommunicationProtocol::new(registry, config).unwrap(), agents)
    }

    /// Records how many handlers run at once and the payloads in handling order.
    #[derive(Default)]
    struct Tracking {
        active: AtomicUsize,
        peak: AtomicUsize,
        seen: parking_lot::Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl AgentBehavior for Tracking {
        async fn on_message(&self, _agent: &Agent, message: &Message) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().push(message.payload.clone());
            tokio::task::yield_now().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn next_message(events: &mut Subscription<AgentEvent>) -> Message {
        loop {
            if let Some(AgentEvent::Message(message)) = events.recv().await {
                return message;
            }
        }
    }

    fn received(events: &mut Subscription<AgentEvent>) -> Vec<Message> {
        events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_notification_delivery() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        let mut inbox = agents[1].subscribe();
        let mut events = protocol.subscribe();

        let outcome = protocol
            .send("a", "b", MessageType::Notification, json!({"hello": 1}), SendOptions::default())
            .await
            .unwrap();
        let id = outcome.message_id().to_string();
        assert_eq!(protocol.get_message(&id).unwrap().status, MessageStatus::Sent);
        assert_eq!(protocol.queue_len("b"), 1);

        let message = next_message(&mut inbox).await;
        assert_eq!(message.id, id);
        assert_eq!(message.payload["hello"], 1);
        assert_eq!(protocol.get_message(&id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(protocol.queue_len("b"), 0);

        let kinds: Vec<_> = events
            .drain()
            .into_iter()
            .map(|e| match e {
                ProtocolEvent::MessageSent(_) => "sent",
                ProtocolEvent::MessageDelivered(_) => "delivered",
                ProtocolEvent::MessageFailed { .. } => "failed",
            })
            .collect();
        assert_eq!(kinds, vec!["sent", "delivered"]);
    }

    #[tokio::test]
    async fn test_unregistered_parties_rejected() {
        let (protocol, _agents) = setup(ProtocolConfig::default(), &["a"]).await;
        let err = protocol
            .send("a", "ghost", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(id) if id == "ghost"));

        let err = protocol
            .send("ghost", "a", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(id) if id == "ghost"));
        assert_eq!(protocol.stats().tracked_messages, 0);
    }

    #[tokio::test]
    async fn test_request_response_resolves_once() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        let mut inbox = agents[1].subscribe();

        let requester = protocol.clone();
        let call = tokio::spawn(async move {
            requester
                .send(
                    "a",
                    "b",
                    MessageType::Request,
                    json!("ping"),
                    SendOptions::default().with_timeout(Duration::from_secs(5)),
                )
                .await
        });

        let request = next_message(&mut inbox).await;
        assert_eq!(request.message_type, MessageType::Request);
        assert_eq!(protocol.pending_requests(), vec![request.id.clone()]);

        protocol.respond(&request.id, json!("pong")).await.unwrap();
        let again = protocol.respond(&request.id, json!("pong again")).await;
        assert!(matches!(again, Err(Error::AlreadyResponded(_))));

        let response = call.await.unwrap().unwrap().into_response().unwrap();
        assert_eq!(response.payload, json!("pong"));
        assert_eq!(response.in_reply_to.as_deref(), Some(request.id.as_str()));
        assert_eq!(response.from, "b");
        assert_eq!(response.to, "a");
        assert!(protocol.pending_requests().is_empty());

        let stored = protocol.get_message(&request.id).unwrap();
        assert_eq!(stored.response_id.as_deref(), Some(response.id.as_str()));
    }

    #[tokio::test]
    async fn test_respond_validation() {
        let (protocol, _agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        assert!(matches!(
            protocol.respond("missing", json!(null)).await,
            Err(Error::MessageNotFound(_))
        ));

        let outcome = protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            protocol.respond(outcome.message_id(), json!(null)).await,
            Err(Error::NotARequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_expires() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        let mut inbox = agents[1].subscribe();
        let started = Instant::now();

        let err = protocol
            .send(
                "a",
                "b",
                MessageType::Request,
                json!("ping"),
                SendOptions::default().with_timeout(Duration::from_millis(1000)),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(1000));
        let (message_id, timeout_ms) = match err {
            Error::RequestTimeout { message_id, timeout_ms } => (message_id, timeout_ms),
            other => panic!("expected timeout, got {:?}", other),
        };
        assert_eq!(timeout_ms, 1000);
        assert_eq!(protocol.get_message(&message_id).unwrap().status, MessageStatus::Expired);
        assert!(protocol.pending_requests().is_empty());

        // B did receive it; a late answer is accepted but resolves nothing
        assert_eq!(next_message(&mut inbox).await.id, message_id);
        protocol.respond(&message_id, json!("late")).await.unwrap();
        settle().await;
        assert_eq!(protocol.get_message(&message_id).unwrap().status, MessageStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fixed_window() {
        let config = ProtocolConfig {
            rate_limit_per_minute: 3,
            ..ProtocolConfig::default()
        };
        let (protocol, _agents) = setup(config, &["a", "b", "c"]).await;

        for _ in 0..3 {
            protocol
                .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
                .await
                .unwrap();
        }
        let err = protocol
            .send("a", "c", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { limit: 3, .. }));

        // other senders have their own budget
        protocol
            .send("b", "a", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_is_per_recipient() {
        let config = ProtocolConfig {
            max_queue_size: 2,
            ..ProtocolConfig::default()
        };
        let (protocol, _agents) = setup(config, &["a", "b", "c"]).await;
        let send = |to: &'static str| {
            let protocol = protocol.clone();
            async move {
                protocol
                    .send("a", to, MessageType::Notification, json!(null), SendOptions::default())
                    .await
            }
        };

        send("b").await.unwrap();
        send("b").await.unwrap();
        let err = send("b").await.unwrap_err();
        let (agent_id, message_id) = match err {
            Error::QueueFull { agent_id, message_id, .. } => (agent_id, message_id),
            other => panic!("expected queue full, got {:?}", other),
        };
        assert_eq!(agent_id, "b");
        assert_eq!(protocol.get_message(&message_id).unwrap().status, MessageStatus::Failed);

        send("c").await.unwrap();
        assert_eq!(protocol.queue_len("b"), 2);
        assert_eq!(protocol.queue_len("c"), 1);
    }

    #[tokio::test]
    async fn test_delivery_follows_priority() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        let mut inbox = agents[1].subscribe();

        for (label, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("urgent", Priority::Urgent),
            ("normal-2", Priority::Normal),
            ("high", Priority::High),
        ] {
            protocol
                .send("a", "b", MessageType::Notification, json!(label), SendOptions::priority(priority))
                .await
                .unwrap();
        }
        settle().await;

        let order: Vec<Value> = received(&mut inbox).into_iter().map(|m| m.payload).collect();
        assert_eq!(
            order,
            vec![json!("urgent"), json!("high"), json!("normal-1"), json!("normal-2"), json!("low")]
        );
    }

    #[tokio::test]
    async fn test_broadcast_counts() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b", "c", "d"]).await;
        let mut inbox = agents[3].subscribe();

        let report = protocol.broadcast("a", "s1", json!("hello"), Priority::High).await;
        assert_eq!(report.sent, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.message_ids.len(), 3);

        let message = next_message(&mut inbox).await;
        assert_eq!(message.message_type, MessageType::Broadcast);
        assert_eq!(message.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure() {
        let config = ProtocolConfig {
            rate_limit_per_minute: 2,
            ..ProtocolConfig::default()
        };
        let (protocol, _agents) = setup(config, &["a", "b", "c", "d"]).await;

        let report = protocol.broadcast("a", "s1", json!("hello"), Priority::Normal).await;
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total(), 3);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_recipient_deregistered_before_delivery() {
        let (protocol, _agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        let mut events = protocol.subscribe();

        let outcome = protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();
        protocol.registry().deregister("b");
        settle().await;

        let message = protocol.get_message(outcome.message_id()).unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(events
            .drain()
            .iter()
            .any(|e| matches!(e, ProtocolEvent::MessageFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_purges_old_messages_and_windows() {
        let config = ProtocolConfig {
            message_timeout_ms: 1000,
            gc_interval_ms: 500,
            ..ProtocolConfig::default()
        };
        let (protocol, _agents) = setup(config, &["a", "b"]).await;
        let outcome = protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();
        let id = outcome.message_id().to_string();

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(protocol.get_message(&id).is_some());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(protocol.get_message(&id).is_none());
        assert_eq!(protocol.stats().rate_limited_senders, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(protocol.stats().rate_limited_senders, 0);
        assert_eq!(protocol.sweep(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_clears_queues() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b", "c"]).await;
        let mut inbox = agents[1].subscribe();

        let requester = protocol.clone();
        let call = tokio::spawn(async move {
            requester
                .send("a", "b", MessageType::Request, json!("ping"), SendOptions::default())
                .await
        });
        next_message(&mut inbox).await;

        let queued = protocol
            .send("a", "c", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();
        protocol.shutdown();

        assert!(matches!(call.await.unwrap(), Err(Error::Shutdown)));
        assert_eq!(protocol.queue_len("c"), 0);
        assert_eq!(
            protocol.get_message(queued.message_id()).unwrap().status,
            MessageStatus::Failed
        );
        assert!(protocol.is_shut_down());

        let err = protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn test_stats() {
        let (protocol, _agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();

        let stats = protocol.stats();
        assert_eq!(stats.tracked_messages, 1);
        assert_eq!(stats.by_status[&MessageStatus::Sent], 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.queue_lengths["b"], 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        for config in [
            ProtocolConfig {
                max_queue_size: 0,
                ..ProtocolConfig::default()
            },
            ProtocolConfig {
                gc_interval_ms: 0,
                ..ProtocolConfig::default()
            },
        ] {
            let registry = AgentRegistry::new(RegistryConfig::default()).unwrap();
            let result = CommunicationProtocol::new(registry, config);
            assert!(matches!(result, Err(Error::Config(_))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delivery_is_serial_per_recipient() {
        crate::logging::init_test();
        let registry = AgentRegistry::new(RegistryConfig::default()).unwrap();
        let tracking = Arc::new(Tracking::default());
        let sender = Agent::builder("s1", "worker").id("a").build().unwrap();
        let receiver = Agent::builder("s1", "worker")
            .id("b")
            .behavior(tracking.clone())
            .build()
            .unwrap();
        for agent in [&sender, &receiver] {
            registry.register(agent).unwrap();
            agent.spawn().await.unwrap();
        }
        let protocol = CommunicationProtocol::new(registry, ProtocolConfig::default()).unwrap();
        let mut inbox = receiver.subscribe();

        for n in 0..60 {
            protocol
                .send("a", "b", MessageType::Notification, json!(n), SendOptions::default())
                .await
                .unwrap();
            if n % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut order = Vec::new();
        while order.len() < 60 {
            order.push(next_message(&mut inbox).await.payload);
        }
        let expected: Vec<Value> = (0..60).map(|n| json!(n)).collect();
        assert_eq!(order, expected);

        tokio::time::timeout(Duration::from_secs(5), async {
            while tracking.seen.lock().len() < 60 || tracking.active.load(Ordering::SeqCst) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*tracking.seen.lock(), expected);
        assert_eq!(tracking.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_spend_rate_budget() {
        let config = ProtocolConfig {
            rate_limit_per_minute: 3,
            max_queue_size: 2,
            ..ProtocolConfig::default()
        };
        let (protocol, _agents) = setup(config, &["a", "b", "c"]).await;
        for _ in 0..2 {
            protocol
                .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
                .await
                .unwrap();
        }
        let err = protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { .. }));

        // the rejected message left the third slot of the window unused
        protocol
            .send("a", "c", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_is_cleaned_up() {
        let (protocol, _agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;

        let call = protocol.send(
            "a",
            "b",
            MessageType::Request,
            json!("ping"),
            SendOptions::default().with_timeout(Duration::from_millis(1000)),
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());

        assert!(protocol.pending_requests().is_empty());
        let stats = protocol.stats();
        assert_eq!(stats.by_status[&MessageStatus::Expired], 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_closed_waiters() {
        let (protocol, _agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        let (_, waiter) = protocol
            .enqueue(Message::new("a", "b", MessageType::Request, json!(null)))
            .unwrap();
        assert_eq!(protocol.pending_requests().len(), 1);

        drop(waiter);
        let report = protocol.sweep();
        assert_eq!(report.requests, 1);
        assert!(protocol.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_terminated_recipient_is_unknown() {
        let (protocol, agents) = setup(ProtocolConfig::default(), &["a", "b"]).await;
        agents[1].terminate().await.unwrap();

        let err = protocol
            .send("a", "b", MessageType::Notification, json!(null), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(id) if id == "b"));
    }
}
