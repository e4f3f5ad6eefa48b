//! Message types for the agent communication protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request expecting a response
    Request,
    /// Response to a request
    Response,
    /// Status update / notification
    Notification,
    /// Fan-out to every member of a shard
    Broadcast,
}

/// Message priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// Message delivery status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created, not yet queued
    Pending,
    /// Queued for the recipient
    Sent,
    /// Handed to the recipient
    Delivered,
    /// Could not be queued or delivered
    Failed,
    /// Request timed out waiting for a response
    Expired,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Failed,
        MessageStatus::Expired,
    ];
}

/// A message routed between two registered agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (ULID)
    pub id: String,
    /// Sender agent ID
    pub from: String,
    /// Recipient agent ID
    pub to: String,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: MessageStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    pub timeout_ms: u64,
    /// Originating request (responses only)
    pub in_reply_to: Option<String>,
    /// Response sent for this request, once answered
    pub response_id: Option<String>,
    /// Failure reason if status is Failed or Expired
    pub error: Option<String>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            from: from.into(),
            to: to.into(),
            message_type,
            payload,
            priority: Priority::Normal,
            status: MessageStatus::Pending,
            created_at: now,
            updated_at: now,
            timeout_ms: 0,
            in_reply_to: None,
            response_id: None,
            error: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Correlate with the request this answers.
    pub fn in_reply_to(mut self, request_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(request_id.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }

    pub fn mark_sent(&mut self) {
        self.set_status(MessageStatus::Sent);
    }

    pub fn mark_delivered(&mut self) {
        self.set_status(MessageStatus::Delivered);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.set_status(MessageStatus::Failed);
        self.error = Some(error.into());
    }

    pub fn mark_expired(&mut self) {
        self.set_status(MessageStatus::Expired);
        self.error = Some("request timed out".to_string());
    }

    fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Per-call options for `send`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub priority: Priority,
    /// Falls back to the protocol's configured message timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a successful `send` produced.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// Non-request message accepted for delivery.
    Queued(String),
    /// The response that answered a request.
    Response(Message),
}

impl SendOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            SendOutcome::Queued(id) => id,
            SendOutcome::Response(message) => &message.id,
        }
    }

    pub fn into_response(self) -> Option<Message> {
        match self {
            SendOutcome::Response(message) => Some(message),
            SendOutcome::Queued(_) => None,
        }
    }
}

/// Aggregate result of a shard broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub shard_id: String,
    pub sent: usize,
    pub failed: usize,
    pub message_ids: Vec<String>,
    /// (recipient id, reason) per failed send
    pub failures: Vec<(String, String)>,
}

impl BroadcastReport {
    pub fn total(&self) -> usize {
        self.sent + self.failed
    }
}
