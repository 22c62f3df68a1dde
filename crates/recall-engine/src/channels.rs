//! Channel and AI-responder traits — the seams to the rate-limited, fallible
//! external dependencies outreach goes through.
//!
//! The traits are dyn-safe (`async_trait`) because the channel for an attempt
//! is chosen at runtime from the tenant's plan.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use recall_core::entry::OutreachMethod;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// A channel-level send failure, classified by whether retrying can help.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
  /// Likely to resolve itself (timeout, 5xx, rate limit). Retried through
  /// the dead-letter path, never against the customer's retry budget.
  #[error("transient channel error: {0}")]
  Transient(String),

  /// Will never succeed (invalid number, unroutable address). Fails the
  /// entry immediately.
  #[error("permanent channel error: {0}")]
  Permanent(String),
}

/// What the provider reported back for a delivered message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelReceipt {
  /// The customer actively engaged (answered the call, replied in-session).
  pub engaged:  bool,
  /// Verbatim customer response, when the channel captures one.
  pub response: Option<String>,
}

// ─── Outbound message ────────────────────────────────────────────────────────

/// One message handed to a channel for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
  pub tenant_id: String,
  pub entry_id:  Uuid,
  /// E.164 destination.
  pub to:        String,
  pub body:      String,
}

// ─── Channel trait ───────────────────────────────────────────────────────────

/// A rate-limited, fallible outreach transport (SMS gateway, voice dialer,
/// email relay).
#[async_trait]
pub trait OutreachChannel: Send + Sync {
  fn method(&self) -> OutreachMethod;

  async fn send(&self, message: &OutboundMessage) -> Result<ChannelReceipt, ChannelError>;
}

/// The configured channels, keyed by method.
#[derive(Clone, Default)]
pub struct ChannelSet {
  channels: HashMap<OutreachMethod, Arc<dyn OutreachChannel>>,
}

impl ChannelSet {
  pub fn new() -> Self {
    Self { channels: HashMap::new() }
  }

  pub fn with(mut self, channel: Arc<dyn OutreachChannel>) -> Self {
    self.channels.insert(channel.method(), channel);
    self
  }

  pub fn get(&self, method: OutreachMethod) -> Result<&Arc<dyn OutreachChannel>> {
    self.channels.get(&method).ok_or(Error::ChannelMissing(method))
  }
}

// ─── AI responder ────────────────────────────────────────────────────────────

/// Conversation context handed to the AI responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
  pub tenant_id:      String,
  pub customer_phone: String,
  pub call_reference: String,
  pub attempt_count:  u32,
  /// Messages already sent to this customer, oldest first.
  pub prior_messages: Vec<String>,
}

/// The responder's classification of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiReply {
  pub intent:          String,
  /// 0.0 ..= 1.0; compared against the tenant's confidence threshold.
  pub confidence:      f64,
  pub suggested_reply: Option<String>,
}

/// A fallible, higher-latency external dependency that drafts replies.
#[async_trait]
pub trait AiResponder: Send + Sync {
  async fn respond(&self, context: &ConversationContext) -> Result<AiReply, ChannelError>;
}
