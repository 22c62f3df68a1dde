//! HTTP gateway implementations of the channel and responder traits.
//!
//! Each provider is a JSON-over-HTTP endpoint: the deployment points Recall
//! at an SMS gateway, a voice dialer, an email relay, and an AI responder
//! service. All calls carry a bounded timeout; timeouts and 5xx map to
//! transient errors, other 4xx to permanent ones.

use std::time::Duration;

use async_trait::async_trait;
use recall_core::entry::OutreachMethod;
use serde::Deserialize;

use crate::channels::{
  AiReply, AiResponder, ChannelError, ChannelReceipt, ConversationContext, OutboundMessage,
  OutreachChannel,
};

// Transport-level failures are retryable; permanence is decided from the
// gateway's status codes.
fn classify(err: reqwest::Error) -> ChannelError {
  ChannelError::Transient(err.to_string())
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> ChannelError {
  if status.is_server_error()
    || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    || status == reqwest::StatusCode::REQUEST_TIMEOUT
  {
    ChannelError::Transient(format!("{status}: {body}"))
  } else {
    ChannelError::Permanent(format!("{status}: {body}"))
  }
}

// ─── Channel gateway ─────────────────────────────────────────────────────────

/// A channel backed by an HTTP gateway endpoint.
pub struct HttpChannel {
  method: OutreachMethod,
  client: reqwest::Client,
  url:    String,
}

impl HttpChannel {
  pub fn new(method: OutreachMethod, url: impl Into<String>, timeout: Duration) -> Self {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .unwrap_or_default();
    Self { method, client, url: url.into() }
  }
}

#[async_trait]
impl OutreachChannel for HttpChannel {
  fn method(&self) -> OutreachMethod {
    self.method
  }

  async fn send(&self, message: &OutboundMessage) -> Result<ChannelReceipt, ChannelError> {
    let response = self
      .client
      .post(&self.url)
      .json(message)
      .send()
      .await
      .map_err(classify)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body));
    }

    response
      .json::<ChannelReceipt>()
      .await
      .map_err(|e| ChannelError::Transient(format!("bad gateway response: {e}")))
  }
}

// ─── AI responder gateway ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AiResponse {
  intent:          String,
  confidence:      f64,
  #[serde(default)]
  suggested_reply: Option<String>,
}

/// The conversational AI service, spoken to over HTTP.
pub struct HttpAiResponder {
  client: reqwest::Client,
  url:    String,
}

impl HttpAiResponder {
  pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .unwrap_or_default();
    Self { client, url: url.into() }
  }
}

#[async_trait]
impl AiResponder for HttpAiResponder {
  async fn respond(&self, context: &ConversationContext) -> Result<AiReply, ChannelError> {
    let response = self
      .client
      .post(&self.url)
      .json(context)
      .send()
      .await
      .map_err(classify)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status, &body));
    }

    let parsed: AiResponse = response
      .json()
      .await
      .map_err(|e| ChannelError::Transient(format!("bad responder payload: {e}")))?;

    Ok(AiReply {
      intent:          parsed.intent,
      confidence:      parsed.confidence,
      suggested_reply: parsed.suggested_reply,
    })
  }
}
