//! Notification transport: delivering payloads and reading them back.

use std::sync::Arc;

use async_trait::async_trait;
use jmat_core::NotificationPayload;
use jmat_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const SLACK_SOURCE: &str = "slack";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("decoding slack response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("slack {method} failed: {error}")]
    Api { method: &'static str, error: String },
    #[error("message {ts} not found in channel {channel}")]
    MessageNotFound { channel: String, ts: String },
    #[error("no message source configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: String,
    pub ts: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<DeliveryReceipt, TransportError>;
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn message_text(&self, channel: &str, ts: &str) -> Result<String, TransportError>;

    /// Idempotent: a marker that is already present counts as success.
    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Deserialize)]
struct SlackEnvelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl SlackEnvelope {
    fn decode(method: &'static str, body: &[u8]) -> Result<Self, TransportError> {
        let envelope: Self = serde_json::from_slice(body)?;
        if envelope.ok {
            return Ok(envelope);
        }
        Err(TransportError::Api {
            method,
            error: envelope.error.unwrap_or_else(|| "unknown_error".to_string()),
        })
    }
}

/// Slack Web API client for `chat.postMessage`, `conversations.history`
/// and `reactions.add`.
#[derive(Debug, Clone)]
pub struct SlackTransport {
    http: Arc<HttpFetcher>,
    api_base: String,
    token: String,
    channel: String,
    track_marker: String,
}

impl SlackTransport {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_base: &str,
        token: &str,
        channel: &str,
        track_marker: &str,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            channel: channel.to_string(),
            track_marker: track_marker.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }
}

#[async_trait]
impl Notifier for SlackTransport {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<DeliveryReceipt, TransportError> {
        let body = json!({
            "channel": self.channel,
            "text": payload.render(&self.track_marker),
            "unfurl_links": false,
            "unfurl_media": false,
        });
        // one attempt only: chat.postMessage is not idempotent
        let response = self
            .http
            .post_json_once(
                Uuid::new_v4(),
                SLACK_SOURCE,
                &self.method_url("chat.postMessage"),
                &self.token,
                &body,
            )
            .await?;
        let envelope = SlackEnvelope::decode("chat.postMessage", &response.body)?;
        Ok(DeliveryReceipt {
            channel: envelope.channel.unwrap_or_else(|| self.channel.clone()),
            ts: envelope.ts.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl MessageSource for SlackTransport {
    async fn message_text(&self, channel: &str, ts: &str) -> Result<String, TransportError> {
        let response = self
            .http
            .get_authorized(
                Uuid::new_v4(),
                SLACK_SOURCE,
                &self.method_url("conversations.history"),
                &self.token,
                &[
                    ("channel", channel),
                    ("latest", ts),
                    ("inclusive", "true"),
                    ("limit", "1"),
                ],
            )
            .await?;
        let envelope = SlackEnvelope::decode("conversations.history", &response.body)?;
        envelope
            .messages
            .into_iter()
            .find(|m| m.ts.as_deref().map_or(true, |found| found == ts))
            .and_then(|m| m.text)
            .ok_or_else(|| TransportError::MessageNotFound {
                channel: channel.to_string(),
                ts: ts.to_string(),
            })
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), TransportError> {
        let body = json!({ "channel": channel, "timestamp": ts, "name": name });
        let response = self
            .http
            .post_json(
                Uuid::new_v4(),
                SLACK_SOURCE,
                &self.method_url("reactions.add"),
                &self.token,
                &body,
            )
            .await?;
        match SlackEnvelope::decode("reactions.add", &response.body) {
            Ok(_) => Ok(()),
            Err(TransportError::Api { error, .. }) if error == "already_reacted" => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Dry-run transport used when no bot token is configured: notifications
/// are only logged and message lookups report [`TransportError::NotConfigured`].
#[derive(Debug, Clone)]
pub struct LogNotifier {
    track_marker: String,
}

impl LogNotifier {
    pub fn new(track_marker: &str) -> Self {
        Self {
            track_marker: track_marker.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, payload: &NotificationPayload) -> Result<DeliveryReceipt, TransportError> {
        info!(
            company = %payload.company,
            title = %payload.title,
            score = payload.score,
            profile = %payload.profile,
            url = %payload.url,
            "dry-run notification"
        );
        tracing::debug!(text = %payload.render(&self.track_marker), "dry-run notification text");
        Ok(DeliveryReceipt {
            channel: "dry-run".to_string(),
            ts: String::new(),
        })
    }
}

#[async_trait]
impl MessageSource for LogNotifier {
    async fn message_text(&self, _channel: &str, _ts: &str) -> Result<String, TransportError> {
        Err(TransportError::NotConfigured)
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), TransportError> {
        info!(channel, ts, name, "dry-run confirmation reaction");
        Ok(())
    }
}
