//! Inbound events server: Slack reaction acknowledgments and health.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jmat_core::{parse_notification, AcknowledgmentEvent, IgnoreReason, ReactionEventParser};
use jmat_storage::{ApplicationLedger, LedgerReader, RecordOutcome};
use jmat_sync::MessageSource;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "jmat-web";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Tracked { created: bool },
    Ignored(IgnoreReason),
    Failed(String),
}

impl AckOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tracked { created: true } => "tracked",
            Self::Tracked { created: false } => "already_tracked",
            Self::Ignored(_) => "ignored",
            Self::Failed(_) => "failed",
        }
    }
}

/// Turns an acknowledgment into at most one application record, and places
/// the confirmation marker only when this call created it.
pub struct AcknowledgmentHandler {
    parser: ReactionEventParser,
    messages: Arc<dyn MessageSource>,
    ledger: Arc<ApplicationLedger>,
    confirm_marker: String,
}

impl AcknowledgmentHandler {
    pub fn new(
        parser: ReactionEventParser,
        messages: Arc<dyn MessageSource>,
        ledger: Arc<ApplicationLedger>,
        confirm_marker: &str,
    ) -> Self {
        Self {
            parser,
            messages,
            ledger,
            confirm_marker: confirm_marker.trim_matches(':').to_string(),
        }
    }

    pub async fn handle(&self, event: &AcknowledgmentEvent) -> AckOutcome {
        if let Err(reason) = self.parser.screen(event) {
            debug!(reaction = %event.reaction, channel = %event.channel, %reason, "acknowledgment ignored");
            return AckOutcome::Ignored(reason);
        }

        let text = match &event.text {
            Some(text) => text.clone(),
            None => match self.messages.message_text(&event.channel, &event.message_ts).await {
                Ok(text) => text,
                Err(err) => {
                    warn!(channel = %event.channel, ts = %event.message_ts, error = %err, "cannot read acknowledged message");
                    return AckOutcome::Ignored(IgnoreReason::MessageUnavailable);
                }
            },
        };

        let reference = match parse_notification(&text) {
            Ok(reference) => reference,
            Err(err) => {
                info!(ts = %event.message_ts, error = %err, "no job reference extracted");
                return AckOutcome::Ignored(IgnoreReason::Unparseable(err));
            }
        };

        let note = format!("tracked via :{}: reaction", self.parser.track_marker());
        match self
            .ledger
            .record_if_absent(&reference, &event.actor, Utc::now(), &note)
            .await
        {
            Ok(RecordOutcome::Created) => {
                if let Err(err) = self
                    .messages
                    .add_reaction(&event.channel, &event.message_ts, &self.confirm_marker)
                    .await
                {
                    warn!(url = %reference.url, error = %err, "confirmation reaction failed");
                }
                AckOutcome::Tracked { created: true }
            }
            Ok(RecordOutcome::AlreadyPresent) => AckOutcome::Tracked { created: false },
            Err(err) => {
                error!(url = %reference.url, error = %err, "recording application failed");
                AckOutcome::Failed(err.to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub acknowledgments: Arc<AcknowledgmentHandler>,
    pub seen: LedgerReader,
}

impl AppState {
    pub fn new(acknowledgments: Arc<AcknowledgmentHandler>, seen: LedgerReader) -> Self {
        Self {
            acknowledgments,
            seen,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackEnvelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ReactionAdded {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    user: String,
    reaction: String,
    item: ReactionItem,
}

#[derive(Debug, Deserialize)]
struct ReactionItem {
    channel: String,
    ts: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/slack/events", post(slack_events_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(bind: SocketAddr, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding events server to {bind}"))?;
    info!(%bind, "events server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("events server")?;
    Ok(())
}

async fn slack_events_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}")).into_response()
        }
    };

    // well-formed JSON is always acknowledged with 200 so upstream does not replay it
    let envelope = match serde_json::from_value::<SlackEnvelope>(value) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(error = %err, "unrecognized event envelope");
            return Json(json!({ "ok": true, "outcome": "ignored" })).into_response();
        }
    };

    match envelope {
        SlackEnvelope::UrlVerification { challenge } => {
            Json(json!({ "challenge": challenge })).into_response()
        }
        SlackEnvelope::EventCallback { event } => {
            let outcome = match serde_json::from_value::<ReactionAdded>(event) {
                Ok(reaction) if reaction.kind == "reaction_added" => {
                    let event = AcknowledgmentEvent {
                        reaction: reaction.reaction,
                        actor: reaction.user,
                        channel: reaction.item.channel,
                        message_ts: reaction.item.ts,
                        text: None,
                    };
                    state.acknowledgments.handle(&event).await.label()
                }
                _ => "ignored",
            };
            Json(json!({ "ok": true, "outcome": outcome })).into_response()
        }
        SlackEnvelope::Other => Json(json!({ "ok": true, "outcome": "ignored" })).into_response(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.seen.len().await {
        Ok(seen_jobs) => Json(json!({
            "status": "ok",
            "seen_jobs": seen_jobs,
            "service": "jmat",
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "dedup ledger unreadable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "error": err.to_string(),
                    "service": "jmat",
                })),
            )
                .into_response()
        }
    }
}
