//! Core domain model, concept scoring and notification schema for JMAT.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod notification;
pub mod role;
pub mod scoring;
pub mod taxonomy;

pub use notification::{
    parse_notification, AcknowledgmentEvent, ExtractError, IgnoreReason, NotificationField,
    NotificationPayload, ReactionEventParser, DEFAULT_MAX_CONCEPTS, NOTIFICATION_FORMAT_VERSION,
    NO_CONCEPTS,
};
pub use role::{RoleFilter, RoleFilterConfig, RoleFilterError};
pub use scoring::{
    normalize_text, ConceptScoreboard, ConceptScorer, ProfileRecommender, Recommendation,
    DEFAULT_SATURATION_HITS,
};
pub use taxonomy::{ConceptEntry, ConceptTaxonomy, TaxonomyError};

pub const CRATE_NAME: &str = "jmat-core";

/// Sentinel rendered when no profile collected a single concept hit.
pub const NO_PROFILE: &str = "none";

/// Source-qualified job identifier, rendered as `<source>:<native_id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(source: &str, native_id: &str) -> Self {
        Self(format!("{}:{}", source.trim(), native_id.trim()))
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One fetched posting, owned by the pipeline for a single scoring pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: JobId,
    pub title: String,
    pub description: String,
    pub company: String,
    pub location: String,
    pub department: String,
    pub url: String,
    pub source: String,
}

impl JobPosting {
    /// Title and description joined the way the scorer consumes them.
    pub fn scoring_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }

    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty() && self.description.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    FilteredOut,
    Suppressed,
    NotifyEligible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub job_id: JobId,
    pub recommended_profile: Option<String>,
    pub raw_hits: u32,
    pub score: u32,
    pub matched_clusters: Vec<String>,
    pub decision: MatchDecision,
}

impl MatchOutcome {
    pub fn filtered_out(job_id: JobId) -> Self {
        Self {
            job_id,
            recommended_profile: None,
            raw_hits: 0,
            score: 0,
            matched_clusters: Vec::new(),
            decision: MatchDecision::FilteredOut,
        }
    }

    pub fn from_recommendation(job_id: JobId, rec: Recommendation, threshold: u32) -> Self {
        let decision = if rec.score >= threshold {
            MatchDecision::NotifyEligible
        } else {
            MatchDecision::Suppressed
        };
        Self {
            job_id,
            recommended_profile: rec.profile,
            raw_hits: rec.raw_hits,
            score: rec.score,
            matched_clusters: rec.matched_clusters,
            decision,
        }
    }

    pub fn profile_label(&self) -> &str {
        self.recommended_profile.as_deref().unwrap_or(NO_PROFILE)
    }

    pub fn is_notify_eligible(&self) -> bool {
        self.decision == MatchDecision::NotifyEligible
    }
}

/// Job identity reconstructed from a delivered notification, keyed by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReference {
    pub url: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub profile: Option<String>,
    pub score: u32,
    pub concepts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub job_url: String,
    pub actor: String,
    pub logged_at: DateTime<Utc>,
    pub score: u32,
    pub profile: String,
    pub note: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub concepts: String,
    pub source: String,
    pub status: String,
}

impl ApplicationRecord {
    pub fn from_reference(
        reference: &JobReference,
        actor: &str,
        logged_at: DateTime<Utc>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            job_url: reference.url.clone(),
            actor: actor.to_string(),
            logged_at,
            score: reference.score,
            profile: reference
                .profile
                .clone()
                .unwrap_or_else(|| NO_PROFILE.to_string()),
            note: note.into(),
            title: reference.title.clone(),
            company: reference.company.clone(),
            location: reference
                .location
                .clone()
                .unwrap_or_else(|| "Not specified".to_string()),
            concepts: reference.concepts.clone().unwrap_or_default(),
            source: source_from_url(&reference.url).to_string(),
            status: "applied".to_string(),
        }
    }
}

pub fn source_from_url(url: &str) -> &'static str {
    let lower = url.to_ascii_lowercase();
    if lower.contains("lever.co") {
        "lever"
    } else if lower.contains("greenhouse.io") {
        "greenhouse"
    } else {
        "unknown"
    }
}
