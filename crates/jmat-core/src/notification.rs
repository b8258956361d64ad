//! Notification schema shared by the formatter and the acknowledgment parser.
//!
//! A rendered notification is a header line followed by one labeled line per
//! [`NotificationField`], in [`NotificationField::ORDER`]. Each label is a
//! distinct `*Label:*` token at the start of its line and the value is the
//! rest of that line.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{JobPosting, JobReference, MatchOutcome, NO_PROFILE};

pub const NOTIFICATION_FORMAT_VERSION: &str = "jmat/v1";
pub const DEFAULT_MAX_CONCEPTS: usize = 5;
/// Rendered in the concepts line when nothing matched.
pub const NO_CONCEPTS: &str = "none";
const UNSPECIFIED_LOCATION: &str = "Not specified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationField {
    Title,
    Company,
    Location,
    Source,
    Score,
    Profile,
    Concepts,
    Url,
    Format,
}

impl NotificationField {
    pub const ORDER: [NotificationField; 9] = [
        NotificationField::Title,
        NotificationField::Company,
        NotificationField::Location,
        NotificationField::Source,
        NotificationField::Score,
        NotificationField::Profile,
        NotificationField::Concepts,
        NotificationField::Url,
        NotificationField::Format,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Title => "Title",
            Self::Company => "Company",
            Self::Location => "Location",
            Self::Source => "Source",
            Self::Score => "Match Score",
            Self::Profile => "Recommended Profile",
            Self::Concepts => "Matched Concepts",
            Self::Url => "Apply",
            Self::Format => "Format",
        }
    }

    /// Labels used by notifications rendered before the format line existed.
    fn legacy_labels(self) -> &'static [&'static str] {
        match self {
            Self::Profile => &["Recommended Resume"],
            Self::Concepts => &["Matched Keywords"],
            Self::Url => &["Apply Now"],
            _ => &[],
        }
    }

    fn value_in<'a>(self, line: &'a str) -> Option<&'a str> {
        std::iter::once(self.label())
            .chain(self.legacy_labels().iter().copied())
            .find_map(|label| {
                line.strip_prefix('*')?
                    .strip_prefix(label)?
                    .strip_prefix(":*")
                    .map(str::trim)
            })
    }
}

impl fmt::Display for NotificationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("notification is missing the {0} field")]
    MissingField(NotificationField),
    #[error("notification score {0:?} is not a percentage")]
    InvalidScore(String),
    #[error("unsupported notification format {0:?}")]
    UnsupportedVersion(String),
}

/// Everything a delivered notification carries about one matched job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub company: String,
    pub location: String,
    pub source: String,
    pub score: u32,
    pub profile: String,
    pub concepts: Vec<String>,
    pub url: String,
}

impl NotificationPayload {
    pub fn from_outcome(posting: &JobPosting, outcome: &MatchOutcome, max_concepts: usize) -> Self {
        Self {
            title: posting.title.trim().to_string(),
            company: posting.company.trim().to_string(),
            location: non_empty_or(&posting.location, UNSPECIFIED_LOCATION),
            source: posting.source.clone(),
            score: outcome.score,
            profile: outcome.profile_label().to_string(),
            concepts: outcome
                .matched_clusters
                .iter()
                .take(max_concepts)
                .cloned()
                .collect(),
            url: posting.url.trim().to_string(),
        }
    }

    pub fn render(&self, track_marker: &str) -> String {
        let concepts = if self.concepts.is_empty() {
            NO_CONCEPTS.to_string()
        } else {
            self.concepts.join(", ")
        };
        let mut lines = vec![format!(":dart: *New Job Match – {}% Match*", self.score)];
        for field in NotificationField::ORDER {
            let value = match field {
                NotificationField::Title => escape(&self.title),
                NotificationField::Company => escape(&self.company),
                NotificationField::Location => escape(&self.location),
                NotificationField::Source => escape(&self.source),
                NotificationField::Score => format!("{}%", self.score),
                NotificationField::Profile => escape(&self.profile),
                NotificationField::Concepts => escape(&concepts),
                NotificationField::Url => format!("<{}>", escape(&self.url)),
                NotificationField::Format => NOTIFICATION_FORMAT_VERSION.to_string(),
            };
            lines.push(format!("*{}:* {}", field.label(), value));
        }
        lines.push(format!(
            "React with :{}: after applying to track it.",
            bare_marker(track_marker)
        ));
        lines.join("\n")
    }
}

/// Reconstruct the job identity from rendered notification text.
pub fn parse_notification(text: &str) -> Result<JobReference, ExtractError> {
    let mut values: Vec<(NotificationField, &str)> = Vec::new();
    let mut header_score = None;
    for raw_line in text.lines() {
        let line = raw_line.trim_start_matches(|c: char| !c.is_alphanumeric() && c != '*');
        if header_score.is_none() {
            header_score = header_score_in(line);
        }
        for field in NotificationField::ORDER {
            if values.iter().any(|(seen, _)| *seen == field) {
                continue;
            }
            if let Some(value) = field.value_in(line) {
                values.push((field, value));
                break;
            }
        }
    }
    let value = |field: NotificationField| {
        values
            .iter()
            .find(|(seen, _)| *seen == field)
            .map(|(_, v)| *v)
            .filter(|v| !v.is_empty())
    };

    if let Some(version) = value(NotificationField::Format) {
        if version != NOTIFICATION_FORMAT_VERSION {
            return Err(ExtractError::UnsupportedVersion(version.to_string()));
        }
    }

    let title = value(NotificationField::Title)
        .map(unescape)
        .ok_or(ExtractError::MissingField(NotificationField::Title))?;
    let company = value(NotificationField::Company)
        .map(unescape)
        .ok_or(ExtractError::MissingField(NotificationField::Company))?;
    let score = value(NotificationField::Score)
        .or(header_score)
        .ok_or(ExtractError::MissingField(NotificationField::Score))
        .and_then(parse_score)?;
    let url = value(NotificationField::Url)
        .map(link_target)
        .filter(|url| !url.is_empty())
        .ok_or(ExtractError::MissingField(NotificationField::Url))?;

    Ok(JobReference {
        url,
        title,
        company,
        location: value(NotificationField::Location)
            .map(unescape)
            .filter(|l| l != UNSPECIFIED_LOCATION),
        profile: value(NotificationField::Profile)
            .map(unescape)
            .filter(|p| p != NO_PROFILE),
        score,
        concepts: value(NotificationField::Concepts)
            .map(unescape)
            .filter(|c| c != NO_CONCEPTS),
    })
}

/// A reaction placed on a delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgmentEvent {
    pub reaction: String,
    pub actor: String,
    pub channel: String,
    pub message_ts: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IgnoreReason {
    #[error("reaction {0:?} is not the tracking marker")]
    WrongMarker(String),
    #[error("channel {0:?} is not the notification channel")]
    WrongChannel(String),
    #[error("original message text is unavailable")]
    MessageUnavailable,
    #[error("no job reference extracted: {0}")]
    Unparseable(#[from] ExtractError),
}

/// Screens acknowledgment events and extracts the referenced job.
#[derive(Debug, Clone)]
pub struct ReactionEventParser {
    track_marker: String,
    channel: String,
}

impl ReactionEventParser {
    pub fn new(track_marker: &str, channel: &str) -> Self {
        Self {
            track_marker: bare_marker(track_marker).to_string(),
            channel: channel.trim().to_string(),
        }
    }

    pub fn track_marker(&self) -> &str {
        &self.track_marker
    }

    /// Marker and channel checks, evaluated before any text is parsed.
    pub fn screen(&self, event: &AcknowledgmentEvent) -> Result<(), IgnoreReason> {
        if bare_marker(&event.reaction) != self.track_marker {
            return Err(IgnoreReason::WrongMarker(event.reaction.clone()));
        }
        if event.channel != self.channel {
            return Err(IgnoreReason::WrongChannel(event.channel.clone()));
        }
        Ok(())
    }

    pub fn extract(
        &self,
        event: &AcknowledgmentEvent,
        text: &str,
    ) -> Result<JobReference, IgnoreReason> {
        self.screen(event)?;
        Ok(parse_notification(text)?)
    }
}

fn bare_marker(marker: &str) -> &str {
    marker.trim().trim_matches(':')
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn escape(value: &str) -> String {
    value
        .replace(['\r', '\n'], " ")
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// `<https://x|label>` and `<https://x>` both yield `https://x`.
fn link_target(value: &str) -> String {
    let inner = match value.strip_prefix('<') {
        Some(rest) => rest.split('>').next().unwrap_or(rest),
        None => value,
    };
    let target = inner.split('|').next().unwrap_or(inner);
    unescape(target.trim())
}

fn header_score_in(line: &str) -> Option<&str> {
    let rest = line.split_once("New Job Match")?.1;
    let rest = rest.trim_start_matches(|c: char| !c.is_ascii_digit());
    let (score, _) = rest.split_once('%')?;
    Some(score)
}

fn parse_score(raw: &str) -> Result<u32, ExtractError> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && (0.0..=100.0).contains(&value) => {
            Ok(value.round() as u32)
        }
        _ => Err(ExtractError::InvalidScore(raw.to_string())),
    }
}
