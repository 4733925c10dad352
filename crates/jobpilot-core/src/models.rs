use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lightweight job-listing summary produced by the scraper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateJob {
    pub name: String,
    pub salary_text: String,
    /// Relative or absolute `/job_detail/<jobId>.html?lid=..&securityId=..` link.
    pub detail_link: String,
}

impl CandidateJob {
    pub fn new(
        name: impl Into<String>,
        salary_text: impl Into<String>,
        detail_link: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            salary_text: salary_text.into(),
            detail_link: detail_link.into(),
        }
    }
}

/// Fields that describe what a listing asks of the candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementFields {
    pub company: String,
    pub title: String,
    pub experience: String,
    pub degree: String,
}

/// Full record fetched from the platform's detail API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// HR activity recency, e.g. "刚刚活跃" or "半年前活跃".
    pub activity_recency_label: String,
    pub description: String,
    pub requirements: RequirementFields,
    /// Recruiter id used as the chat recipient.
    pub internal_recipient_id: String,
    /// Untouched response body, kept for persistence.
    pub raw: serde_json::Value,
}

impl JobDetail {
    /// Plain-text summary handed to the match collaborator.
    pub fn requirement_summary(&self) -> String {
        let r = &self.requirements;
        format!(
            "Company: {}\nTitle: {}\nResponsibilities: {}\nExperience: {}\nDegree: {}",
            r.company.trim(),
            r.title.trim(),
            self.description.trim(),
            r.experience.trim(),
            r.degree.trim(),
        )
    }
}

/// Verdict returned by the match collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub is_match: bool,
    pub rationale: Option<String>,
}

impl MatchDecision {
    pub fn matched(rationale: Option<String>) -> Self {
        Self {
            is_match: true,
            rationale,
        }
    }

    pub fn rejected(rationale: Option<String>) -> Self {
        Self {
            is_match: false,
            rationale,
        }
    }
}

/// An uploaded image on the platform CDN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// A chat message queued for delivery to the messaging backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundMessage {
    Text {
        recipient_id: String,
        body: String,
    },
    Image {
        recipient_id: String,
        security_token: String,
        image_ref: ImageRef,
    },
}

impl OutboundMessage {
    pub fn text(recipient_id: impl Into<String>, body: impl Into<String>) -> Self {
        OutboundMessage::Text {
            recipient_id: recipient_id.into(),
            body: body.into(),
        }
    }

    pub fn recipient_id(&self) -> &str {
        match self {
            OutboundMessage::Text { recipient_id, .. }
            | OutboundMessage::Image { recipient_id, .. } => recipient_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Text { .. } => "text",
            OutboundMessage::Image { .. } => "image",
        }
    }
}

/// Cookie and header state shared by every HTTP caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Bumped on every update; never decreases.
    pub generation: u64,
}

impl Credentials {
    /// Renders the jar as a `Cookie` header value (`a=1; b=2`).
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Account identity resolved before opening the chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: i64,
    /// Session token; the MQTT username is `<token>|0`.
    pub token: String,
}

/// Response of the chat-initiation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStarted {
    pub message: String,
}

/// Why a job was not evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    InvalidLink,
    Inactive { label: String },
}

/// Final state of one job within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Skipped(SkipReason),
    NotMatched,
    Applied,
    Failed { error: String },
    TimedOut,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Skipped(SkipReason::InvalidLink) => write!(f, "skipped, invalid link"),
            JobOutcome::Skipped(SkipReason::Inactive { label }) => {
                write!(f, "skipped, inactive ({label})")
            }
            JobOutcome::NotMatched => write!(f, "not matched"),
            JobOutcome::Applied => write!(f, "applied"),
            JobOutcome::Failed { error } => write!(f, "failed: {error}"),
            JobOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Per-job result handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: Option<String>,
    pub name: String,
    pub outcome: JobOutcome,
    pub is_match: Option<bool>,
    pub rationale: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub evaluated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: Option<String>, name: impl Into<String>, outcome: JobOutcome) -> Self {
        Self {
            job_id,
            name: name.into(),
            outcome,
            is_match: None,
            rationale: None,
            detail: None,
            evaluated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_header_is_sorted_and_joined() {
        let mut creds = Credentials::default();
        creds.cookies.insert("wt2".into(), "abc".into());
        creds.cookies.insert("bst".into(), "xyz".into());
        assert_eq!(creds.cookie_header(), "bst=xyz; wt2=abc");
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut creds = Credentials::default();
        creds.headers.insert("User-Agent".into(), "Mozilla/5.0".into());
        assert_eq!(creds.header("user-agent"), Some("Mozilla/5.0"));
        assert_eq!(creds.header("accept"), None);
    }

    #[test]
    fn test_requirement_summary_lists_fields() {
        let detail = JobDetail {
            activity_recency_label: "刚刚活跃".into(),
            description: "  Build services  ".into(),
            requirements: RequirementFields {
                company: "Acme".into(),
                title: "Rust Engineer".into(),
                experience: "3-5年".into(),
                degree: "本科".into(),
            },
            internal_recipient_id: "boss-1".into(),
            raw: serde_json::json!({}),
        };
        let summary = detail.requirement_summary();
        assert!(summary.contains("Company: Acme"));
        assert!(summary.contains("Responsibilities: Build services\n"));
        assert!(summary.ends_with("Degree: 本科"));
    }

    #[test]
    fn test_outbound_message_serializes_with_kind_tag() {
        let msg = OutboundMessage::text("u1", "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(msg.recipient_id(), "u1");
    }

    #[test]
    fn test_outcome_display() {
        let outcome = JobOutcome::Skipped(SkipReason::Inactive {
            label: "半年前活跃".into(),
        });
        assert_eq!(outcome.to_string(), "skipped, inactive (半年前活跃)");
    }
}
