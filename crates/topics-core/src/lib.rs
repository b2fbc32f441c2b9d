//! Core domain model for topic requests and their canonical approvals.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "topics-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("invalid phase selector: {0:?}")]
    InvalidPhase(String),
    #[error("invalid approval status: {0:?}")]
    InvalidStatus(String),
}

/// Positive program phase identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct PhaseId(i32);

impl PhaseId {
    pub fn new(value: i32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    /// Parses a display selector such as `"Phase 7"` (or a bare `"7"`).
    pub fn parse_selector(selector: &str) -> Result<Self, CoreError> {
        let trimmed = selector.trim();
        let digits = match trimmed.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("phase") => trimmed[5..].trim_start(),
            _ => trimmed,
        };
        digits
            .parse::<i32>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| CoreError::InvalidPhase(selector.to_string()))
    }

    pub fn selector(self) -> String {
        format!("Phase {}", self.0)
    }
}

impl TryFrom<i32> for PhaseId {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| CoreError::InvalidPhase(value.to_string()))
    }
}

impl From<PhaseId> for i32 {
    fn from(phase: PhaseId) -> Self {
        phase.0
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ApprovalStatus {
    #[default]
    #[serde(rename = "On Hold")]
    OnHold,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnHold => "On Hold",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "On Hold" => Ok(Self::OnHold),
            "Approved" => Ok(Self::Approved),
            "Rejected" => Ok(Self::Rejected),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw submission payload as received from the intake surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubmission {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub phase: Option<i32>,
}

impl TopicSubmission {
    /// Checks required fields and trims text. All missing fields are reported at once.
    pub fn validate(self) -> Result<NewTopicRequest, CoreError> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("email", &self.email),
            ("domain", &self.domain),
            ("topic", &self.topic),
            ("reason", &self.reason),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        let phase = self.phase.and_then(PhaseId::new);
        if phase.is_none() {
            missing.push("phase");
        }
        let Some(phase) = phase.filter(|_| missing.is_empty()) else {
            return Err(CoreError::MissingFields(missing));
        };

        Ok(NewTopicRequest {
            email: self.email.trim().to_string(),
            domain: self.domain.trim().to_string(),
            topic: self.topic.trim().to_string(),
            reason: self.reason.trim().to_string(),
            phase,
        })
    }
}

/// Validated request ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTopicRequest {
    pub email: String,
    pub domain: String,
    pub topic: String,
    pub reason: String,
    pub phase: PhaseId,
}

/// One student's persisted topic request. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRequest {
    pub id: Uuid,
    /// Insertion order within the store; defines submission order.
    pub seq: i64,
    pub email: String,
    pub domain: String,
    pub phase: PhaseId,
    pub topic: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Candidate approval row produced by clustering, before the store assigns ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTopicApproval {
    pub phase: PhaseId,
    pub domain: String,
    pub topic: String,
    pub total_requested: i32,
    pub approval: ApprovalStatus,
}

/// Canonical de-duplicated topic within a (domain, phase) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicApproval {
    pub id: Uuid,
    pub phase: PhaseId,
    pub domain: String,
    pub topic: String,
    pub total_requested: i32,
    pub approval: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TopicApproval {
    pub fn bucket_key(&self) -> (PhaseId, &str, &str) {
        (self.phase, self.domain.as_str(), self.topic.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_selector_accepts_display_and_bare_forms() {
        assert_eq!(PhaseId::parse_selector("Phase 7").unwrap().get(), 7);
        assert_eq!(PhaseId::parse_selector("  phase   12 ").unwrap().get(), 12);
        assert_eq!(PhaseId::parse_selector("3").unwrap().get(), 3);
        assert_eq!(PhaseId::new(5).unwrap().selector(), "Phase 5");
    }

    #[test]
    fn phase_selector_rejects_garbage_and_non_positive() {
        for input in ["", "Phase", "Phase x", "Phase 0", "-2", "Phasing 4"] {
            assert!(
                matches!(PhaseId::parse_selector(input), Err(CoreError::InvalidPhase(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn approval_status_uses_display_strings_on_the_wire() {
        let json = serde_json::to_string(&ApprovalStatus::OnHold).unwrap();
        assert_eq!(json, "\"On Hold\"");
        let parsed: ApprovalStatus = serde_json::from_str("\"Approved\"").unwrap();
        assert_eq!(parsed, ApprovalStatus::Approved);
        assert_eq!("Rejected".parse::<ApprovalStatus>().unwrap(), ApprovalStatus::Rejected);
        assert!("approved".parse::<ApprovalStatus>().is_err());
    }

    #[test]
    fn submission_validation_reports_every_missing_field() {
        let err = TopicSubmission {
            email: "a@b.edu".into(),
            domain: "  ".into(),
            topic: String::new(),
            reason: "curious".into(),
            phase: Some(0),
        }
        .validate()
        .unwrap_err();
        assert_eq!(err, CoreError::MissingFields(vec!["domain", "topic", "phase"]));
    }

    #[test]
    fn submission_validation_trims_fields() {
        let req = TopicSubmission {
            email: " a@b.edu ".into(),
            domain: " AI ".into(),
            topic: "  NLP intro ".into(),
            reason: " want it ".into(),
            phase: Some(5),
        }
        .validate()
        .unwrap();
        assert_eq!(req.domain, "AI");
        assert_eq!(req.topic, "NLP intro");
        assert_eq!(req.phase.get(), 5);
    }

    #[test]
    fn phase_id_deserialization_rejects_non_positive() {
        assert!(serde_json::from_str::<PhaseId>("0").is_err());
        assert_eq!(serde_json::from_str::<PhaseId>("4").unwrap().get(), 4);
    }
}
