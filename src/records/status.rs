use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    OnHold,
    Closed,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 3] = [Self::Active, Self::OnHold, Self::Closed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::OnHold => "on_hold",
            Self::Closed => "closed",
        }
    }

    /// `closed` is terminal; active and on_hold move freely between each other.
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        match self {
            Self::Closed => next == Self::Closed,
            Self::Active | Self::OnHold => true,
        }
    }

    pub fn accepts_new_documents(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    InReview,
    Approved,
    Superseded,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        Self::Draft,
        Self::InReview,
        Self::Approved,
        Self::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Superseded => "superseded",
        }
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Draft, InReview) | (InReview, Draft) | (InReview, Approved) | (Approved, Superseded)
        )
    }

    /// Returns `Ok(false)` when `next` is already the current status.
    pub fn check_transition(&self, next: DocumentStatus) -> Result<bool, RecordError> {
        if *self == next {
            return Ok(false);
        }
        if !self.can_transition_to(next) {
            return Err(RecordError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        Ok(true)
    }

    /// New versions may only be appended while the document is still being worked on.
    pub fn accepts_new_versions(&self) -> bool {
        matches!(self, Self::Draft | Self::InReview)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                RecordError::validation(format!(
                    "invalid project status '{value}'. Allowed: active, on_hold, closed"
                ))
            })
    }
}

impl FromStr for DocumentStatus {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                RecordError::validation(format!(
                    "invalid document status '{value}'. Allowed: draft, in_review, approved, superseded"
                ))
            })
    }
}
