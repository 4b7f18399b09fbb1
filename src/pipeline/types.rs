//! Shared types for the scan pipeline.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Staged message ──────────────────────────────────────────────────

/// A message claimed from staging, with headers extracted for classification.
///
/// Header fields hold the raw (unsanitized) header text; the classifier
/// cleans them when it builds the request.
#[derive(Debug, Clone)]
pub struct StagedMessage {
    /// Opaque id: the staging file stem (arrival time + randomness).
    pub id: String,
    /// Claimed artifact path (`<id>.processing`).
    pub path: PathBuf,
    /// Full message bytes as staged.
    pub raw: Vec<u8>,
    pub headers: MessageHeaders,
}

/// Header fields and body preview the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub from: String,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    /// Start of the text body.
    pub body_preview: String,
    /// Bare address from the To header, if one parsed.
    pub to_address: Option<String>,
}

// ── Verdict ─────────────────────────────────────────────────────────

/// Binary classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictKind {
    Safe,
    Quarantine,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Quarantine => "QUARANTINE",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerdictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAFE" => Ok(Self::Safe),
            "QUARANTINE" => Ok(Self::Quarantine),
            other => Err(format!("unknown verdict: '{other}'")),
        }
    }
}

/// Classification result: outcome plus a short reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub reason: String,
}

impl Verdict {
    pub fn safe(reason: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Safe,
            reason: reason.into(),
        }
    }

    pub fn quarantine(reason: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Quarantine,
            reason: reason.into(),
        }
    }

    pub fn is_safe(&self) -> bool {
        self.kind == VerdictKind::Safe
    }
}

// ── Ledger record ───────────────────────────────────────────────────

/// Durable proof that a message's side effect completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub message_id: String,
    pub verdict: VerdictKind,
    pub reason: String,
    pub processed_at: DateTime<Utc>,
}

// ── Outcome ─────────────────────────────────────────────────────────

/// What happened to one message on one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handed to the mail store and ledgered.
    Delivered { reason: String },
    /// Moved to quarantine and ledgered.
    Quarantined { reason: String },
    /// Left staged; picked up again on a later pass.
    Retry { cause: RetryCause },
    /// Nothing done (already ledgered, vanished, malformed name).
    Skipped { cause: SkipCause },
}

impl Outcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Quarantined { .. } => "quarantined",
            Self::Retry { .. } => "retry",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Why a message stays staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    RateLimited,
    DeliveryFailed(String),
    QuarantineFailed(String),
    LedgerFailed(String),
    ReadFailed(String),
}

/// Why a message was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCause {
    AlreadyProcessed,
    Vanished,
    Malformed,
}
