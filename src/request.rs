//! Classified text requests entering the governor.
//!
//! A [`Request`] is immutable once created.  Its [`PriorityTier`] and
//! [`DedupKey`] are derived, never stored, so every component that needs them
//! computes the same value from the same inputs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::QueueConfig;

// ---------------------------------------------------------------------------
// SourceType
// ---------------------------------------------------------------------------

/// Where a request came from in the voice assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Chat,
    Notification,
    EmailSummary,
    EmailSegment,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Chat,
        SourceType::Notification,
        SourceType::EmailSummary,
        SourceType::EmailSegment,
    ];

    /// Stable snake_case name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Chat => "chat",
            SourceType::Notification => "notification",
            SourceType::EmailSummary => "email_summary",
            SourceType::EmailSegment => "email_segment",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PriorityTier
// ---------------------------------------------------------------------------

/// Ordered priority class.  Lower is more urgent.
///
/// | Tier   | Typical request                          | Admission        |
/// |--------|------------------------------------------|------------------|
/// | `Tier0`| chat / notification, short text          | always           |
/// | `Tier1`| email summary, medium text               | always           |
/// | `Tier2`| email segment, long text                 | only when 0/1 idle |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityTier {
    Tier0,
    Tier1,
    Tier2,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 3] = [PriorityTier::Tier0, PriorityTier::Tier1, PriorityTier::Tier2];

    pub fn index(self) -> usize {
        match self {
            PriorityTier::Tier0 => 0,
            PriorityTier::Tier1 => 1,
            PriorityTier::Tier2 => 2,
        }
    }

    /// Classify a request from its source and text length.
    ///
    /// Length picks the baseline tier (`≤ tier0_max_chars` → 0,
    /// `≤ tier1_max_chars` → 1, else 2); the source sets a floor: email
    /// summaries are never tier 0 and email segments are always tier 2.
    ///
    /// ```
    /// use inference_governor::config::QueueConfig;
    /// use inference_governor::request::{PriorityTier, SourceType};
    ///
    /// let cfg = QueueConfig::default();
    /// assert_eq!(PriorityTier::classify(SourceType::Chat, "hi", &cfg), PriorityTier::Tier0);
    /// assert_eq!(PriorityTier::classify(SourceType::EmailSummary, "hi", &cfg), PriorityTier::Tier1);
    /// assert_eq!(PriorityTier::classify(SourceType::EmailSegment, "hi", &cfg), PriorityTier::Tier2);
    /// ```
    pub fn classify(source: SourceType, text: &str, config: &QueueConfig) -> Self {
        let chars = text.chars().count();
        let by_length = if chars <= config.tier0_max_chars {
            PriorityTier::Tier0
        } else if chars <= config.tier1_max_chars {
            PriorityTier::Tier1
        } else {
            PriorityTier::Tier2
        };

        let floor = match source {
            SourceType::Chat | SourceType::Notification => PriorityTier::Tier0,
            SourceType::EmailSummary => PriorityTier::Tier1,
            SourceType::EmailSegment => PriorityTier::Tier2,
        };

        by_length.max(floor)
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.index())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A classified text request.  Immutable once created.
#[derive(Debug, Clone)]
pub struct Request {
    id: String,
    text: String,
    source_type: SourceType,
    arrival_time: Instant,
}

impl Request {
    /// Create a request with a process-unique id, stamped with the current
    /// time.
    pub fn new(text: impl Into<String>, source_type: SourceType) -> Self {
        let n = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(format!("req-{n}"), text, source_type)
    }

    /// Create a request with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, text: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source_type,
            arrival_time: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn tier(&self, config: &QueueConfig) -> PriorityTier {
        PriorityTier::classify(self.source_type, &self.text, config)
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.source_type, &self.text)
    }
}

// ---------------------------------------------------------------------------
// DedupKey
// ---------------------------------------------------------------------------

/// Identity of a request for single-flight coalescing: normalized text plus
/// source type.
///
/// Normalization trims, lowercases and collapses internal whitespace runs to
/// a single space.
///
/// ```
/// use inference_governor::request::{DedupKey, SourceType};
///
/// let a = DedupKey::new(SourceType::Notification, "  New   message from Ana ");
/// let b = DedupKey::new(SourceType::Notification, "new message from ana");
/// assert_eq!(a, b);
/// assert_ne!(a, DedupKey::new(SourceType::Chat, "new message from ana"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    source_type: SourceType,
    normalized: String,
}

impl DedupKey {
    pub fn new(source_type: SourceType, text: &str) -> Self {
        let normalized = text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            source_type,
            normalized,
        }
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_type, self.normalized)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> QueueConfig {
        QueueConfig::default()
    }

    #[test]
    fn short_chat_is_tier0() {
        let text = "a".repeat(130);
        assert_eq!(PriorityTier::classify(SourceType::Chat, &text, &cfg()), PriorityTier::Tier0);
    }

    #[test]
    fn length_boundaries() {
        let t131 = "a".repeat(131);
        let t200 = "a".repeat(200);
        let t201 = "a".repeat(201);
        assert_eq!(PriorityTier::classify(SourceType::Chat, &t131, &cfg()), PriorityTier::Tier1);
        assert_eq!(PriorityTier::classify(SourceType::Notification, &t200, &cfg()), PriorityTier::Tier1);
        assert_eq!(PriorityTier::classify(SourceType::Chat, &t201, &cfg()), PriorityTier::Tier2);
    }

    #[test]
    fn length_counts_chars_not_bytes() {
        // 130 Thai characters are 390 bytes.
        let thai = "ก".repeat(130);
        assert_eq!(PriorityTier::classify(SourceType::Chat, &thai, &cfg()), PriorityTier::Tier0);
    }

    #[test]
    fn long_email_summary_is_tier2() {
        let text = "a".repeat(250);
        assert_eq!(
            PriorityTier::classify(SourceType::EmailSummary, &text, &cfg()),
            PriorityTier::Tier2
        );
    }

    #[test]
    fn source_type_names_round_trip() {
        for s in SourceType::ALL {
            assert_eq!(SourceType::parse(s.as_str()), Some(s));
        }
        assert_eq!(SourceType::parse("sms"), None);
    }

    #[test]
    fn source_type_serde_is_snake_case() {
        let json = serde_json::to_string(&SourceType::EmailSummary).unwrap();
        assert_eq!(json, "\"email_summary\"");
    }

    #[test]
    fn request_ids_are_unique() {
        let a = Request::new("x", SourceType::Chat);
        let b = Request::new("x", SourceType::Chat);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
