//! Cache entry metadata and write options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Cache tiers, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    Fast,
    Mid,
    Durable,
}

impl TierId {
    pub const ALL: [TierId; 3] = [TierId::Fast, TierId::Mid, TierId::Durable];

    pub fn level(&self) -> usize {
        match self {
            TierId::Fast => 0,
            TierId::Mid => 1,
            TierId::Durable => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TierId::Fast => "fast",
            TierId::Mid => "mid",
            TierId::Durable => "durable",
        }
    }
}

/// How many tiers a write reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Every tier.
    High,
    /// The two slower tiers.
    #[default]
    Medium,
    /// The slowest tier only.
    Low,
}

impl Priority {
    /// First tier that receives the write.
    pub fn first_tier(&self) -> TierId {
        match self {
            Priority::High => TierId::Fast,
            Priority::Medium => TierId::Mid,
            Priority::Low => TierId::Durable,
        }
    }
}

/// Options for [`MultiTierCache::set`](super::MultiTierCache::set).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Overrides the configured default TTL.
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<String>,
    pub priority: Priority,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Bookkeeping for one cached value. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    pub key: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub ttl_ms: Option<u64>,
    pub tags: BTreeSet<String>,
    /// Tier the entry was first written to.
    pub origin: TierId,
}

impl EntryMeta {
    /// Expired once strictly more than `ttl` has passed since creation.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => now.signed_duration_since(self.created_at).num_milliseconds() > ttl as i64,
            None => false,
        }
    }

    pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|t| self.tags.contains(t.as_ref()))
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ttl_ms: Option<u64>) -> EntryMeta {
        let now = Utc::now();
        EntryMeta {
            key: "k".into(),
            byte_size: 1,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl_ms,
            tags: ["a".to_string()].into_iter().collect(),
            origin: TierId::Fast,
        }
    }

    #[test]
    fn test_expiry_is_strict() {
        let m = meta(Some(1000));
        assert!(!m.is_expired(m.created_at + chrono::Duration::milliseconds(1000)));
        assert!(m.is_expired(m.created_at + chrono::Duration::milliseconds(1001)));
        assert!(!meta(None).is_expired(m.created_at + chrono::Duration::days(365)));
    }

    #[test]
    fn test_priority_targets() {
        assert_eq!(Priority::High.first_tier(), TierId::Fast);
        assert_eq!(Priority::default().first_tier(), TierId::Mid);
        assert_eq!(Priority::Low.first_tier().level(), 2);
    }

    #[test]
    fn test_tags() {
        assert!(meta(None).has_any_tag(&["x", "a"]));
        assert!(!meta(None).has_any_tag(&["x"]));
    }
}
