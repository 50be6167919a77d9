//! Sanitization options and the report produced by the sanitizer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::archive::ArchiveHandle;

/// Families of rewriting rules that can be switched on and off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleCategory {
    Scripts,
    Macros,
    ExternalLinks,
    Metadata,
    Comments,
    EmptyElements,
    HiddenSlides,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 7] = [
        RuleCategory::Scripts,
        RuleCategory::Macros,
        RuleCategory::ExternalLinks,
        RuleCategory::Metadata,
        RuleCategory::Comments,
        RuleCategory::EmptyElements,
        RuleCategory::HiddenSlides,
    ];
}

/// Which categories the sanitizer applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SanitizeOptions {
    pub enabled: BTreeSet<RuleCategory>,
}

impl Default for SanitizeOptions {
    /// Everything except hidden-slide removal.
    fn default() -> Self {
        Self {
            enabled: RuleCategory::ALL
                .iter()
                .copied()
                .filter(|c| *c != RuleCategory::HiddenSlides)
                .collect(),
        }
    }
}

impl SanitizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// No categories enabled.
    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
        }
    }

    pub fn with(mut self, category: RuleCategory) -> Self {
        self.enabled.insert(category);
        self
    }

    pub fn without(mut self, category: RuleCategory) -> Self {
        self.enabled.remove(&category);
        self
    }

    pub fn is_enabled(&self, category: RuleCategory) -> bool {
        self.enabled.contains(&category)
    }
}

/// Per-rule hit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizeCounters {
    pub scripts_removed: usize,
    pub macros_removed: usize,
    pub external_links_removed: usize,
    pub metadata_removed: usize,
    pub comments_removed: usize,
    pub empty_elements_removed: usize,
    pub hidden_slides_removed: usize,
}

impl SanitizeCounters {
    /// Sum of all hits.
    pub fn total(&self) -> usize {
        self.scripts_removed
            + self.macros_removed
            + self.external_links_removed
            + self.metadata_removed
            + self.comments_removed
            + self.empty_elements_removed
            + self.hidden_slides_removed
    }

    /// Add another set of counters into this one.
    pub fn merge(&mut self, other: &SanitizeCounters) {
        self.scripts_removed += other.scripts_removed;
        self.macros_removed += other.macros_removed;
        self.external_links_removed += other.external_links_removed;
        self.metadata_removed += other.metadata_removed;
        self.comments_removed += other.comments_removed;
        self.empty_elements_removed += other.empty_elements_removed;
        self.hidden_slides_removed += other.hidden_slides_removed;
    }
}

/// Output of a sanitization pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationResult {
    /// The rewritten archive.
    #[serde(skip)]
    pub archive: ArchiveHandle,
    pub counters: SanitizeCounters,
    /// Entries dropped from the listing.
    pub dropped_entries: Vec<String>,
    /// Entries left untouched because they could not be parsed.
    pub skipped_entries: Vec<String>,
    pub warnings: Vec<String>,
    pub original_size: usize,
    pub sanitized_size: usize,
}

impl SanitizationResult {
    /// Signed change in archive size (negative when the archive shrank).
    pub fn size_delta(&self) -> i64 {
        self.sanitized_size as i64 - self.original_size as i64
    }

    /// Whether the pass could not process every entry.
    pub fn is_partial(&self) -> bool {
        !self.skipped_entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_excludes_hidden_slides() {
        let opts = SanitizeOptions::default();
        assert!(opts.is_enabled(RuleCategory::Scripts));
        assert!(!opts.is_enabled(RuleCategory::HiddenSlides));
        assert!(opts.clone().with(RuleCategory::HiddenSlides).is_enabled(RuleCategory::HiddenSlides));
        assert!(!opts.without(RuleCategory::Macros).is_enabled(RuleCategory::Macros));
    }

    #[test]
    fn test_counters_merge_and_total() {
        let mut a = SanitizeCounters {
            scripts_removed: 1,
            ..Default::default()
        };
        let b = SanitizeCounters {
            external_links_removed: 2,
            comments_removed: 1,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.total(), 4);
        assert_eq!(a.external_links_removed, 2);
    }
}
