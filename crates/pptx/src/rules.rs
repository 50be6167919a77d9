//! Ordered pattern tables for the security scan and the sanitizer.
//!
//! Both tables are evaluated top to bottom. Order matters for the sanitizer:
//! text substitutions run before element removal, and element removal runs
//! before empty-leaf pruning.

use ppt_core::{RiskLevel, RuleCategory};
use regex::Regex;
use std::sync::LazyLock;

/// What a security pattern indicates when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Finding {
    ExternalLink,
    Script,
    Macro,
    UnsafeContent,
}

/// Where a scan pattern is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    EntryName,
    XmlText,
}

/// One row of the security scan table.
#[derive(Debug)]
pub struct ScanPattern {
    pub finding: Finding,
    pub target: ScanTarget,
    pub description: &'static str,
    pub regex: Regex,
}

/// External relationship targets using a remote scheme.
const EXTERNAL_TARGET: &str = r#"(?i)\bTarget\s*=\s*"(?:https?|ftp|file|smb)://[^"]*""#;

/// Executable and script file extensions that never belong in a presentation.
const UNSAFE_EXTENSION: &str =
    r"(?i)\.(?:exe|dll|bat|cmd|com|scr|vbs|vbe|js|jse|wsf|wsh|ps1|msi|jar|hta|cpl)$";

fn pattern(finding: Finding, target: ScanTarget, description: &'static str, re: &str) -> ScanPattern {
    ScanPattern {
        finding,
        target,
        description,
        regex: Regex::new(re).expect("static scan pattern must compile"),
    }
}

/// The security scan table, in evaluation order.
pub static SCAN_PATTERNS: LazyLock<Vec<ScanPattern>> = LazyLock::new(|| {
    use Finding::*;
    use ScanTarget::*;
    vec![
        pattern(Macro, EntryName, "VBA project binary", r"(?i)(?:^|/)vbaProject\.bin$"),
        pattern(Macro, EntryName, "VBA data part", r"(?i)(?:^|/)vbaData\.xml$"),
        pattern(UnsafeContent, EntryName, "executable entry", UNSAFE_EXTENSION),
        pattern(UnsafeContent, EntryName, "ActiveX control", r"(?i)(?:^|/)activeX/"),
        pattern(UnsafeContent, EntryName, "embedded OLE object", r"(?i)(?:^|/)embeddings/oleObject[^/]*\.bin$"),
        pattern(Script, XmlText, "script element", r"(?i)<script\b"),
        pattern(Script, XmlText, "javascript URI", r"(?i)javascript:"),
        pattern(Script, XmlText, "vbscript URI", r"(?i)vbscript:"),
        pattern(Macro, XmlText, "macro-enabled content type", r"(?i)macroEnabled"),
        pattern(Macro, XmlText, "VBA project reference", r"(?i)vbaProject"),
        pattern(ExternalLink, XmlText, "external relationship target", EXTERNAL_TARGET),
    ]
});

/// Scan patterns whose target is an entry name.
pub fn scan_name(name: &str) -> Vec<&'static ScanPattern> {
    SCAN_PATTERNS
        .iter()
        .filter(|p| p.target == ScanTarget::EntryName && p.regex.is_match(name))
        .collect()
}

/// Scan patterns whose target is XML text, with their match counts.
pub fn scan_text(text: &str) -> Vec<(&'static ScanPattern, usize)> {
    SCAN_PATTERNS
        .iter()
        .filter(|p| p.target == ScanTarget::XmlText)
        .filter_map(|p| {
            let hits = p.regex.find_iter(text).count();
            (hits > 0).then_some((p, hits))
        })
        .collect()
}

/// What a sanitize rule does.
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Regex substitution over the raw XML text.
    Replace {
        pattern: Regex,
        replacement: &'static str,
    },
    /// Remove elements (with their subtree) whose local name is listed.
    RemoveElements { names: Vec<&'static str> },
    /// Remove XML comment nodes.
    RemoveXmlComments,
    /// Remove attribute-less elements with no content, cascading upwards.
    RemoveEmptyLeaves,
    /// Drop whole entries whose name matches.
    DropEntries { pattern: Regex },
    /// Drop slide parts whose root is marked hidden.
    DropHiddenSlides,
}

/// One row of the sanitize table.
#[derive(Debug, Clone)]
pub struct SanitizeRule {
    pub name: &'static str,
    pub category: RuleCategory,
    pub severity: RiskLevel,
    pub action: RuleAction,
}

impl SanitizeRule {
    fn replace(
        name: &'static str,
        category: RuleCategory,
        severity: RiskLevel,
        re: &str,
        replacement: &'static str,
    ) -> Self {
        Self {
            name,
            category,
            severity,
            action: RuleAction::Replace {
                pattern: Regex::new(re).expect("static sanitize pattern must compile"),
                replacement,
            },
        }
    }
}

/// An ordered sanitize table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<SanitizeRule>,
}

impl RuleTable {
    /// Build a table from rules in the order they should run.
    pub fn new(rules: Vec<SanitizeRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SanitizeRule] {
        &self.rules
    }

    /// Text substitution rules in order.
    pub fn text_rules(&self) -> impl Iterator<Item = &SanitizeRule> {
        self.rules
            .iter()
            .filter(|r| matches!(r.action, RuleAction::Replace { .. }))
    }

    /// Entry-dropping rules in order.
    pub fn entry_rules(&self) -> impl Iterator<Item = &SanitizeRule> {
        self.rules
            .iter()
            .filter(|r| matches!(r.action, RuleAction::DropEntries { .. } | RuleAction::DropHiddenSlides))
    }

    /// Element names removed by enabled `RemoveElements` rules, with the
    /// category each name is counted under.
    pub fn element_targets(&self, enabled: impl Fn(RuleCategory) -> bool) -> Vec<(&'static str, RuleCategory)> {
        self.rules
            .iter()
            .filter(|r| enabled(r.category))
            .filter_map(|r| match &r.action {
                RuleAction::RemoveElements { names } => {
                    Some(names.iter().map(move |n| (*n, r.category)))
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Whether an enabled rule of this kind exists.
    pub fn has_enabled(&self, enabled: impl Fn(RuleCategory) -> bool, pred: impl Fn(&RuleAction) -> bool) -> bool {
        self.rules.iter().any(|r| enabled(r.category) && pred(&r.action))
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        use RuleCategory::*;
        Self::new(vec![
            SanitizeRule::replace(
                "script-block",
                Scripts,
                RiskLevel::High,
                r"(?is)<script\b[^>]*/>|<script\b[^>]*>.*?</script\s*>",
                "",
            ),
            SanitizeRule::replace("javascript-uri", Scripts, RiskLevel::High, r#"(?i)javascript:[^"'<>\s]*"#, "#"),
            SanitizeRule::replace("vbscript-uri", Scripts, RiskLevel::High, r#"(?i)vbscript:[^"'<>\s]*"#, "#"),
            SanitizeRule::replace(
                "vba-relationship",
                Macros,
                RiskLevel::High,
                r"(?i)<Relationship\b[^>]*vbaProject\.bin[^>]*/>",
                "",
            ),
            SanitizeRule::replace(
                "vba-content-type",
                Macros,
                RiskLevel::High,
                r"(?i)<(?:Override|Default)\b[^>]*(?:vbaProject|vbaData|vbaProjectSignature)[^>]*/>",
                "",
            ),
            SanitizeRule::replace(
                "macro-enabled-main",
                Macros,
                RiskLevel::High,
                r"(?i)application/vnd\.ms-powerpoint\.(presentation|slideshow|template)\.macroEnabled\.main\+xml",
                "application/vnd.openxmlformats-officedocument.presentationml.$1.main+xml",
            ),
            SanitizeRule::replace("external-target", ExternalLinks, RiskLevel::Medium, EXTERNAL_TARGET, r##"Target="#""##),
            SanitizeRule {
                name: "personal-metadata",
                category: Metadata,
                severity: RiskLevel::Low,
                action: RuleAction::RemoveElements {
                    names: vec!["creator", "lastModifiedBy", "Company", "Manager", "cmAuthor"],
                },
            },
            SanitizeRule {
                name: "slide-comments",
                category: Comments,
                severity: RiskLevel::Low,
                action: RuleAction::RemoveElements { names: vec!["cm"] },
            },
            SanitizeRule {
                name: "xml-comments",
                category: Comments,
                severity: RiskLevel::Low,
                action: RuleAction::RemoveXmlComments,
            },
            SanitizeRule {
                name: "empty-leaves",
                category: EmptyElements,
                severity: RiskLevel::Low,
                action: RuleAction::RemoveEmptyLeaves,
            },
            SanitizeRule {
                name: "macro-binaries",
                category: Macros,
                severity: RiskLevel::High,
                action: RuleAction::DropEntries {
                    pattern: Regex::new(r"(?i)(?:^|/)(?:vbaProject\.bin|vbaData\.xml|vbaProjectSignature\.bin)$")
                        .expect("static sanitize pattern must compile"),
                },
            },
            SanitizeRule {
                name: "executables",
                category: Macros,
                severity: RiskLevel::High,
                action: RuleAction::DropEntries {
                    pattern: Regex::new(UNSAFE_EXTENSION).expect("static sanitize pattern must compile"),
                },
            },
            SanitizeRule {
                name: "hidden-slides",
                category: HiddenSlides,
                severity: RiskLevel::Low,
                action: RuleAction::DropHiddenSlides,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_name() {
        let hits = scan_name("ppt/vbaProject.bin");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].finding, Finding::Macro);

        assert_eq!(scan_name("ppt/embeddings/run.EXE")[0].finding, Finding::UnsafeContent);
        assert!(scan_name("ppt/media/image1.png").is_empty());
    }

    #[test]
    fn test_scan_text_external_link_only() {
        let rels = r#"<Relationships><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com/x" TargetMode="External"/></Relationships>"#;
        let hits = scan_text(rels);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.finding, Finding::ExternalLink);
        assert_eq!(hits[0].1, 1);
    }

    #[test]
    fn test_namespace_uris_are_not_external_links() {
        let xml = r#"<p:sld xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"/>"#;
        assert!(scan_text(xml).is_empty());
    }

    #[test]
    fn test_script_patterns() {
        let hits = scan_text(r#"<a href="javascript:alert(1)"><script>x</script></a>"#);
        let findings: Vec<Finding> = hits.iter().map(|(p, _)| p.finding).collect();
        assert!(findings.iter().all(|f| *f == Finding::Script));
        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn test_default_table_order() {
        let table = RuleTable::default();
        let names: Vec<&str> = table.rules().iter().map(|r| r.name).collect();
        assert_eq!(names[0], "script-block");
        let external = names.iter().position(|n| *n == "external-target").unwrap();
        let metadata = names.iter().position(|n| *n == "personal-metadata").unwrap();
        let empty = names.iter().position(|n| *n == "empty-leaves").unwrap();
        assert!(external < metadata && metadata < empty);
    }

    #[test]
    fn test_replacements_do_not_rematch() {
        let table = RuleTable::default();
        for rule in table.text_rules() {
            if let RuleAction::Replace { pattern, replacement } = &rule.action {
                assert!(!pattern.is_match(replacement), "rule {} re-matches its output", rule.name);
            }
        }
    }

    #[test]
    fn test_element_targets_respect_enabled() {
        let table = RuleTable::default();
        let all = table.element_targets(|_| true);
        assert!(all.contains(&("creator", RuleCategory::Metadata)));
        assert!(all.contains(&("cm", RuleCategory::Comments)));

        let only_comments = table.element_targets(|c| c == RuleCategory::Comments);
        assert_eq!(only_comments, vec![("cm", RuleCategory::Comments)]);
    }
}
