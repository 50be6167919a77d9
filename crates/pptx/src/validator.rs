//! Structural and security validation of PPTX packages.
//!
//! Validation is collect-all: every check runs and records its findings so the
//! caller always receives a complete report. The only exceptions are an
//! unreadable container, which is returned as
//! [`ppt_core::Error::ArchiveCorrupted`], and
//! missing package parts in strict mode, which end validation early.

use ppt_core::{
    ArchiveHandle, ContainerFormat, IssueCode, Result, ValidationIssue, ValidationOptions,
    ValidationResult,
};
use std::collections::BTreeSet;

use crate::archive::{is_unsafe_path, EntryInfo, EntryKind, PackageReader, REQUIRED_ENTRIES};
use crate::rules::{scan_name, scan_text, Finding};
use crate::xml::profile_slide;

/// Upper bound on the bytes inflated from any single XML entry.
const MAX_XML_ENTRY_BYTES: u64 = 32 * 1024 * 1024;

/// Read-only validator. Holds no per-archive state and can be shared.
#[derive(Debug, Clone)]
pub struct Validator {
    xml_read_limit: u64,
}

impl Validator {
    /// Create a validator with the default per-entry read limit.
    pub fn new() -> Self {
        Self {
            xml_read_limit: MAX_XML_ENTRY_BYTES,
        }
    }

    /// Override the per-entry inflate limit for XML parts.
    pub fn with_xml_read_limit(mut self, limit: u64) -> Self {
        self.xml_read_limit = limit;
        self
    }

    /// Validate an archive against the given options.
    pub fn validate(&self, archive: &ArchiveHandle, options: &ValidationOptions) -> Result<ValidationResult> {
        let mut result = ValidationResult::new();

        self.check_container(archive, options, &mut result);

        let mut reader = PackageReader::open(archive.bytes())?;

        if !self.check_structure(&reader, &mut result) && options.strict_mode {
            log::debug!("{}: structural errors in strict mode, stopping", archive.name());
            result.finalize();
            return Ok(result);
        }

        let suspicious = self.check_entries(&reader, options, &mut result);
        self.check_slides(&mut reader, options, &suspicious, &mut result);
        self.check_media(&reader, options, &mut result);
        self.scan_security(&mut reader, &suspicious, &mut result);

        result.finalize();
        log::debug!(
            "{}: valid={} errors={} warnings={} risk={:?}",
            archive.name(),
            result.is_valid,
            result.errors.len(),
            result.warnings.len(),
            result.risk_level
        );
        Ok(result)
    }

    /// Buffer-level checks that need no ZIP parsing.
    fn check_container(&self, archive: &ArchiveHandle, options: &ValidationOptions, result: &mut ValidationResult) {
        if archive.size() as u64 > options.max_file_size {
            result.push(ValidationIssue::error(
                IssueCode::FileTooLarge,
                format!(
                    "archive is {} bytes, limit is {}",
                    archive.size(),
                    options.max_file_size
                ),
            ));
        }

        if !archive.declares_pptx() {
            result.push(ValidationIssue::warning(
                IssueCode::MimeMismatch,
                format!(
                    "declared type '{}' is not a PPTX presentation",
                    archive.declared_mime_type().unwrap_or_default()
                ),
            ));
        }

        match ContainerFormat::from_magic(archive.bytes()) {
            Some(ContainerFormat::Zip) | Some(ContainerFormat::EmptyZip) => {}
            other => result.push(ValidationIssue::warning(
                IssueCode::MimeMismatch,
                format!("content does not start with a ZIP header ({:?})", other),
            )),
        }
    }

    /// Required parts and unsafe entry names. Returns false when a required
    /// part is missing.
    fn check_structure(&self, reader: &PackageReader<'_>, result: &mut ValidationResult) -> bool {
        let mut complete = true;
        for required in REQUIRED_ENTRIES {
            if !reader.contains(required) {
                complete = false;
                result.push(
                    ValidationIssue::error(IssueCode::StructuralError, format!("missing required part '{}'", required))
                        .at(required),
                );
            }
        }

        for entry in reader.entries() {
            if is_unsafe_path(&entry.name) {
                result.security.has_unsafe_content = true;
                result.push(
                    ValidationIssue::error(IssueCode::UnsafePath, "entry name escapes the package root")
                        .at(&entry.name),
                );
            }
        }
        complete
    }

    /// Counts, limits and zip-bomb heuristics. Returns the indexes of entries
    /// too suspicious to inflate.
    fn check_entries(&self, reader: &PackageReader<'_>, options: &ValidationOptions, result: &mut ValidationResult) -> BTreeSet<usize> {
        let mut suspicious = BTreeSet::new();
        let stats = &mut result.stats;

        for entry in reader.entries() {
            if entry.kind == EntryKind::Directory {
                continue;
            }
            stats.total_entries += 1;
            stats.uncompressed_bytes = stats.uncompressed_bytes.saturating_add(entry.size);
            match entry.kind {
                EntryKind::Slide => stats.slide_count += 1,
                EntryKind::Image => stats.image_count += 1,
                EntryKind::Media => stats.media_count += 1,
                _ => {}
            }
            if entry.is_xml() {
                stats.xml_entries += 1;
            }
        }

        let (slides, images, total) = (stats.slide_count, stats.image_count, stats.uncompressed_bytes);

        if slides > options.max_slides {
            result.push(ValidationIssue::error(
                IssueCode::TooManySlides,
                format!("{} slides, limit is {}", slides, options.max_slides),
            ));
        }
        if images > options.max_images {
            result.push(ValidationIssue::error(
                IssueCode::TooManyImages,
                format!("{} images, limit is {}", images, options.max_images),
            ));
        }
        if total > options.max_uncompressed_size {
            result.push(ValidationIssue::warning(
                IssueCode::UncompressedSizeExceeded,
                format!("archive inflates to {} bytes, limit is {}", total, options.max_uncompressed_size),
            ));
        }

        for entry in reader.entries() {
            if entry.compression_ratio() > options.max_compression_ratio {
                suspicious.insert(entry.index);
                result.push(
                    ValidationIssue::warning(
                        IssueCode::SuspiciousCompression,
                        format!("compression ratio {}:1", entry.compression_ratio()),
                    )
                    .at(&entry.name),
                );
            }
        }
        suspicious
    }

    /// Parse a bounded sample of slides for required children and depth.
    fn check_slides(
        &self,
        reader: &mut PackageReader<'_>,
        options: &ValidationOptions,
        suspicious: &BTreeSet<usize>,
        result: &mut ValidationResult,
    ) {
        let sample: Vec<EntryInfo> = reader
            .slides()
            .into_iter()
            .filter(|e| !suspicious.contains(&e.index))
            .take(options.slide_sample_size)
            .cloned()
            .collect();

        for entry in sample {
            let xml = match reader.read_text(entry.index, self.xml_read_limit) {
                Ok(xml) => xml,
                Err(e) => {
                    result.push(ValidationIssue::warning(IssueCode::MalformedXml, e.to_string()).at(&entry.name));
                    continue;
                }
            };

            match profile_slide(&xml, options.max_xml_depth) {
                Ok(profile) if profile.depth_exceeded => {
                    result.push(
                        ValidationIssue::warning(
                            IssueCode::ExcessiveNesting,
                            format!("nesting exceeds {} levels", options.max_xml_depth),
                        )
                        .at(&entry.name),
                    );
                }
                Ok(profile) => {
                    if !profile.has_common_slide_data {
                        result.push(
                            ValidationIssue::warning(IssueCode::MissingElement, "slide has no p:cSld element")
                                .at(&entry.name),
                        );
                    } else if !profile.has_shape_tree {
                        result.push(
                            ValidationIssue::warning(IssueCode::MissingElement, "slide has no p:spTree element")
                                .at(&entry.name),
                        );
                    }
                }
                Err(msg) => {
                    result.push(ValidationIssue::warning(IssueCode::MalformedXml, msg).at(&entry.name));
                }
            }
        }
    }

    /// Per-item and aggregate media limits plus format allow-lists.
    fn check_media(&self, reader: &PackageReader<'_>, options: &ValidationOptions, result: &mut ValidationResult) {
        let mut total: u64 = 0;
        for entry in reader.entries() {
            let allowed = match entry.kind {
                EntryKind::Image => &options.allowed_image_formats,
                EntryKind::Media => &options.allowed_media_formats,
                _ => continue,
            };
            total = total.saturating_add(entry.size);

            let ext = entry.extension().unwrap_or_default();
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
                let code = if entry.kind == EntryKind::Image {
                    IssueCode::UnsupportedImageFormat
                } else {
                    IssueCode::UnsupportedMediaFormat
                };
                result.push(ValidationIssue::warning(code, format!("format '{}' is not allowed", ext)).at(&entry.name));
            }

            if entry.size > options.max_media_item_size {
                result.push(
                    ValidationIssue::warning(
                        IssueCode::MediaTooLarge,
                        format!("{} bytes, limit is {}", entry.size, options.max_media_item_size),
                    )
                    .at(&entry.name),
                );
            }
        }

        if total > options.max_total_media_size {
            result.push(ValidationIssue::warning(
                IssueCode::MediaTotalExceeded,
                format!("media totals {} bytes, limit is {}", total, options.max_total_media_size),
            ));
        }
    }

    /// Pattern scan over entry names and XML text.
    fn scan_security(&self, reader: &mut PackageReader<'_>, suspicious: &BTreeSet<usize>, result: &mut ValidationResult) {
        let entries: Vec<EntryInfo> = reader.entries().to_vec();

        for entry in &entries {
            for pattern in scan_name(&entry.name) {
                record_finding(result, pattern.finding, pattern.description, &entry.name);
            }

            if !entry.is_xml() || suspicious.contains(&entry.index) {
                continue;
            }
            let text = match reader.read_text(entry.index, self.xml_read_limit) {
                Ok(text) => text,
                Err(e) => {
                    log::debug!("skipping scan of '{}': {}", entry.name, e);
                    continue;
                }
            };

            if entry.kind == EntryKind::Slide && is_hidden_slide(&text) {
                result.stats.hidden_slide_count += 1;
            }

            for (pattern, hits) in scan_text(&text) {
                let description = if hits > 1 {
                    format!("{} ({} occurrences)", pattern.description, hits)
                } else {
                    pattern.description.to_string()
                };
                record_finding(result, pattern.finding, &description, &entry.name);
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Set the flag for a finding and record it as a warning.
fn record_finding(result: &mut ValidationResult, finding: Finding, description: &str, location: &str) {
    let code = match finding {
        Finding::ExternalLink => {
            result.security.has_external_links = true;
            IssueCode::ExternalLink
        }
        Finding::Script => {
            result.security.has_scripts = true;
            IssueCode::ScriptContent
        }
        Finding::Macro => {
            result.security.has_macros = true;
            IssueCode::MacroContent
        }
        Finding::UnsafeContent => {
            result.security.has_unsafe_content = true;
            IssueCode::UnsafeEntry
        }
    };
    result.push(ValidationIssue::warning(code, description).at(location));
}

/// Cheap check of the slide root for `show="0"`.
fn is_hidden_slide(xml: &str) -> bool {
    profile_slide(xml, usize::MAX)
        .map(|p| p.hidden)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PackageWriter;
    use ppt_core::{Error, IssueSeverity, RiskLevel};

    const CONTENT_TYPES: &str = r#"<?xml version="1.0"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/></Types>"#;
    const ROOT_RELS: &str = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="ppt/presentation.xml"/></Relationships>"#;
    const PRESENTATION: &str = r#"<p:presentation xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"/>"#;
    const SLIDE: &str = r#"<p:sld xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main"><p:cSld><p:spTree/></p:cSld></p:sld>"#;

    fn package(extra: &[(&str, &str)], skip: &[&str]) -> ArchiveHandle {
        let mut writer = PackageWriter::new();
        for (name, body) in [
            ("[Content_Types].xml", CONTENT_TYPES),
            ("_rels/.rels", ROOT_RELS),
            ("ppt/presentation.xml", PRESENTATION),
            ("ppt/slides/slide1.xml", SLIDE),
        ] {
            if !skip.contains(&name) {
                writer.add(name, body.as_bytes()).unwrap();
            }
        }
        for (name, body) in extra {
            writer.add(name, body.as_bytes()).unwrap();
        }
        ArchiveHandle::new("test.pptx", writer.finish().unwrap())
    }

    #[test]
    fn test_clean_package_is_valid_and_low_risk() {
        let archive = package(&[("ppt/media/image1.png", "PNG")], &[]);
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(result.is_valid, "errors: {:?}", result.errors);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.stats.slide_count, 1);
        assert_eq!(result.stats.image_count, 1);
        assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    }

    #[test]
    fn test_missing_manifest_strict_stops_early() {
        let archive = package(&[], &["[Content_Types].xml"]);
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(!result.is_valid);
        assert!(result.has_code(IssueCode::StructuralError));
        assert_eq!(result.stats.total_entries, 0);
    }

    #[test]
    fn test_missing_manifest_lenient_continues() {
        let archive = package(&[], &["[Content_Types].xml"]);
        let options = ValidationOptions::default().with_strict_mode(false);
        let result = Validator::new().validate(&archive, &options).unwrap();

        assert!(!result.is_valid);
        assert!(result.has_code(IssueCode::StructuralError));
        assert_eq!(result.stats.slide_count, 1);
    }

    #[test]
    fn test_corrupt_container_is_error() {
        let archive = ArchiveHandle::new("bad.pptx", b"PK\x03\x04garbage".to_vec());
        let err = Validator::new()
            .validate(&archive, &ValidationOptions::default().with_strict_mode(false))
            .unwrap_err();
        assert!(matches!(err, Error::ArchiveCorrupted(_)));
    }

    #[test]
    fn test_slide_limit_is_non_fatal() {
        let archive = package(&[("ppt/slides/slide2.xml", SLIDE)], &[]);
        let options = ValidationOptions::default().with_max_slides(1);
        let result = Validator::new().validate(&archive, &options).unwrap();

        assert!(!result.is_valid);
        assert!(result.has_code(IssueCode::TooManySlides));
        // later checks still ran
        assert_eq!(result.stats.xml_entries, 5);
    }

    #[test]
    fn test_external_link_is_medium_risk_warning() {
        let rels = r#"<Relationships><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com" TargetMode="External"/></Relationships>"#;
        let archive = package(&[("ppt/slides/_rels/slide1.xml.rels", rels)], &[]);
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(result.is_valid);
        assert!(result.security.has_external_links);
        assert_eq!(result.risk_level, RiskLevel::Medium);
        let warning = result.warnings.iter().find(|w| w.code == IssueCode::ExternalLink).unwrap();
        assert_eq!(warning.severity, IssueSeverity::Warning);
        assert_eq!(warning.location.as_deref(), Some("ppt/slides/_rels/slide1.xml.rels"));
    }

    #[test]
    fn test_macros_and_executables_are_high_risk() {
        let archive = package(
            &[("ppt/vbaProject.bin", "VBA"), ("ppt/embeddings/payload.exe", "MZ")],
            &[],
        );
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(result.security.has_macros);
        assert!(result.security.has_unsafe_content);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_script_in_xml_sets_flag() {
        let slide = r#"<p:sld xmlns:p="p"><p:cSld><p:spTree><a:hlinkClick r:id="" action="javascript:alert(1)"/></p:spTree></p:cSld></p:sld>"#;
        let archive = package(&[("ppt/slides/slide2.xml", slide)], &[]);
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(result.security.has_scripts);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_slide_structure_warnings() {
        let missing = r#"<p:sld xmlns:p="p"><p:cSld/></p:sld>"#;
        let mut deep = String::from(r#"<p:sld xmlns:p="p"><p:cSld><p:spTree>"#);
        for _ in 0..80 {
            deep.push_str("<p:grpSp>");
        }
        for _ in 0..80 {
            deep.push_str("</p:grpSp>");
        }
        deep.push_str("</p:spTree></p:cSld></p:sld>");
        let broken = r#"<p:sld><p:cSld></p:sld>"#;

        let archive = package(
            &[
                ("ppt/slides/slide2.xml", missing),
                ("ppt/slides/slide3.xml", deep.as_str()),
                ("ppt/slides/slide4.xml", broken),
            ],
            &[],
        );
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(result.is_valid);
        assert!(result.has_code(IssueCode::MissingElement));
        assert!(result.has_code(IssueCode::ExcessiveNesting));
        assert!(result.has_code(IssueCode::MalformedXml));
    }

    #[test]
    fn test_media_limits_and_formats() {
        let big = "0".repeat(2048);
        let archive = package(
            &[
                ("ppt/media/image1.webp", big.as_str()),
                ("ppt/media/clip.flv", "FLV"),
            ],
            &[],
        );
        let mut options = ValidationOptions::default().with_max_media_item_size(1024);
        options.allowed_image_formats = vec!["png".to_string()];
        options.max_total_media_size = 1024;
        options.max_compression_ratio = u64::MAX;

        let result = Validator::new().validate(&archive, &options).unwrap();
        assert!(result.is_valid);
        assert!(result.has_code(IssueCode::UnsupportedImageFormat));
        assert!(result.has_code(IssueCode::UnsupportedMediaFormat));
        assert!(result.has_code(IssueCode::MediaTooLarge));
        assert!(result.has_code(IssueCode::MediaTotalExceeded));
    }

    #[test]
    fn test_suspicious_compression_ratio() {
        let zeros = "a".repeat(1024 * 1024);
        let archive = package(&[("ppt/slides/slide2.xml", zeros.as_str())], &[]);
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();

        assert!(result.has_code(IssueCode::SuspiciousCompression));
        // the suspicious slide was not parsed
        assert!(!result.has_code(IssueCode::MalformedXml));
    }

    #[test]
    fn test_unsafe_path_is_error() {
        let archive = package(&[("../escape.xml", "<a/>")], &[]);
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();
        assert!(!result.is_valid);
        assert!(result.has_code(IssueCode::UnsafePath));
        assert!(result.security.has_unsafe_content);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let rels = r#"<Relationships><Relationship Target="http://a.example" TargetMode="External"/></Relationships>"#;
        let archive = package(&[("ppt/slides/_rels/slide1.xml.rels", rels), ("ppt/vbaProject.bin", "x")], &[]);
        let validator = Validator::new();
        let a = validator.validate(&archive, &ValidationOptions::default()).unwrap();
        let b = validator.validate(&archive, &ValidationOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_declared_mime_mismatch_warns() {
        let archive = package(&[], &[]).with_mime_type("application/pdf");
        let result = Validator::new().validate(&archive, &ValidationOptions::default()).unwrap();
        assert!(result.is_valid);
        assert!(result.has_code(IssueCode::MimeMismatch));
    }
}
