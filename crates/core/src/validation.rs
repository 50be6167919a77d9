//! Validation options and the report produced by the validator.

use serde::{Deserialize, Serialize};

/// Limits and allow-lists applied while validating an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationOptions {
    /// Maximum size of the archive buffer in bytes.
    pub max_file_size: u64,
    /// Maximum number of slide parts.
    pub max_slides: usize,
    /// Maximum number of image parts.
    pub max_images: usize,
    /// Lowercase image extensions accepted under `ppt/media/`.
    pub allowed_image_formats: Vec<String>,
    /// Lowercase audio/video extensions accepted under `ppt/media/`.
    pub allowed_media_formats: Vec<String>,
    /// Missing package parts abort validation immediately.
    pub strict_mode: bool,
    /// Maximum uncompressed size of a single media entry.
    pub max_media_item_size: u64,
    /// Maximum uncompressed size of all media entries together.
    pub max_total_media_size: u64,
    /// Maximum element nesting depth in a sampled slide.
    pub max_xml_depth: usize,
    /// Number of slides whose XML is parsed structurally.
    pub slide_sample_size: usize,
    /// Uncompressed/compressed ratio above which an entry is suspicious.
    pub max_compression_ratio: u64,
    /// Maximum uncompressed size of the whole archive.
    pub max_uncompressed_size: u64,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_slides: 500,
            max_images: 1000,
            allowed_image_formats: ["png", "jpg", "jpeg", "gif", "bmp", "svg", "emf", "wmf", "tif", "tiff", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_media_formats: ["mp3", "mp4", "m4a", "m4v", "wav", "wma", "wmv", "mov", "avi"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            strict_mode: true,
            max_media_item_size: 50 * 1024 * 1024,
            max_total_media_size: 200 * 1024 * 1024,
            max_xml_depth: 64,
            slide_sample_size: 10,
            max_compression_ratio: 100,
            max_uncompressed_size: 500 * 1024 * 1024,
        }
    }
}

impl ValidationOptions {
    /// Create options with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set strict mode.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Set the slide limit.
    pub fn with_max_slides(mut self, max: usize) -> Self {
        self.max_slides = max;
        self
    }

    /// Set the image limit.
    pub fn with_max_images(mut self, max: usize) -> Self {
        self.max_images = max;
        self
    }

    /// Set the archive size limit.
    pub fn with_max_file_size(mut self, max: u64) -> Self {
        self.max_file_size = max;
        self
    }

    /// Set the per-item media size limit.
    pub fn with_max_media_item_size(mut self, max: u64) -> Self {
        self.max_media_item_size = max;
        self
    }

    /// Set the nesting depth limit.
    pub fn with_max_xml_depth(mut self, depth: usize) -> Self {
        self.max_xml_depth = depth;
        self
    }
}

/// How serious a single validation finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

/// Stable codes for validation findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    StructuralError,
    FileTooLarge,
    TooManySlides,
    TooManyImages,
    MalformedXml,
    MissingElement,
    ExcessiveNesting,
    MediaTooLarge,
    MediaTotalExceeded,
    UnsupportedImageFormat,
    UnsupportedMediaFormat,
    ExternalLink,
    ScriptContent,
    MacroContent,
    UnsafeEntry,
    UnsafePath,
    SuspiciousCompression,
    UncompressedSizeExceeded,
    MimeMismatch,
}

impl IssueCode {
    /// The code as it appears in serialized reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::StructuralError => "STRUCTURAL_ERROR",
            IssueCode::FileTooLarge => "FILE_TOO_LARGE",
            IssueCode::TooManySlides => "TOO_MANY_SLIDES",
            IssueCode::TooManyImages => "TOO_MANY_IMAGES",
            IssueCode::MalformedXml => "MALFORMED_XML",
            IssueCode::MissingElement => "MISSING_ELEMENT",
            IssueCode::ExcessiveNesting => "EXCESSIVE_NESTING",
            IssueCode::MediaTooLarge => "MEDIA_TOO_LARGE",
            IssueCode::MediaTotalExceeded => "MEDIA_TOTAL_EXCEEDED",
            IssueCode::UnsupportedImageFormat => "UNSUPPORTED_IMAGE_FORMAT",
            IssueCode::UnsupportedMediaFormat => "UNSUPPORTED_MEDIA_FORMAT",
            IssueCode::ExternalLink => "EXTERNAL_LINK",
            IssueCode::ScriptContent => "SCRIPT_CONTENT",
            IssueCode::MacroContent => "MACRO_CONTENT",
            IssueCode::UnsafeEntry => "UNSAFE_ENTRY",
            IssueCode::UnsafePath => "UNSAFE_PATH",
            IssueCode::SuspiciousCompression => "SUSPICIOUS_COMPRESSION",
            IssueCode::UncompressedSizeExceeded => "UNCOMPRESSED_SIZE_EXCEEDED",
            IssueCode::MimeMismatch => "MIME_MISMATCH",
        }
    }
}

/// A single finding, located at an archive entry when one applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    pub severity: IssueSeverity,
    pub location: Option<String>,
}

impl ValidationIssue {
    pub fn error(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: IssueSeverity::Error,
            location: None,
        }
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: IssueSeverity::Warning,
            location: None,
        }
    }

    /// Attach the archive entry this finding refers to.
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Counts gathered while walking the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStats {
    pub total_entries: usize,
    pub xml_entries: usize,
    pub slide_count: usize,
    pub hidden_slide_count: usize,
    pub image_count: usize,
    pub media_count: usize,
    pub uncompressed_bytes: u64,
}

/// Booleans raised by the security scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFlags {
    pub has_external_links: bool,
    pub has_scripts: bool,
    pub has_macros: bool,
    pub has_unsafe_content: bool,
}

/// Aggregate security classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// High for any script/macro/unsafe match, medium for external links only.
    pub fn from_flags(flags: &SecurityFlags) -> Self {
        if flags.has_scripts || flags.has_macros || flags.has_unsafe_content {
            RiskLevel::High
        } else if flags.has_external_links {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Complete validation report. Validation collects every finding rather than
/// stopping at the first one, except where strict mode aborts on structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub stats: ArchiveStats,
    pub security: SecurityFlags,
    pub risk_level: RiskLevel,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finding in the list matching its severity.
    pub fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            IssueSeverity::Error => self.errors.push(issue),
            IssueSeverity::Warning | IssueSeverity::Info => self.warnings.push(issue),
        }
    }

    /// Derive `is_valid` and `risk_level` from what was recorded.
    pub fn finalize(&mut self) {
        self.is_valid = self.errors.is_empty();
        self.risk_level = RiskLevel::from_flags(&self.security);
    }

    /// Whether any error or warning carries the given code.
    pub fn has_code(&self, code: IssueCode) -> bool {
        self.errors.iter().chain(self.warnings.iter()).any(|i| i.code == code)
    }

    /// The first error, used as the failure summary.
    pub fn first_error(&self) -> Option<&ValidationIssue> {
        self.errors.first()
    }
}
