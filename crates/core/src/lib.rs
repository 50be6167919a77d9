//! Core domain types, errors and collaborator traits shared by the PPTX
//! validation, sanitization and processing pipeline.

pub mod archive;
pub mod error;
pub mod sanitization;
pub mod types;
pub mod validation;
pub mod worker;

pub use archive::{ArchiveHandle, ArchiveInfo};
pub use error::{Error, Result};
pub use sanitization::{RuleCategory, SanitizationResult, SanitizeCounters, SanitizeOptions};
pub use types::{ContainerFormat, ExtractedSlide, Presentation, SlideText, PPTX_MIME_TYPE};
pub use validation::{
    ArchiveStats, IssueCode, IssueSeverity, RiskLevel, SecurityFlags, ValidationIssue,
    ValidationOptions, ValidationResult,
};
pub use worker::{ProcessingWorker, WorkerOptions};
