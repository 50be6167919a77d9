//! PPTX (Office Open XML) backend for the safety pipeline.
//!
//! PPTX files are ZIP archives of XML parts. This crate inspects them
//! ([`Validator`]), rewrites them ([`Sanitizer`]) and extracts their text
//! ([`PptxExtractor`]).

pub mod archive;
pub mod extractor;
pub mod rules;
pub mod sanitizer;
pub mod validator;
pub mod xml;

pub use archive::{EntryInfo, EntryKind, PackageReader, PackageWriter};
pub use extractor::PptxExtractor;
pub use rules::{RuleAction, RuleTable, SanitizeRule};
pub use sanitizer::Sanitizer;
pub use validator::Validator;
