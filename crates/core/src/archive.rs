//! Immutable handle over a submitted archive buffer.

use bytes::Bytes;
use serde::Serialize;

use crate::types::PPTX_MIME_TYPE;

/// Raw archive bytes plus the metadata the caller submitted with them.
///
/// The buffer is never mutated. Cloning shares the underlying bytes.
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    data: Bytes,
    name: String,
    declared_mime_type: Option<String>,
}

impl ArchiveHandle {
    /// Wrap a buffer under the given file name.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            name: name.into(),
            declared_mime_type: None,
        }
    }

    /// Record the MIME type the caller claimed for this buffer.
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.declared_mime_type = Some(mime.into());
        self
    }

    /// File name as submitted.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// MIME type declared at submission, if any.
    pub fn declared_mime_type(&self) -> Option<&str> {
        self.declared_mime_type.as_deref()
    }

    /// Whether the declared type (when present) is the PPTX type.
    pub fn declares_pptx(&self) -> bool {
        self.declared_mime_type
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(PPTX_MIME_TYPE))
    }

    /// Borrow the raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the raw bytes.
    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    /// Derive a new handle holding different bytes under the same name and type.
    pub fn replace_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            name: self.name.clone(),
            declared_mime_type: self.declared_mime_type.clone(),
        }
    }

    /// Summary used in result records.
    pub fn info(&self) -> ArchiveInfo {
        ArchiveInfo {
            name: self.name.clone(),
            size: self.size(),
            declared_mime_type: self.declared_mime_type.clone(),
        }
    }
}

/// Serializable description of an archive, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub name: String,
    pub size: usize,
    pub declared_mime_type: Option<String>,
}
