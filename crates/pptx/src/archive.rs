//! ZIP package listing, bounded entry reads and re-compression.

use ppt_core::{Error, Result};
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::xml::extract_slide_number;

/// Root manifest listing every part's content type.
pub const CONTENT_TYPES: &str = "[Content_Types].xml";
/// Package-level relationships.
pub const ROOT_RELS: &str = "_rels/.rels";
/// Root presentation document.
pub const PRESENTATION: &str = "ppt/presentation.xml";
/// Relationships of the root presentation document.
pub const PRESENTATION_RELS: &str = "ppt/_rels/presentation.xml.rels";

/// Parts every PPTX package must contain.
pub const REQUIRED_ENTRIES: [&str; 3] = [CONTENT_TYPES, ROOT_RELS, PRESENTATION];

/// Extensions recognised as images under `ppt/media/`.
const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "svg", "emf", "wmf", "tif", "tiff", "webp", "ico", "heic",
];

/// What an archive entry is, judged from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    ContentTypes,
    Relationships,
    Slide,
    Xml,
    Image,
    Media,
    Directory,
    Other,
}

/// One entry in the central directory.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub kind: EntryKind,
}

impl EntryInfo {
    /// Lowercase extension of the entry name, if any.
    pub fn extension(&self) -> Option<String> {
        let file = self.name.rsplit('/').next().unwrap_or(&self.name);
        file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
    }

    /// Whether the entry holds XML the pipeline can parse.
    pub fn is_xml(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::ContentTypes | EntryKind::Relationships | EntryKind::Slide | EntryKind::Xml
        )
    }

    /// Slide number for `ppt/slides/slideN.xml`.
    pub fn slide_number(&self) -> Option<usize> {
        if self.kind == EntryKind::Slide {
            extract_slide_number(&self.name)
        } else {
            None
        }
    }

    /// Uncompressed to compressed ratio; 0 for stored-empty entries.
    pub fn compression_ratio(&self) -> u64 {
        if self.compressed_size == 0 {
            0
        } else {
            self.size / self.compressed_size
        }
    }
}

/// Classify an entry from its path.
pub fn classify_entry(name: &str) -> EntryKind {
    if name.ends_with('/') {
        return EntryKind::Directory;
    }
    if name == CONTENT_TYPES {
        return EntryKind::ContentTypes;
    }

    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".rels") {
        return EntryKind::Relationships;
    }
    if let Some(rest) = lower.strip_prefix("ppt/slides/") {
        if !rest.contains('/') && rest.starts_with("slide") && rest.ends_with(".xml") {
            return EntryKind::Slide;
        }
    }
    if lower.ends_with(".xml") || lower.ends_with(".vml") {
        return EntryKind::Xml;
    }
    if lower.starts_with("ppt/media/") {
        let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        return if IMAGE_EXTENSIONS.contains(&ext) {
            EntryKind::Image
        } else {
            EntryKind::Media
        };
    }
    EntryKind::Other
}

/// Whether an entry name could escape an extraction root.
pub fn is_unsafe_path(name: &str) -> bool {
    let normalized = name.replace('\\', "/");
    normalized.starts_with('/')
        || normalized.split('/').any(|seg| seg == "..")
        || normalized.as_bytes().get(1) == Some(&b':')
}

/// Read-only view of a ZIP package held in memory.
pub struct PackageReader<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    entries: Vec<EntryInfo>,
}

impl<'a> PackageReader<'a> {
    /// Open the central directory. Any failure here means the container
    /// itself is unusable.
    pub fn open(bytes: &'a [u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| Error::ArchiveCorrupted(format!("Failed to open ZIP: {}", e)))?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| Error::ArchiveCorrupted(format!("Unreadable entry #{}: {}", index, e)))?;
            let name = file.name().to_string();
            entries.push(EntryInfo {
                index,
                kind: classify_entry(&name),
                name,
                size: file.size(),
                compressed_size: file.compressed_size(),
            });
        }

        Ok(Self { archive, entries })
    }

    /// All entries in central-directory order.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    /// Look up an entry by exact name.
    pub fn find(&self, name: &str) -> Option<&EntryInfo> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Slide entries ordered by slide number.
    pub fn slides(&self) -> Vec<&EntryInfo> {
        let mut slides: Vec<&EntryInfo> = self
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Slide)
            .collect();
        slides.sort_by_key(|e| (e.slide_number().unwrap_or(usize::MAX), e.name.clone()));
        slides
    }

    /// Decompress an entry, refusing to produce more than `limit` bytes.
    pub fn read_bounded(&mut self, index: usize, limit: u64) -> Result<Vec<u8>> {
        let file = self
            .archive
            .by_index(index)
            .map_err(|e| Error::ZipError(format!("Failed to open entry #{}: {}", index, e)))?;
        let name = file.name().to_string();

        let mut buf = Vec::new();
        file.take(limit.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| Error::ZipError(format!("Failed to read '{}': {}", name, e)))?;

        if buf.len() as u64 > limit {
            return Err(Error::SizeExceeded(format!(
                "entry '{}' inflates beyond {} bytes",
                name, limit
            )));
        }
        Ok(buf)
    }

    /// Decompress an XML entry as UTF-8 text.
    pub fn read_text(&mut self, index: usize, limit: u64) -> Result<String> {
        let bytes = self.read_bounded(index, limit)?;
        String::from_utf8(bytes)
            .map_err(|e| Error::XmlError(format!("entry #{} is not UTF-8: {}", index, e)))
    }

    /// Read an entry by name as text.
    pub fn read_text_by_name(&mut self, name: &str, limit: u64) -> Result<String> {
        let index = self
            .find(name)
            .map(|e| e.index)
            .ok_or_else(|| Error::StructuralError(format!("File not found in archive '{}'", name)))?;
        self.read_text(index, limit)
    }
}

/// Builds a new deflated archive. Timestamps are fixed so identical input
/// produces identical output.
pub struct PackageWriter {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl PackageWriter {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    /// Append one entry.
    pub fn add(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());
        self.writer
            .start_file(name, options)
            .map_err(|e| Error::ZipError(format!("Failed to start '{}': {}", name, e)))?;
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Finish the central directory and return the archive bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let cursor = self
            .writer
            .finish()
            .map_err(|e| Error::ZipError(format!("Failed to finish archive: {}", e)))?;
        Ok(cursor.into_inner())
    }
}

impl Default for PackageWriter {
    fn default() -> Self {
        Self::new()
    }
}
