//! Text, media and document-property extraction from sanitized packages.

use async_trait::async_trait;
use ppt_core::{
    ArchiveHandle, Error, ExtractedSlide, Presentation, ProcessingWorker, Result, WorkerOptions,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;

use crate::archive::{EntryKind, PackageReader, PRESENTATION_RELS};
use crate::xml::{attr_value, extract_slide_number, local_name};

/// Parts scanned for document properties.
const PROPERTY_PARTS: [&str; 2] = ["docProps/core.xml", "docProps/app.xml"];

/// Extracts slide text in presentation order.
#[derive(Debug, Clone)]
pub struct PptxExtractor {
    entry_read_limit: u64,
}

impl PptxExtractor {
    pub fn new() -> Self {
        Self {
            entry_read_limit: 64 * 1024 * 1024,
        }
    }

    /// Cap the inflated size of any single part read during extraction.
    pub fn with_entry_read_limit(mut self, limit: u64) -> Self {
        self.entry_read_limit = limit;
        self
    }

    /// Extract content synchronously.
    pub fn extract(&self, bytes: &[u8], filename: &str, options: &WorkerOptions) -> Result<Presentation> {
        let mut reader = PackageReader::open(bytes)?;
        let mut presentation = Presentation::new(filename);

        let order = self.slide_order(&mut reader)?;
        let batch_size = options.batch_size.max(1);
        for (batch_index, batch) in order.chunks(batch_size).enumerate() {
            log::debug!(
                "{}: extracting slide batch {} ({} slides)",
                filename,
                batch_index + 1,
                batch.len()
            );
            for (offset, path) in batch.iter().enumerate() {
                let number = batch_index * batch_size + offset + 1;
                let slide = if options.extract_text {
                    let content = reader.read_text_by_name(path, self.entry_read_limit)?;
                    slide_from_xml(&content, number)
                } else {
                    ExtractedSlide::new(number)
                };
                presentation.add_slide(slide);
            }
        }

        if options.extract_images {
            presentation.media = reader
                .entries()
                .iter()
                .filter(|e| matches!(e.kind, EntryKind::Image | EntryKind::Media))
                .map(|e| e.name.clone())
                .collect();
        }

        if options.extract_metadata {
            for part in PROPERTY_PARTS {
                if !reader.contains(part) {
                    continue;
                }
                let content = reader.read_text_by_name(part, self.entry_read_limit)?;
                presentation.metadata.extend(read_properties(&content));
            }
        }

        Ok(presentation)
    }

    /// Slide part paths in presentation order.
    ///
    /// Taken from the presentation relationships when present, otherwise
    /// from the slide parts' own numbering.
    fn slide_order(&self, reader: &mut PackageReader<'_>) -> Result<Vec<String>> {
        if !reader.contains(PRESENTATION_RELS) {
            log::warn!("{} missing, ordering slides by part name", PRESENTATION_RELS);
            return Ok(reader.slides().into_iter().map(|e| e.name.clone()).collect());
        }

        let rels = reader.read_text_by_name(PRESENTATION_RELS, self.entry_read_limit)?;
        let mut slides = slide_relationships(&rels)?;
        slides.sort_by(|a, b| match (a.1, b.1) {
            (Some(na), Some(nb)) => na.cmp(&nb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.0.cmp(&b.0),
        });

        Ok(slides
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| reader.contains(path))
            .collect())
    }
}

impl Default for PptxExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessingWorker for PptxExtractor {
    async fn process(&self, payload: &ArchiveHandle, options: &WorkerOptions) -> Result<Presentation> {
        let extractor = self.clone();
        let data = payload.data();
        let name = payload.name().to_string();
        let options = options.clone();

        tokio::task::spawn_blocking(move || extractor.extract(&data, &name, &options))
            .await
            .map_err(|e| Error::WorkerCrashed(format!("extraction task failed: {}", e)))?
    }

    fn name(&self) -> &str {
        "pptx-extractor"
    }
}

/// Slide relationships as `(part path, ordering number)`.
fn slide_relationships(rels: &str) -> Result<Vec<(String, Option<usize>)>> {
    let mut reader = Reader::from_str(rels);
    reader.trim_text(true);
    let mut slides = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if local_name(e.name().as_ref()) == b"Relationship" =>
            {
                let rel_type = attr_value(e, b"Type").unwrap_or_default();
                if !rel_type.ends_with("/slide") {
                    continue;
                }
                let target = attr_value(e, b"Target").unwrap_or_default();
                let id = attr_value(e, b"Id").unwrap_or_default();
                let order = extract_slide_number(&id).or_else(|| extract_slide_number(&target));
                let path = match target.strip_prefix('/') {
                    Some(absolute) => absolute.to_string(),
                    None => format!("ppt/{}", target),
                };
                slides.push((path, order));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::XmlError(format!("Error parsing relationships: {}", e)));
            }
            _ => {}
        }
    }

    Ok(slides)
}

/// A shape's text and top-left offset.
#[derive(Debug, Default)]
struct ShapeInfo {
    text: String,
    x: f64,
    y: f64,
}

impl ShapeInfo {
    fn read_offset(&mut self, e: &BytesStart<'_>) {
        if let Some(x) = attr_value(e, b"x").and_then(|v| v.parse().ok()) {
            self.x = x;
        }
        if let Some(y) = attr_value(e, b"y").and_then(|v| v.parse().ok()) {
            self.y = y;
        }
    }
}

/// Build a slide from its XML, lines ordered top-to-bottom then left-to-right.
fn slide_from_xml(xml: &str, number: usize) -> ExtractedSlide {
    let mut slide = ExtractedSlide::new(number);
    for shape in shapes_from_xml(xml) {
        slide.add_line_with_position(shape.text, shape.y, shape.x);
    }
    slide.sort_by_position();
    slide
}

/// Shapes carrying text. Parse errors end the walk with what was collected.
fn shapes_from_xml(xml: &str) -> Vec<ShapeInfo> {
    let mut shapes = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut current: Option<ShapeInfo> = None;
    let mut in_text_body = false;
    let mut in_paragraph = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match local_name(e.name().as_ref()) {
                b"sp" | b"pic" => current = Some(ShapeInfo::default()),
                b"off" => {
                    if let Some(shape) = current.as_mut() {
                        shape.read_offset(e);
                    }
                }
                b"txBody" => in_text_body = true,
                b"p" if in_text_body => {
                    in_paragraph = true;
                    if !text.is_empty() {
                        text.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) if local_name(e.name().as_ref()) == b"off" => {
                if let Some(shape) = current.as_mut() {
                    shape.read_offset(e);
                }
            }
            Ok(Event::Text(ref e)) if in_paragraph => {
                text.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(Event::End(ref e)) => match local_name(e.name().as_ref()) {
                b"sp" | b"pic" => {
                    if let Some(mut shape) = current.take() {
                        shape.text = text.trim().to_string();
                        if !shape.text.is_empty() {
                            shapes.push(shape);
                        }
                    }
                    text.clear();
                    in_text_body = false;
                    in_paragraph = false;
                }
                b"txBody" => in_text_body = false,
                b"p" => in_paragraph = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!("slide XML error at {}: {}", reader.buffer_position(), e);
                break;
            }
            _ => {}
        }
    }

    shapes
}

/// Leaf element text from a document-properties part, keyed by local name.
fn read_properties(xml: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut depth = 0usize;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                // children of the root only
                current = (depth == 2)
                    .then(|| String::from_utf8_lossy(local_name(e.name().as_ref())).to_string());
            }
            Ok(Event::Text(ref e)) => {
                if let Some(key) = current.as_ref() {
                    let value = e.unescape().unwrap_or_default().trim().to_string();
                    if !value.is_empty() {
                        properties.insert(key.clone(), value);
                    }
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                current = None;
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    properties
}
