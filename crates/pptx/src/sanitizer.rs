//! Rule-based rewriting of PPTX packages.
//!
//! Each XML entry goes through the enabled text substitutions, then a single
//! streaming pass that removes targeted elements, XML comments and empty
//! leaves. Whole entries (macro binaries, executables, optionally hidden
//! slides) are dropped from the listing. A dropped slide is also unlinked from
//! the presentation, its relationships and the content-type manifest. The
//! output is re-compressed.
//!
//! Running the sanitizer on its own output reports zero further removals.

use ppt_core::{
    ArchiveHandle, Result, RuleCategory, SanitizationResult, SanitizeCounters, SanitizeOptions,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeSet;

use crate::archive::{EntryKind, PackageReader, PackageWriter, CONTENT_TYPES, PRESENTATION, PRESENTATION_RELS};
use crate::rules::{RuleAction, RuleTable};
use crate::xml::{local_name, profile_slide};

/// Upper bound on the bytes inflated from any single entry while rewriting.
const MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

/// Sanitizer driven by an ordered [`RuleTable`].
#[derive(Debug, Clone)]
pub struct Sanitizer {
    rules: RuleTable,
    entry_read_limit: u64,
}

impl Sanitizer {
    /// Create a sanitizer with the default rule table.
    pub fn new() -> Self {
        Self::with_rules(RuleTable::default())
    }

    /// Create a sanitizer with a custom rule table.
    pub fn with_rules(rules: RuleTable) -> Self {
        Self {
            rules,
            entry_read_limit: MAX_ENTRY_BYTES,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Rewrite an archive, returning the new archive and per-rule counts.
    pub fn sanitize(&self, archive: &ArchiveHandle, options: &SanitizeOptions) -> Result<SanitizationResult> {
        let enabled = |c: RuleCategory| options.is_enabled(c);
        let mut reader = PackageReader::open(archive.bytes())?;
        let mut writer = PackageWriter::new();

        let mut counters = SanitizeCounters::default();
        let mut dropped_entries = Vec::new();
        let mut skipped_entries = Vec::new();
        let mut warnings = Vec::new();

        let hidden = if self
            .rules
            .has_enabled(enabled, |a| matches!(a, RuleAction::DropHiddenSlides))
        {
            self.find_hidden_slides(&mut reader)?
        } else {
            BTreeSet::new()
        };
        let links = if hidden.is_empty() {
            None
        } else {
            Some(self.slide_links(&mut reader, &hidden))
        };

        let targets = self.rules.element_targets(enabled);
        let strip_comments = self
            .rules
            .has_enabled(enabled, |a| matches!(a, RuleAction::RemoveXmlComments));
        let prune_empty = self
            .rules
            .has_enabled(enabled, |a| matches!(a, RuleAction::RemoveEmptyLeaves));

        let entries = reader.entries().to_vec();
        for entry in entries {
            if entry.kind == EntryKind::Directory {
                continue;
            }

            if hidden.contains(&entry.name) {
                counters.hidden_slides_removed += 1;
                dropped_entries.push(entry.name.clone());
                continue;
            }
            if hidden.iter().any(|slide| entry.name == slide_rels_name(slide)) {
                dropped_entries.push(entry.name.clone());
                continue;
            }

            if let Some(category) = self.dropping_category(&entry.name, options) {
                bump(&mut counters, category, 1);
                log::debug!("dropping '{}' ({:?})", entry.name, category);
                dropped_entries.push(entry.name.clone());
                continue;
            }

            let mut bytes = reader.read_bounded(entry.index, self.entry_read_limit)?;
            if !entry.is_xml() {
                writer.add(&entry.name, &bytes)?;
                continue;
            }

            if let Some(links) = &links {
                if links.rewrites(&entry.name) {
                    match unlink(&bytes, |e| links.references(&entry.name, e)) {
                        Ok((_, 0)) => {}
                        Ok((unlinked, n)) => {
                            log::debug!("unlinked {} dropped slide references from '{}'", n, entry.name);
                            bytes = unlinked.into_bytes();
                        }
                        Err(msg) => {
                            log::warn!("could not unlink dropped slides from '{}': {}", entry.name, msg);
                            warnings.push(format!("{}: {}", entry.name, msg));
                        }
                    }
                }
            }

            match self.rewrite_xml(&bytes, options, &targets, strip_comments, prune_empty) {
                Ok((rewritten, entry_counters)) => {
                    counters.merge(&entry_counters);
                    writer.add(&entry.name, rewritten.as_bytes())?;
                }
                Err(msg) => {
                    log::warn!("skipping malformed entry '{}': {}", entry.name, msg);
                    warnings.push(format!("{}: {}", entry.name, msg));
                    skipped_entries.push(entry.name.clone());
                    writer.add(&entry.name, &bytes)?;
                }
            }
        }

        let output = writer.finish()?;
        let sanitized_size = output.len();
        log::debug!(
            "{}: {} rule hits, {} dropped, {} skipped, {} -> {} bytes",
            archive.name(),
            counters.total(),
            dropped_entries.len(),
            skipped_entries.len(),
            archive.size(),
            sanitized_size
        );

        Ok(SanitizationResult {
            archive: archive.replace_data(output),
            counters,
            dropped_entries,
            skipped_entries,
            warnings,
            original_size: archive.size(),
            sanitized_size,
        })
    }

    /// The category of the first enabled drop rule matching this entry name.
    fn dropping_category(&self, name: &str, options: &SanitizeOptions) -> Option<RuleCategory> {
        self.rules.entry_rules().find_map(|rule| match &rule.action {
            RuleAction::DropEntries { pattern }
                if options.is_enabled(rule.category) && pattern.is_match(name) =>
            {
                Some(rule.category)
            }
            _ => None,
        })
    }

    /// Slide entries whose root carries `show="0"`.
    fn find_hidden_slides(&self, reader: &mut PackageReader<'_>) -> Result<BTreeSet<String>> {
        let mut hidden = BTreeSet::new();
        let slides: Vec<(usize, String)> = reader
            .slides()
            .into_iter()
            .map(|e| (e.index, e.name.clone()))
            .collect();
        for (index, name) in slides {
            let Ok(text) = reader.read_text(index, self.entry_read_limit) else {
                continue;
            };
            if profile_slide(&text, usize::MAX).map(|p| p.hidden).unwrap_or(false) {
                hidden.insert(name);
            }
        }
        Ok(hidden)
    }

    /// Relationship ids in the presentation rels that point at a dropped slide.
    fn slide_links(&self, reader: &mut PackageReader<'_>, slides: &BTreeSet<String>) -> SlideLinks {
        let mut links = SlideLinks {
            slides: slides.clone(),
            rel_ids: BTreeSet::new(),
        };
        let Ok(rels) = reader.read_text_by_name(PRESENTATION_RELS, self.entry_read_limit) else {
            return links;
        };
        let mut xml = Reader::from_str(&rels);
        loop {
            match xml.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) if local_name(e.name().as_ref()) == b"Relationship" => {
                    let target = attribute(&e, |key| key == b"Target");
                    let id = attribute(&e, |key| key == b"Id");
                    if let (Some(target), Some(id)) = (target, id) {
                        if links.slides.contains(&resolve_target(&target)) {
                            links.rel_ids.insert(id);
                        }
                    }
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
        }
        links
    }

    /// Apply text rules then the element pass. Errors leave the entry untouched.
    fn rewrite_xml(
        &self,
        bytes: &[u8],
        options: &SanitizeOptions,
        targets: &[(&'static str, RuleCategory)],
        strip_comments: bool,
        prune_empty: bool,
    ) -> std::result::Result<(String, SanitizeCounters), String> {
        let text = std::str::from_utf8(bytes).map_err(|e| format!("not UTF-8: {}", e))?;
        let mut counters = SanitizeCounters::default();
        let mut current = text.to_string();

        for rule in self.rules.text_rules() {
            if !options.is_enabled(rule.category) {
                continue;
            }
            if let RuleAction::Replace { pattern, replacement } = &rule.action {
                let hits = pattern.find_iter(&current).count();
                if hits > 0 {
                    bump(&mut counters, rule.category, hits);
                    current = pattern.replace_all(&current, *replacement).into_owned();
                }
            }
        }

        let (cleaned, dom_counters) = clean_elements(&current, targets, strip_comments, prune_empty)?;
        counters.merge(&dom_counters);
        Ok((cleaned, counters))
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Slides dropped from the package and the relationship ids that named them.
struct SlideLinks {
    slides: BTreeSet<String>,
    rel_ids: BTreeSet<String>,
}

impl SlideLinks {
    fn rewrites(&self, entry: &str) -> bool {
        entry == PRESENTATION || entry == PRESENTATION_RELS || entry == CONTENT_TYPES
    }

    /// Whether this element in `entry` points at a dropped slide.
    fn references(&self, entry: &str, e: &BytesStart<'_>) -> bool {
        let name = e.name();
        let local = local_name(name.as_ref());
        match entry {
            PRESENTATION_RELS if local == b"Relationship" => {
                attribute(e, |key| key == b"Id").is_some_and(|id| self.rel_ids.contains(&id))
            }
            // `r:id`, not the numeric `id` every sldId carries
            PRESENTATION if local == b"sldId" => {
                attribute(e, |key| key != b"id" && local_name(key) == b"id")
                    .is_some_and(|id| self.rel_ids.contains(&id))
            }
            CONTENT_TYPES if local == b"Override" => attribute(e, |key| key == b"PartName")
                .is_some_and(|part| self.slides.contains(part.trim_start_matches('/'))),
            _ => false,
        }
    }
}

/// First attribute whose raw key satisfies `matches`.
fn attribute(e: &BytesStart<'_>, matches: impl Fn(&[u8]) -> bool) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| matches(a.key.as_ref()))
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// A presentation relationship target as a package entry name.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("ppt/{}", target.trim_start_matches("./")),
    }
}

/// Remove every element for which `matches` holds, with its subtree.
fn unlink(
    bytes: &[u8],
    matches: impl Fn(&BytesStart<'_>) -> bool,
) -> std::result::Result<(String, usize), String> {
    let xml = std::str::from_utf8(bytes).map_err(|e| format!("not UTF-8: {}", e))?;
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut removed = 0;
    let mut skip_depth = 0usize;
    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => return Err("document ended inside a removed element".to_string()),
                _ => {}
            }
            continue;
        }
        match event {
            Event::Start(e) if matches(&e) => {
                removed += 1;
                skip_depth = 1;
            }
            Event::Empty(e) if matches(&e) => removed += 1,
            Event::Eof => break,
            other => writer.write_event(other).map_err(|e| e.to_string())?,
        }
    }
    let out = String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())?;
    Ok((out, removed))
}

/// `ppt/slides/slide3.xml` -> `ppt/slides/_rels/slide3.xml.rels`.
fn slide_rels_name(slide: &str) -> String {
    match slide.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", slide),
    }
}

fn bump(counters: &mut SanitizeCounters, category: RuleCategory, n: usize) {
    let slot = match category {
        RuleCategory::Scripts => &mut counters.scripts_removed,
        RuleCategory::Macros => &mut counters.macros_removed,
        RuleCategory::ExternalLinks => &mut counters.external_links_removed,
        RuleCategory::Metadata => &mut counters.metadata_removed,
        RuleCategory::Comments => &mut counters.comments_removed,
        RuleCategory::EmptyElements => &mut counters.empty_elements_removed,
        RuleCategory::HiddenSlides => &mut counters.hidden_slides_removed,
    };
    *slot += n;
}

/// An open element whose start tag may not have been written yet.
struct Frame {
    start: BytesStart<'static>,
    written: bool,
}

/// Write every pending ancestor start tag, outermost first.
fn flush_pending(stack: &mut [Frame], writer: &mut Writer<Vec<u8>>) -> std::result::Result<(), String> {
    for frame in stack.iter_mut().filter(|f| !f.written) {
        writer
            .write_event(Event::Start(frame.start.clone()))
            .map_err(|e| e.to_string())?;
        frame.written = true;
    }
    Ok(())
}

/// Streaming element pass.
///
/// Start tags are held back until the element proves to have content (text,
/// a child that survives, a comment that is kept). An element that closes
/// without content and without attributes is dropped, which cascades to
/// parents within the same pass. The root element is always kept.
///
/// Only `<x></x>` pairs are pruned. Self-closing elements such as `<a:off/>`
/// or `<p:spTree/>` are required DrawingML markers and always stay, so a
/// `<d/>` leaf also keeps its parent alive.
fn clean_elements(
    xml: &str,
    targets: &[(&'static str, RuleCategory)],
    strip_comments: bool,
    prune_empty: bool,
) -> std::result::Result<(String, SanitizeCounters), String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut counters = SanitizeCounters::default();
    let mut stack: Vec<Frame> = Vec::new();
    let mut skip_depth = 0usize;

    let target_of = |e: &BytesStart<'_>| {
        let name = e.name();
        let local = local_name(name.as_ref());
        targets
            .iter()
            .find(|(t, _)| t.as_bytes() == local)
            .map(|(_, c)| *c)
    };
    let io = |e: quick_xml::Error| e.to_string();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("error at position {}: {}", reader.buffer_position(), e))?;

        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => return Err("document ended inside a removed element".to_string()),
                _ => {}
            }
            continue;
        }

        match event {
            Event::Start(e) => {
                if let Some(category) = target_of(&e) {
                    bump(&mut counters, category, 1);
                    skip_depth = 1;
                    continue;
                }
                let mut frame = Frame {
                    start: e.into_owned(),
                    written: false,
                };
                if !prune_empty {
                    flush_pending(&mut stack, &mut writer)?;
                    writer.write_event(Event::Start(frame.start.clone())).map_err(io)?;
                    frame.written = true;
                }
                stack.push(frame);
            }
            Event::Empty(e) => {
                if let Some(category) = target_of(&e) {
                    bump(&mut counters, category, 1);
                    continue;
                }
                flush_pending(&mut stack, &mut writer)?;
                writer.write_event(Event::Empty(e)).map_err(io)?;
            }
            Event::End(e) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| "closing tag without an open element".to_string())?;
                if frame.written {
                    writer.write_event(Event::End(e)).map_err(io)?;
                } else if stack.is_empty() || frame.start.attributes().next().is_some() {
                    flush_pending(&mut stack, &mut writer)?;
                    writer.write_event(Event::Start(frame.start)).map_err(io)?;
                    writer.write_event(Event::End(e)).map_err(io)?;
                } else {
                    counters.empty_elements_removed += 1;
                }
            }
            Event::Comment(c) => {
                if strip_comments {
                    counters.comments_removed += 1;
                } else {
                    flush_pending(&mut stack, &mut writer)?;
                    writer.write_event(Event::Comment(c)).map_err(io)?;
                }
            }
            Event::Eof => break,
            other => {
                flush_pending(&mut stack, &mut writer)?;
                writer.write_event(other).map_err(io)?;
            }
        }
    }

    if !stack.is_empty() {
        return Err("document ended with unclosed elements".to_string());
    }

    let out = String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())?;
    Ok((out, counters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PackageReader;

    fn targets() -> Vec<(&'static str, RuleCategory)> {
        RuleTable::default().element_targets(|_| true)
    }

    fn package(entries: &[(&str, &str)]) -> ArchiveHandle {
        let mut writer = PackageWriter::new();
        for (name, body) in entries {
            writer.add(name, body.as_bytes()).unwrap();
        }
        ArchiveHandle::new("deck.pptx", writer.finish().unwrap())
    }

    fn read(archive: &ArchiveHandle, name: &str) -> Option<String> {
        let mut reader = PackageReader::open(archive.bytes()).unwrap();
        reader.read_text_by_name(name, 1 << 20).ok()
    }

    #[test]
    fn test_clean_elements_removes_targets_and_comments() {
        let xml = r#"<?xml version="1.0"?><cp:coreProperties xmlns:cp="c" xmlns:dc="d"><dc:title>Deck</dc:title><dc:creator>Alice</dc:creator><!-- note --><cp:lastModifiedBy>Bob</cp:lastModifiedBy></cp:coreProperties>"#;
        let (out, counters) = clean_elements(xml, &targets(), true, true).unwrap();

        assert_eq!(
            out,
            r#"<?xml version="1.0"?><cp:coreProperties xmlns:cp="c" xmlns:dc="d"><dc:title>Deck</dc:title></cp:coreProperties>"#
        );
        assert_eq!(counters.metadata_removed, 2);
        assert_eq!(counters.comments_removed, 1);
    }

    #[test]
    fn test_empty_leaves_cascade_in_one_pass() {
        let xml = r#"<root><a><b></b></a><c x="1"></c><d/><e>text</e></root>"#;
        let (out, counters) = clean_elements(xml, &[], false, true).unwrap();

        assert_eq!(out, r#"<root><c x="1"></c><d/><e>text</e></root>"#);
        assert_eq!(counters.empty_elements_removed, 2);

        let (again, second) = clean_elements(&out, &[], false, true).unwrap();
        assert_eq!(again, out);
        assert_eq!(second.total(), 0);
    }

    #[test]
    fn test_root_is_never_pruned() {
        let (out, counters) = clean_elements("<root></root>", &[], false, true).unwrap();
        assert_eq!(out, "<root></root>");
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn test_whitespace_text_is_content() {
        let xml = "<a:p><a:r><a:t> </a:t></a:r></a:p>";
        let (out, counters) = clean_elements(xml, &[], false, true).unwrap();
        assert_eq!(out, xml);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn test_clean_elements_rejects_malformed() {
        assert!(clean_elements("<a><b></a>", &[], false, true).is_err());
        assert!(clean_elements("<a><b>", &[], false, true).is_err());
    }

    #[test]
    fn test_sanitize_external_link_and_script() {
        let rels = r#"<Relationships><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com/x" TargetMode="External"/></Relationships>"#;
        let slide = r#"<p:sld xmlns:p="p"><p:cSld><p:spTree><a:hlinkClick action="javascript:alert(1)"/></p:spTree></p:cSld></p:sld>"#;
        let archive = package(&[
            ("ppt/slides/slide1.xml", slide),
            ("ppt/slides/_rels/slide1.xml.rels", rels),
        ]);

        let result = Sanitizer::new().sanitize(&archive, &SanitizeOptions::default()).unwrap();
        assert_eq!(result.counters.external_links_removed, 1);
        assert_eq!(result.counters.scripts_removed, 1);

        let rewritten = read(&result.archive, "ppt/slides/_rels/slide1.xml.rels").unwrap();
        assert!(rewritten.contains(r##"Target="#""##));
        assert!(!rewritten.contains("example.com"));
        let slide_out = read(&result.archive, "ppt/slides/slide1.xml").unwrap();
        assert!(slide_out.contains(r##"action="#""##));
    }

    #[test]
    fn test_sanitize_drops_macros() {
        let content_types = r#"<Types><Default Extension="bin" ContentType="application/vnd.ms-office.vbaProject"/><Override PartName="/ppt/presentation.xml" ContentType="application/vnd.ms-powerpoint.presentation.macroEnabled.main+xml"/></Types>"#;
        let rels = r#"<Relationships><Relationship Id="rId9" Type="http://schemas.microsoft.com/office/2006/relationships/vbaProject" Target="vbaProject.bin"/></Relationships>"#;
        let archive = package(&[
            ("[Content_Types].xml", content_types),
            ("ppt/_rels/presentation.xml.rels", rels),
            ("ppt/vbaProject.bin", "binary"),
            ("ppt/embeddings/tool.exe", "MZ"),
        ]);

        let result = Sanitizer::new().sanitize(&archive, &SanitizeOptions::default()).unwrap();
        assert_eq!(result.dropped_entries, vec!["ppt/vbaProject.bin", "ppt/embeddings/tool.exe"]);
        // two entries, one relationship, one content-type default, one main content type
        assert_eq!(result.counters.macros_removed, 5);

        let types = read(&result.archive, "[Content_Types].xml").unwrap();
        assert!(!types.contains("macroEnabled"));
        assert!(!types.contains("vbaProject"));
        assert!(types.contains("presentationml.presentation.main+xml"));
        assert!(read(&result.archive, "ppt/vbaProject.bin").is_none());
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let core = r#"<cp:coreProperties xmlns:cp="c" xmlns:dc="d"><dc:creator>Alice</dc:creator><dc:title>T</dc:title></cp:coreProperties>"#;
        let slide = r#"<p:sld xmlns:p="p"><p:cSld><p:spTree><p:extLst></p:extLst><script>alert(1)</script></p:spTree></p:cSld></p:sld>"#;
        let rels = r#"<Relationships><Relationship Target="http://x.example" TargetMode="External"/></Relationships>"#;
        let archive = package(&[
            ("docProps/core.xml", core),
            ("ppt/slides/slide1.xml", slide),
            ("ppt/slides/_rels/slide1.xml.rels", rels),
            ("ppt/vbaProject.bin", "x"),
        ]);

        let sanitizer = Sanitizer::new();
        let first = sanitizer.sanitize(&archive, &SanitizeOptions::default()).unwrap();
        assert!(first.counters.total() >= 4);

        let second = sanitizer.sanitize(&first.archive, &SanitizeOptions::default()).unwrap();
        assert_eq!(second.counters.total(), 0);
        assert!(second.dropped_entries.is_empty());
        assert_eq!(second.archive.bytes(), first.archive.bytes());
    }

    #[test]
    fn test_malformed_entry_is_skipped_not_fatal() {
        let broken = "<p:sld><p:cSld></p:sld>";
        let rels = r#"<Relationships><Relationship Target="https://x.example" TargetMode="External"/></Relationships>"#;
        let archive = package(&[
            ("ppt/slides/slide1.xml", broken),
            ("ppt/slides/_rels/slide1.xml.rels", rels),
        ]);

        let result = Sanitizer::new().sanitize(&archive, &SanitizeOptions::default()).unwrap();
        assert!(result.is_partial());
        assert_eq!(result.skipped_entries, vec!["ppt/slides/slide1.xml"]);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.counters.external_links_removed, 1);
        assert_eq!(read(&result.archive, "ppt/slides/slide1.xml").unwrap(), broken);
    }

    #[test]
    fn test_hidden_slides_only_when_enabled() {
        let hidden = r#"<p:sld xmlns:p="p" show="0"><p:cSld><p:spTree/></p:cSld></p:sld>"#;
        let visible = r#"<p:sld xmlns:p="p"><p:cSld><p:spTree/></p:cSld></p:sld>"#;
        let content_types = r#"<Types><Override PartName="/ppt/presentation.xml" ContentType="main"/><Override PartName="/ppt/slides/slide1.xml" ContentType="slide"/><Override PartName="/ppt/slides/slide2.xml" ContentType="slide"/></Types>"#;
        let presentation = r#"<p:presentation xmlns:p="p" xmlns:r="r"><p:sldIdLst><p:sldId id="256" r:id="rId2"/><p:sldId id="257" r:id="rId3"/></p:sldIdLst></p:presentation>"#;
        let rels = r#"<Relationships><Relationship Id="rId1" Type="theme" Target="theme/theme1.xml"/><Relationship Id="rId2" Type="slide" Target="slides/slide1.xml"/><Relationship Id="rId3" Type="slide" Target="slides/slide2.xml"/></Relationships>"#;
        let archive = package(&[
            ("[Content_Types].xml", content_types),
            ("ppt/presentation.xml", presentation),
            ("ppt/_rels/presentation.xml.rels", rels),
            ("ppt/slides/slide1.xml", visible),
            ("ppt/slides/slide2.xml", hidden),
            ("ppt/slides/_rels/slide2.xml.rels", "<Relationships/>"),
        ]);

        let default = Sanitizer::new().sanitize(&archive, &SanitizeOptions::default()).unwrap();
        assert_eq!(default.counters.hidden_slides_removed, 0);

        let options = SanitizeOptions::default().with(RuleCategory::HiddenSlides);
        let result = Sanitizer::new().sanitize(&archive, &options).unwrap();
        assert_eq!(result.counters.hidden_slides_removed, 1);
        assert_eq!(
            result.dropped_entries,
            vec!["ppt/slides/slide2.xml", "ppt/slides/_rels/slide2.xml.rels"]
        );
        assert!(read(&result.archive, "ppt/slides/slide1.xml").is_some());

        let rels_out = read(&result.archive, "ppt/_rels/presentation.xml.rels").unwrap();
        assert!(!rels_out.contains("slide2.xml"));
        assert!(rels_out.contains(r#"Id="rId1""#) && rels_out.contains(r#"Id="rId2""#));
        let presentation_out = read(&result.archive, "ppt/presentation.xml").unwrap();
        assert!(!presentation_out.contains("rId3"));
        assert!(presentation_out.contains(r#"r:id="rId2""#));
        let types_out = read(&result.archive, "[Content_Types].xml").unwrap();
        assert!(!types_out.contains("/ppt/slides/slide2.xml"));
        assert!(types_out.contains("/ppt/slides/slide1.xml"));

        let untouched = read(&default.archive, "ppt/_rels/presentation.xml.rels").unwrap();
        assert!(untouched.contains("slides/slide2.xml"));
    }

    #[test]
    fn test_unlink_removes_matching_subtrees() {
        let xml = r#"<root><keep/><drop><child/></drop><drop/><keep>text</keep></root>"#;
        let (out, removed) = unlink(xml.as_bytes(), |e| e.name().as_ref() == b"drop").unwrap();
        assert_eq!(out, "<root><keep/><keep>text</keep></root>");
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_self_closing_markers_survive_pruning() {
        let xml = r#"<a:xfrm><a:off/><a:ext></a:ext></a:xfrm>"#;
        let (out, counters) = clean_elements(xml, &[], false, true).unwrap();
        assert_eq!(out, "<a:xfrm><a:off/></a:xfrm>");
        assert_eq!(counters.empty_elements_removed, 1);
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target("slides/slide2.xml"), "ppt/slides/slide2.xml");
        assert_eq!(resolve_target("/ppt/slides/slide2.xml"), "ppt/slides/slide2.xml");
    }

    #[test]
    fn test_disabled_categories_are_left_alone() {
        let rels = r#"<Relationships><Relationship Target="https://x.example" TargetMode="External"/></Relationships>"#;
        let archive = package(&[("ppt/slides/_rels/slide1.xml.rels", rels)]);

        let options = SanitizeOptions::none();
        let result = Sanitizer::new().sanitize(&archive, &options).unwrap();
        assert_eq!(result.counters.total(), 0);
        assert_eq!(read(&result.archive, "ppt/slides/_rels/slide1.xml.rels").unwrap(), rels);
    }

    #[test]
    fn test_slide_rels_name() {
        assert_eq!(slide_rels_name("ppt/slides/slide2.xml"), "ppt/slides/_rels/slide2.xml.rels");
    }
}
