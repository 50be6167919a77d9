//! Small XML helpers shared by the validator, sanitizer and extractor.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Extract the local name from a potentially namespaced XML element name.
pub fn local_name(name: &[u8]) -> &[u8] {
    if let Some(pos) = name.iter().position(|&b| b == b':') {
        &name[pos + 1..]
    } else {
        name
    }
}

/// Extract a slide number from a string like "rId2" or "slide3.xml".
pub fn extract_slide_number(s: &str) -> Option<usize> {
    let s = s.trim_end_matches(".xml").trim_end_matches(".rels");

    let digits: String = s.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let digits: String = digits.chars().rev().collect();
    digits.parse().ok()
}

/// Value of an attribute by its (local) name, lossily decoded.
pub fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| local_name(a.key.as_ref()) == key)
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

/// Structural facts about one slide document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlideProfile {
    /// Deepest nesting seen (stops growing once the limit is hit).
    pub max_depth: usize,
    /// Parsing stopped because `max_depth` passed the limit.
    pub depth_exceeded: bool,
    pub has_common_slide_data: bool,
    pub has_shape_tree: bool,
    /// Root carries `show="0"`.
    pub hidden: bool,
}

/// Walk a slide document, tracking depth and the required `cSld`/`spTree`
/// children. Parsing stops as soon as `depth_limit` is exceeded so deeply
/// nested payloads cost bounded work.
pub fn profile_slide(xml: &str, depth_limit: usize) -> Result<SlideProfile, String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut profile = SlideProfile::default();
    let mut depth = 0usize;
    let mut in_csld = false;
    let mut csld_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                profile.max_depth = profile.max_depth.max(depth);
                if depth > depth_limit {
                    profile.depth_exceeded = true;
                    return Ok(profile);
                }
                if inspect_element(e, depth, in_csld, &mut profile) {
                    in_csld = true;
                    csld_depth = depth;
                }
            }
            Ok(Event::Empty(ref e)) => {
                let depth = depth + 1;
                profile.max_depth = profile.max_depth.max(depth);
                if depth > depth_limit {
                    profile.depth_exceeded = true;
                    return Ok(profile);
                }
                inspect_element(e, depth, in_csld, &mut profile);
            }
            Ok(Event::End(_)) => {
                if in_csld && depth == csld_depth {
                    in_csld = false;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(format!(
                    "error at position {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err("document ended with unclosed elements".to_string());
    }
    Ok(profile)
}

/// Record what a single element tells us. Returns true when it opens `cSld`.
fn inspect_element(e: &BytesStart<'_>, depth: usize, in_csld: bool, profile: &mut SlideProfile) -> bool {
    let name = e.name();
    match local_name(name.as_ref()) {
        b"sld" if depth == 1 => {
            profile.hidden = attr_value(e, b"show").as_deref() == Some("0");
            false
        }
        b"cSld" if depth == 2 => {
            profile.has_common_slide_data = true;
            true
        }
        b"spTree" if in_csld => {
            profile.has_shape_tree = true;
            false
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLIDE: &str = r#"<?xml version="1.0"?>
<p:sld xmlns:p="p" xmlns:a="a"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>Hi</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#;

    #[test]
    fn test_extract_slide_number() {
        assert_eq!(extract_slide_number("rId1"), Some(1));
        assert_eq!(extract_slide_number("rId12"), Some(12));
        assert_eq!(extract_slide_number("slide1.xml"), Some(1));
        assert_eq!(extract_slide_number("ppt/slides/slide123.xml"), Some(123));
        assert_eq!(extract_slide_number("nodigits"), None);
    }

    #[test]
    fn test_local_name() {
        assert_eq!(local_name(b"p:sp"), b"sp");
        assert_eq!(local_name(b"a:t"), b"t");
        assert_eq!(local_name(b"sp"), b"sp");
    }

    #[test]
    fn test_profile_well_formed_slide() {
        let profile = profile_slide(SLIDE, 64).unwrap();
        assert!(profile.has_common_slide_data);
        assert!(profile.has_shape_tree);
        assert!(!profile.hidden);
        assert!(!profile.depth_exceeded);
        assert_eq!(profile.max_depth, 8);
    }

    #[test]
    fn test_profile_missing_shape_tree_and_hidden() {
        let xml = r#"<p:sld xmlns:p="p" show="0"><p:cSld/></p:sld>"#;
        let profile = profile_slide(xml, 64).unwrap();
        assert!(profile.hidden);
        assert!(profile.has_common_slide_data);
        assert!(!profile.has_shape_tree);
    }

    #[test]
    fn test_profile_stops_at_depth_limit() {
        let mut xml = String::from("<p:sld>");
        for _ in 0..500 {
            xml.push_str("<x>");
        }
        let profile = profile_slide(&xml, 32).unwrap();
        assert!(profile.depth_exceeded);
        assert_eq!(profile.max_depth, 33);
    }

    #[test]
    fn test_profile_malformed() {
        assert!(profile_slide("<p:sld><p:cSld></p:sld>", 64).is_err());
        assert!(profile_slide("<p:sld><p:cSld>", 64).is_err());
    }
}
