//! Display title mining from Dublin Core metadata.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use super::{resolve_entity, DC_NS};

/// Outcome of scanning a metadata document for a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleScan {
    Found(String),
    NotFound,
    Malformed(String),
}

impl TitleScan {
    /// Title or empty string; a malformed document never blocks indexing.
    pub fn into_title(self) -> String {
        match self {
            TitleScan::Found(title) => title,
            TitleScan::NotFound | TitleScan::Malformed(_) => String::new(),
        }
    }
}

/// Scan `dc:title` elements. A language-tagged title wins and ends the scan,
/// otherwise the first untagged non-empty title is returned.
pub fn mine_title(xml: &str) -> TitleScan {
    let mut reader = NsReader::from_str(xml);
    let mut buf = Vec::new();
    let mut in_title: Option<bool> = None; // Some(has_lang) while inside dc:title
    let mut text = String::new();
    let mut first_untagged: Option<String> = None;

    loop {
        let event = match reader.read_resolved_event_into(&mut buf) {
            Ok(pair) => pair,
            Err(e) => return TitleScan::Malformed(e.to_string()),
        };
        match event {
            (ResolveResult::Bound(ns), Event::Start(ref e))
                if ns.as_ref() == DC_NS.as_bytes() && e.local_name().as_ref() == b"title" =>
            {
                let has_lang = e
                    .attributes()
                    .flatten()
                    .any(|a| a.key.as_ref() == b"xml:lang" && !a.value.is_empty());
                in_title = Some(has_lang);
                text.clear();
            }
            (_, Event::Text(ref t)) if in_title.is_some() => {
                match quick_xml::escape::unescape(&String::from_utf8_lossy(t.as_ref())) {
                    Ok(s) => text.push_str(&s),
                    Err(e) => return TitleScan::Malformed(e.to_string()),
                }
            }
            (_, Event::CData(ref t)) if in_title.is_some() => {
                text.push_str(&String::from_utf8_lossy(t.as_ref()));
            }
            (_, Event::GeneralRef(ref r)) if in_title.is_some() => {
                if let Some(resolved) = resolve_entity(&String::from_utf8_lossy(r.as_ref())) {
                    text.push_str(&resolved);
                }
            }
            (_, Event::End(_)) if in_title.is_some() => {
                let has_lang = in_title.take().unwrap_or(false);
                let title = text.trim();
                if !title.is_empty() {
                    if has_lang {
                        return TitleScan::Found(title.to_string());
                    }
                    if first_untagged.is_none() {
                        first_untagged = Some(title.to_string());
                    }
                }
            }
            (_, Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }

    match first_untagged {
        Some(title) => TitleScan::Found(title),
        None => TitleScan::NotFound,
    }
}
