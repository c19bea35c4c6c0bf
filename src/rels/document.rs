use std::borrow::Cow;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::ResolveResult;
use quick_xml::{NsReader, Writer};

use super::{model_name, resolve_entity, HAS_MODEL, MODEL_NS, RDF_NS, STRUCTURAL_NAMESPACES};
use crate::error::{GraphRepoError, Result};
use crate::pid::{is_valid_pid, strip_uri, to_uri};

/// Target of an edge as written in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeValue {
    /// `rdf:resource` reference, raw (scheme prefix kept).
    Resource(String),
    /// Element text.
    Literal(String),
}

/// One child element of `rdf:Description`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub namespace: String,
    pub local_name: String,
    pub value: EdgeValue,
}

impl Edge {
    pub fn resource(namespace: &str, local_name: &str, target_pid: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            local_name: local_name.to_string(),
            value: EdgeValue::Resource(to_uri(target_pid)),
        }
    }

    pub fn literal(namespace: &str, local_name: &str, text: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            local_name: local_name.to_string(),
            value: EdgeValue::Literal(text.to_string()),
        }
    }

    /// Target PID of a resource edge, scheme prefix stripped.
    pub fn target(&self) -> Option<&str> {
        match &self.value {
            EdgeValue::Resource(raw) => Some(strip_uri(raw)),
            EdgeValue::Literal(_) => None,
        }
    }

    pub fn is_structural(&self) -> bool {
        STRUCTURAL_NAMESPACES.contains(&self.namespace.as_str())
    }
}

/// Parsed relationship document: one subject and its outgoing edges in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDocument {
    pub subject: String,
    pub edges: Vec<Edge>,
}

fn namespace_of(resolved: &ResolveResult<'_>) -> Result<String> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(GraphRepoError::Parse(format!(
            "Undeclared namespace prefix: {}",
            String::from_utf8_lossy(prefix)
        ))),
    }
}

fn unescape_text(raw: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(raw);
    quick_xml::escape::unescape(&text)
        .map(Cow::into_owned)
        .map_err(|e| GraphRepoError::Parse(format!("Bad escape in {:?}: {}", text, e)))
}

/// Value of the attribute with the given local name (`rdf:about`, `rdf:resource`).
fn attribute_value(e: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| GraphRepoError::Parse(format!("Bad attribute: {}", e)))?;
        if attr.key.local_name().as_ref() == local {
            return unescape_text(&attr.value).map(Some);
        }
    }
    Ok(None)
}

/// Edge currently being read: (namespace, local name, resource, text).
type OpenEdge = (String, String, Option<String>, String);

fn finish_edge(open: OpenEdge) -> Edge {
    let (namespace, local_name, resource, text) = open;
    let value = match resource {
        Some(raw) => EdgeValue::Resource(raw),
        None => EdgeValue::Literal(text.trim().to_string()),
    };
    Edge { namespace, local_name, value }
}

impl RelationshipDocument {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            edges: Vec::new(),
        }
    }

    /// Parse an RDF/XML relationship document.
    ///
    /// Only the first `rdf:Description` is read; its direct children become edges.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = NsReader::from_str(xml);
        let mut buf = Vec::new();

        let mut depth = 0usize;
        let mut description_level: Option<usize> = None;
        let mut description_done = false;
        let mut subject: Option<String> = None;
        let mut edges = Vec::new();
        let mut open_edge: Option<OpenEdge> = None;

        loop {
            let (resolved, event) = reader
                .read_resolved_event_into(&mut buf)
                .map_err(|e| GraphRepoError::Parse(format!("XML parse error in relationship document: {}", e)))?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    let level = depth + 1;
                    let namespace = namespace_of(&resolved)?;
                    let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

                    match description_level {
                        None if !description_done && namespace == RDF_NS && local == "Description" => {
                            let about = attribute_value(e, b"about")?.ok_or_else(|| {
                                GraphRepoError::Parse("rdf:Description without rdf:about".to_string())
                            })?;
                            subject = Some(strip_uri(&about).to_string());
                            if is_empty {
                                description_done = true;
                            } else {
                                description_level = Some(level);
                            }
                        }
                        Some(d) if level == d + 1 => {
                            let resource = attribute_value(e, b"resource")?;
                            let edge = (namespace, local, resource, String::new());
                            if is_empty {
                                edges.push(finish_edge(edge));
                            } else {
                                open_edge = Some(edge);
                            }
                        }
                        _ => {}
                    }

                    if !is_empty {
                        depth = level;
                    }
                }
                Event::Text(ref t) => {
                    if let Some((_, _, _, text)) = open_edge.as_mut() {
                        text.push_str(&unescape_text(t.as_ref())?);
                    }
                }
                Event::CData(ref t) => {
                    if let Some((_, _, _, text)) = open_edge.as_mut() {
                        text.push_str(&String::from_utf8_lossy(t.as_ref()));
                    }
                }
                Event::GeneralRef(ref r) => {
                    if let Some((_, _, _, text)) = open_edge.as_mut() {
                        if let Some(resolved) = resolve_entity(&String::from_utf8_lossy(r.as_ref())) {
                            text.push_str(&resolved);
                        }
                    }
                }
                Event::End(_) => {
                    match description_level {
                        Some(d) if depth == d + 1 => {
                            if let Some(edge) = open_edge.take() {
                                edges.push(finish_edge(edge));
                            }
                        }
                        Some(d) if depth == d => {
                            description_level = None;
                            description_done = true;
                        }
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let subject = subject.ok_or_else(|| {
            GraphRepoError::Parse("Relationship document has no rdf:Description".to_string())
        })?;

        Ok(Self { subject, edges })
    }

    /// Serialize back to RDF/XML.
    pub fn to_xml(&self) -> Result<String> {
        fn write_err<E: std::fmt::Display>(e: E) -> GraphRepoError {
            GraphRepoError::Parse(format!("Failed to write relationship document: {}", e))
        }

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        let root = BytesStart::new("rdf:RDF").with_attributes([("xmlns:rdf", RDF_NS)]);
        writer.write_event(Event::Start(root)).map_err(write_err)?;

        let about = to_uri(&self.subject);
        let description = BytesStart::new("rdf:Description").with_attributes([("rdf:about", about.as_str())]);
        writer.write_event(Event::Start(description)).map_err(write_err)?;

        for edge in &self.edges {
            let mut start = BytesStart::new(edge.local_name.as_str());
            if !edge.namespace.is_empty() {
                start.push_attribute(("xmlns", edge.namespace.as_str()));
            }
            match &edge.value {
                EdgeValue::Resource(raw) => {
                    start.push_attribute(("rdf:resource", raw.as_str()));
                    writer.write_event(Event::Empty(start)).map_err(write_err)?;
                }
                EdgeValue::Literal(text) => {
                    writer.write_event(Event::Start(start)).map_err(write_err)?;
                    writer
                        .write_event(Event::Text(BytesText::new(text)))
                        .map_err(write_err)?;
                    writer
                        .write_event(Event::End(BytesEnd::new(edge.local_name.as_str())))
                        .map_err(write_err)?;
                }
            }
        }

        writer
            .write_event(Event::End(BytesEnd::new("rdf:Description")))
            .map_err(write_err)?;
        writer.write_event(Event::End(BytesEnd::new("rdf:RDF"))).map_err(write_err)?;

        String::from_utf8(writer.into_inner()).map_err(write_err)
    }

    /// Append an edge unless an identical one exists. Returns true if added.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if self.edges.contains(&edge) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    /// Remove resource edges `local_name -> target_pid`. Returns how many were removed.
    pub fn remove_edges(&mut self, local_name: &str, target_pid: &str) -> usize {
        let before = self.edges.len();
        self.edges
            .retain(|e| !(e.local_name == local_name && e.target() == Some(target_pid)));
        before - self.edges.len()
    }

    /// Model name from the `hasModel` edge, if any.
    pub fn model(&self) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.namespace == MODEL_NS && e.local_name == HAS_MODEL)
            .and_then(|e| e.target())
            .map(model_name)
    }

    /// Structural children in document order as (relation, pid).
    ///
    /// Literal edges, non-structural namespaces and targets that are not PIDs are skipped.
    pub fn structural_children(&self) -> Vec<(&str, &str)> {
        self.edges
            .iter()
            .filter(|e| e.is_structural())
            .filter_map(|e| e.target().map(|t| (e.local_name.as_str(), t)))
            .filter(|(_, t)| is_valid_pid(t))
            .collect()
    }
}
