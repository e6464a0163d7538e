//! Minimal element tree over quick-xml events.
//!
//! Robot descriptions and COLLADA documents are small enough to hold in memory, and both are
//! easier to walk as a tree than as a stream: URDF joints reference links declared anywhere in
//! the document, COLLADA instances reference geometry by id.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML near byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("document has no root element")]
    Empty,
    #[error("element <{0}> is never closed")]
    Unclosed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    /// Local name, namespace prefix stripped.
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    /// Concatenated text content directly inside this element.
    pub text: String,
}

impl XmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Depth-first search over all descendants, self excluded.
    pub fn find_descendant(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(name) {
                return Some(found);
            }
        }
        None
    }

    fn from_start(start: &BytesStart) -> Self {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let attributes = start
            .attributes()
            .flatten()
            .map(|attr| {
                let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                let value = attr
                    .unescape_value()
                    .map(|value| value.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                (key, value)
            })
            .collect();
        Self { name, attributes, children: Vec::new(), text: String::new() }
    }
}

/// Parses a whole document and returns its root element.
pub fn parse_document(bytes: &[u8]) -> Result<XmlElement, XmlError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|err| XmlError::Malformed {
            position: reader.buffer_position() as u64,
            message: err.to_string(),
        })?;
        match event {
            Event::Start(ref start) => stack.push(XmlElement::from_start(start)),
            Event::Empty(ref start) => {
                let element = XmlElement::from_start(start);
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Event::Text(ref text) => {
                if let Some(current) = stack.last_mut() {
                    let value = text
                        .unescape()
                        .map(|value| value.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(text).into_owned());
                    push_text(&mut current.text, &value);
                }
            }
            Event::CData(ref data) => {
                if let Some(current) = stack.last_mut() {
                    push_text(&mut current.text, &String::from_utf8_lossy(data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.pop() {
        return Err(XmlError::Unclosed(open.name));
    }
    root.ok_or(XmlError::Empty)
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

fn push_text(target: &mut String, value: &str) {
    if value.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(value);
}

/// Parses whitespace separated floats, as used by URDF vectors and COLLADA arrays.
pub fn parse_floats(text: &str) -> Option<Vec<f32>> {
    text.split_whitespace().map(|part| part.parse::<f32>().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tree_with_attributes_and_text() {
        let doc = br#"<?xml version="1.0"?>
            <root a="1">
                <item name="x"/>
                <item name="y">hello &amp; bye</item>
                <other/>
            </root>"#;
        let root = parse_document(doc).expect("parse");
        assert_eq!(root.name, "root");
        assert_eq!(root.attr("a"), Some("1"));
        let names: Vec<_> = root.children_named("item").filter_map(|item| item.attr("name")).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(root.children[1].text, "hello & bye");
        assert!(root.child("other").is_some());
    }

    #[test]
    fn unclosed_element_is_an_error() {
        let err = parse_document(b"<robot><link name=\"a\">").expect_err("unclosed");
        assert!(matches!(err, XmlError::Unclosed(_) | XmlError::Malformed { .. }));
    }

    #[test]
    fn empty_document_is_an_error() {
        assert!(matches!(parse_document(b"   ").expect_err("empty"), XmlError::Empty));
    }

    #[test]
    fn parses_float_lists() {
        assert_eq!(parse_floats("1 2.5\n-3"), Some(vec![1.0, 2.5, -3.0]));
        assert_eq!(parse_floats("1 nope"), None);
    }
}
