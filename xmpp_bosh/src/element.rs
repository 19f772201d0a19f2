//! A minimal XML element tree.
//!
//! Inbound envelopes are parsed into [`Element`]s with [`quick_xml`], with
//! namespace prefixes resolved against the enclosing declarations so that a
//! `<stream:features/>` child of `<body xmlns:stream='…'>` reports the
//! streams namespace. Outbound XML is mostly written as text; the tree is
//! used on the way in.

use core::fmt;
use std::fmt::Write as _;

use quick_xml::{Reader, escape::escape, events::BytesStart, events::Event};

use crate::error::CodecError;

/// A child node of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A nested element.
    Element(Element),

    /// Character data (already unescaped).
    Text(String),
}

/// An XML element with resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

/// Namespace declarations introduced by one element: `(prefix, uri)`, with
/// the empty prefix standing for the default namespace.
type Scope = Vec<(String, String)>;

impl Element {
    /// Create an empty element with the given (possibly prefixed) name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Set the default namespace, emitting an `xmlns` attribute.
    #[must_use]
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.set_attr("xmlns", ns.clone());
        self.namespace = Some(ns);
        self
    }

    /// Add or replace an attribute.
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Append a child element.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Append character data.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Add or replace an attribute in place.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// The qualified name as written, e.g. `stream:features`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name without its prefix.
    #[must_use]
    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map_or(self.name.as_str(), |(_, local)| local)
    }

    /// The resolved namespace URI, if any was in scope.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Look up an attribute value by its qualified name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order.
    #[must_use]
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// All child nodes in document order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Self> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Consume the element, yielding its child elements.
    pub fn into_children(self) -> impl Iterator<Item = Self> {
        self.children.into_iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name.
    #[must_use]
    pub fn child(&self, local_name: &str) -> Option<&Self> {
        self.children().find(|c| c.local_name() == local_name)
    }

    /// First child element with the given local name and namespace.
    #[must_use]
    pub fn child_ns(&self, local_name: &str, ns: &str) -> Option<&Self> {
        self.children().find(|c| c.is(local_name, ns))
    }

    /// Whether this element has the given local name and namespace.
    #[must_use]
    pub fn is(&self, local_name: &str, ns: &str) -> bool {
        self.local_name() == local_name && self.namespace() == Some(ns)
    }

    /// Concatenated character data of the direct children.
    #[must_use]
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Parse a single element from a complete XML document.
    ///
    /// Anything after the root element closes is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the document is malformed or empty.
    pub fn parse(input: &str) -> Result<Self, CodecError> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Self> = Vec::new();
        let mut scopes: Vec<Scope> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let (el, scope) = Self::open(&start, &scopes)?;
                    scopes.push(scope);
                    stack.push(el);
                }
                Event::Empty(start) => {
                    let (el, _) = Self::open(&start, &scopes)?;
                    if let Some(root) = attach(&mut stack, el) {
                        return Ok(root);
                    }
                }
                Event::End(_) => {
                    scopes.pop();
                    let el = stack
                        .pop()
                        .ok_or_else(|| CodecError::Xml("unbalanced end tag".into()))?;
                    if let Some(root) = attach(&mut stack, el) {
                        return Ok(root);
                    }
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = text.unescape()?;
                        if !text.trim().is_empty() {
                            parent.children.push(Node::Text(text.into_owned()));
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                        parent.children.push(Node::Text(text));
                    }
                }
                Event::Eof => {
                    return Err(if stack.is_empty() {
                        CodecError::Empty
                    } else {
                        CodecError::UnexpectedEof
                    });
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            }
        }
    }

    fn open(start: &BytesStart<'_>, scopes: &[Scope]) -> Result<(Self, Scope), CodecError> {
        let name = utf8(start.name().as_ref())?.to_owned();
        let mut attributes = Vec::new();
        let mut scope = Scope::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| CodecError::Attribute(e.to_string()))?;
            let key = utf8(attr.key.as_ref())?.to_owned();
            let value = attr.unescape_value()?.into_owned();

            if key == "xmlns" {
                scope.push((String::new(), value.clone()));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                scope.push((prefix.to_owned(), value.clone()));
            }
            attributes.push((key, value));
        }

        let prefix = name.split_once(':').map_or("", |(p, _)| p);
        let namespace = scope
            .iter()
            .chain(scopes.iter().rev().flatten())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.clone());

        Ok((
            Self {
                name,
                namespace,
                attributes,
                children: Vec::new(),
            },
            scope,
        ))
    }

    /// Serialize the element (and its subtree) to XML text.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {key}='{}'", escape(value.as_str()));
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_xml(out),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Attach a finished element to its parent, or hand it back if it is the root.
fn attach(stack: &mut [Element], el: Element) -> Option<Element> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(el));
            None
        }
        None => Some(el),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, CodecError> {
    core::str::from_utf8(bytes).map_err(|e| CodecError::Xml(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_in_order() {
        let el = Element::parse("<a><b/><c x='1'/><d>hi</d></a>").expect("parse");
        let names: Vec<_> = el.children().map(Element::name).collect();
        assert_eq!(names, ["b", "c", "d"]);
        assert_eq!(el.child("c").and_then(|c| c.attr("x")), Some("1"));
        assert_eq!(el.child("d").map(Element::text).as_deref(), Some("hi"));
    }

    #[test]
    fn resolves_prefixed_namespace_from_ancestor() {
        let el = Element::parse(
            "<body xmlns='http://jabber.org/protocol/httpbind' \
             xmlns:stream='http://etherx.jabber.org/streams'>\
             <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>\
             </stream:features></body>",
        )
        .expect("parse");

        let features = el.child("features").expect("features");
        assert_eq!(features.name(), "stream:features");
        assert_eq!(features.namespace(), Some("http://etherx.jabber.org/streams"));
        assert!(features.child_ns("mechanisms", "urn:ietf:params:xml:ns:xmpp-sasl").is_some());
    }

    #[test]
    fn default_namespace_is_inherited() {
        let el = Element::parse("<iq xmlns='jabber:client'><query/></iq>").expect("parse");
        assert_eq!(
            el.child("query").and_then(Element::namespace),
            Some("jabber:client")
        );
    }

    #[test]
    fn unescapes_attributes_and_text() {
        let el = Element::parse("<m a='&lt;x&gt;'>a &amp; b</m>").expect("parse");
        assert_eq!(el.attr("a"), Some("<x>"));
        assert_eq!(el.text(), "a & b");
    }

    #[test]
    fn cdata_becomes_text() {
        let el = Element::parse("<m><![CDATA[<raw>]]></m>").expect("parse");
        assert_eq!(el.text(), "<raw>");
    }

    #[test]
    fn serializes_with_escaping() {
        let el = Element::new("message")
            .with_namespace("jabber:client")
            .with_attr("to", "a&b")
            .with_child(Element::new("body").with_text("1 < 2"));

        assert_eq!(
            el.to_xml(),
            "<message xmlns='jabber:client' to='a&amp;b'><body>1 &lt; 2</body></message>"
        );
    }

    #[test]
    fn reparse_of_serialized_element_is_equal() {
        let el = Element::new("iq")
            .with_namespace("jabber:client")
            .with_attr("id", "x")
            .with_child(Element::new("ping").with_namespace("urn:xmpp:ping"));

        assert_eq!(Element::parse(&el.to_xml()).expect("parse"), el);
    }

    #[test]
    fn rejects_empty_and_truncated_documents() {
        assert_eq!(Element::parse(""), Err(CodecError::Empty));
        assert_eq!(Element::parse("<a><b/>"), Err(CodecError::UnexpectedEof));
        assert!(Element::parse("<a></b>").is_err());
    }
}
