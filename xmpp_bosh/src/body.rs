//! The BOSH `<body/>` envelope.
//!
//! Requests are written directly as text since their payload is already
//! serialized stanza XML. Responses are parsed into a [`ResponseBody`] that
//! exposes the session attributes and the child stanzas in document order.

use core::time::Duration;
use std::fmt::Write as _;

use quick_xml::escape::escape;

use crate::{element::Element, error::CodecError, session::Rid, stanza::StanzaKind};

/// BOSH namespace.
pub const NS_HTTPBIND: &str = "http://jabber.org/protocol/httpbind";

/// XEP-0206 attribute namespace (`xmpp:` prefix).
pub const NS_XBOSH: &str = "urn:xmpp:xbosh";

/// An outbound `<body/>` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    attributes: Vec<(&'static str, String)>,
    payload: String,
}

impl RequestBody {
    /// Start an envelope for the given request id.
    #[must_use]
    pub fn new(rid: Rid) -> Self {
        Self {
            attributes: vec![("rid", rid.to_string()), ("xmlns", NS_HTTPBIND.to_owned())],
            payload: String::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn attr(mut self, name: &'static str, value: impl ToString) -> Self {
        self.attributes.push((name, value.to_string()));
        self
    }

    /// Add an attribute if the value is present.
    #[must_use]
    pub fn attr_opt(self, name: &'static str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.attr(name, value),
            None => self,
        }
    }

    /// Set the already-serialized stanza payload.
    #[must_use]
    pub fn payload(mut self, payload: String) -> Self {
        self.payload = payload;
        self
    }

    /// Look up an attribute value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the envelope carries no stanzas.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize the envelope.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.payload.len());
        out.push_str("<body");
        for (name, value) in &self.attributes {
            let _ = write!(out, " {name}='{}'", escape(value.as_str()));
        }

        if self.payload.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            out.push_str(&self.payload);
            out.push_str("</body>");
        }
        out
    }
}

/// An inbound `<body/>` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    element: Element,
}

impl ResponseBody {
    /// Parse a response from raw HTTP body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the bytes are not a BOSH `<body/>`.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = core::str::from_utf8(bytes).map_err(|e| CodecError::Xml(e.to_string()))?;
        Self::from_element(Element::parse(text)?)
    }

    /// Wrap an already-parsed element.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedRoot`] unless the element is `body`
    /// in the BOSH namespace (or unqualified).
    pub fn from_element(element: Element) -> Result<Self, CodecError> {
        let namespace_ok = element.namespace().is_none_or(|ns| ns == NS_HTTPBIND);
        if element.local_name() != "body" || !namespace_ok {
            return Err(CodecError::UnexpectedRoot(element.name().to_owned()));
        }
        Ok(Self { element })
    }

    /// The underlying element.
    #[must_use]
    pub const fn element(&self) -> &Element {
        &self.element
    }

    /// The session id, if present and non-empty.
    #[must_use]
    pub fn sid(&self) -> Option<&str> {
        self.element.attr("sid").filter(|s| !s.is_empty())
    }

    /// The server's stream id.
    #[must_use]
    pub fn authid(&self) -> Option<&str> {
        self.element.attr("authid").filter(|s| !s.is_empty())
    }

    /// Whether the server ended the session.
    #[must_use]
    pub fn is_terminate(&self) -> bool {
        self.element.attr("type") == Some("terminate")
    }

    /// The reason the session ended.
    ///
    /// Prefers the `condition` attribute; otherwise the name of the first
    /// child that is not a routable stanza (e.g. `<conflict/>`).
    #[must_use]
    pub fn condition(&self) -> Option<&str> {
        self.element
            .attr("condition")
            .filter(|c| !c.is_empty())
            .or_else(|| {
                self.element
                    .children()
                    .find(|c| StanzaKind::classify(c).is_none())
                    .map(Element::local_name)
            })
    }

    /// Server-chosen `hold`.
    #[must_use]
    pub fn hold(&self) -> Option<u32> {
        self.number("hold")
    }

    /// Maximum number of simultaneous requests.
    #[must_use]
    pub fn requests(&self) -> Option<u32> {
        self.number("requests")
    }

    /// Server-chosen `wait`.
    #[must_use]
    pub fn wait(&self) -> Option<Duration> {
        self.number("wait").map(Duration::from_secs)
    }

    /// Minimum interval between empty polls.
    #[must_use]
    pub fn polling(&self) -> Option<Duration> {
        self.number("polling").map(Duration::from_secs)
    }

    /// Longest period the server tolerates without any request.
    #[must_use]
    pub fn inactivity(&self) -> Option<Duration> {
        self.number("inactivity").map(Duration::from_secs)
    }

    /// Child stanzas in document order.
    pub fn stanzas(&self) -> impl Iterator<Item = &Element> {
        self.element.children()
    }

    /// Consume the envelope, yielding its child stanzas in document order.
    #[must_use]
    pub fn into_stanzas(self) -> Vec<Element> {
        self.element.into_children().collect()
    }

    fn number<T: core::str::FromStr>(&self, name: &str) -> Option<T> {
        self.element.attr(name)?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_empty_poll() {
        let body = RequestBody::new(Rid::new(7)).attr("sid", "abc");
        assert_eq!(
            body.encode(),
            "<body rid='7' xmlns='http://jabber.org/protocol/httpbind' sid='abc'/>"
        );
        assert!(body.is_empty());
    }

    #[test]
    fn encodes_payload_verbatim() {
        let body = RequestBody::new(Rid::new(8))
            .attr("sid", "abc")
            .payload("<presence/><message to='a@b'/>".into());
        assert_eq!(
            body.encode(),
            "<body rid='8' xmlns='http://jabber.org/protocol/httpbind' sid='abc'>\
             <presence/><message to='a@b'/></body>"
        );
    }

    #[test]
    fn parses_session_creation_response() {
        let body = ResponseBody::parse(
            b"<body xmlns='http://jabber.org/protocol/httpbind' sid='s1' authid='a1' \
              wait='60' hold='1' requests='2' polling='2' inactivity='30'/>",
        )
        .expect("parse");

        assert_eq!(body.sid(), Some("s1"));
        assert_eq!(body.authid(), Some("a1"));
        assert_eq!(body.hold(), Some(1));
        assert_eq!(body.requests(), Some(2));
        assert_eq!(body.wait(), Some(Duration::from_secs(60)));
        assert_eq!(body.polling(), Some(Duration::from_secs(2)));
        assert_eq!(body.inactivity(), Some(Duration::from_secs(30)));
        assert!(!body.is_terminate());
    }

    #[test]
    fn terminate_condition_from_child() {
        let body =
            ResponseBody::parse(b"<body type='terminate'><conflict/></body>").expect("parse");
        assert!(body.is_terminate());
        assert_eq!(body.condition(), Some("conflict"));
    }

    #[test]
    fn terminate_condition_attribute_wins() {
        let body = ResponseBody::parse(
            b"<body xmlns='http://jabber.org/protocol/httpbind' type='terminate' \
              condition='item-not-found'><conflict/></body>",
        )
        .expect("parse");
        assert_eq!(body.condition(), Some("item-not-found"));
    }

    #[test]
    fn stanzas_keep_document_order() {
        let body = ResponseBody::parse(
            b"<body xmlns='http://jabber.org/protocol/httpbind'>\
              <message id='1'/><presence id='2'/><iq id='3'/></body>",
        )
        .expect("parse");
        let ids: Vec<_> = body
            .into_stanzas()
            .iter()
            .filter_map(|s| s.attr("id").map(str::to_owned))
            .collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[test]
    fn rejects_non_body_root() {
        assert_eq!(
            ResponseBody::parse(b"<html/>"),
            Err(CodecError::UnexpectedRoot("html".into()))
        );
        assert!(ResponseBody::parse(b"<body xmlns='urn:other'/>").is_err());
    }

    #[test]
    fn empty_sid_is_absent() {
        let body = ResponseBody::parse(b"<body sid=''/>").expect("parse");
        assert_eq!(body.sid(), None);
    }
}
