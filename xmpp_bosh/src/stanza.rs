//! Stanza classification and the namespaces the handshake relies on.

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::element::Element;

/// Client stanza namespace.
pub const NS_CLIENT: &str = "jabber:client";

/// Stream namespace (`stream:` prefix).
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

/// SASL negotiation namespace.
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Resource binding namespace.
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Legacy session establishment namespace.
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Stanza error condition namespace.
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Top-level element kinds the dispatcher routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StanzaKind {
    /// `<iq/>`
    Iq,

    /// `<presence/>`
    Presence,

    /// `<message/>`
    Message,

    /// `<stream:features/>`
    Features,

    /// Any element in the SASL namespace (`<success/>`, `<failure/>`, …).
    Sasl,
}

impl StanzaKind {
    /// Classify an inbound element, or `None` if it is not routable.
    #[must_use]
    pub fn classify(el: &Element) -> Option<Self> {
        if el.namespace() == Some(NS_SASL) {
            return Some(Self::Sasl);
        }

        match el.local_name() {
            "iq" => Some(Self::Iq),
            "presence" => Some(Self::Presence),
            "message" => Some(Self::Message),
            "features" => Some(Self::Features),
            _ => None,
        }
    }

    /// The lowercase name used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iq => "iq",
            Self::Presence => "presence",
            Self::Message => "message",
            Self::Features => "features",
            Self::Sasl => "sasl",
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognised stanza kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stanza kind: {0}")]
pub struct UnknownStanzaKind(pub String);

impl FromStr for StanzaKind {
    type Err = UnknownStanzaKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iq" => Ok(Self::Iq),
            "presence" => Ok(Self::Presence),
            "message" => Ok(Self::Message),
            "features" => Ok(Self::Features),
            "sasl" => Ok(Self::Sasl),
            other => Err(UnknownStanzaKind(other.to_owned())),
        }
    }
}

/// Whether the stanza carries `type="error"`.
#[must_use]
pub fn is_error(el: &Element) -> bool {
    el.attr("type") == Some("error")
}

/// Extract the defined condition from a stanza error or SASL failure.
///
/// For stanzas this is the first child of `<error/>` in the stanza-errors
/// namespace (e.g. `item-not-found`); for SASL `<failure/>` it is the first
/// child element (e.g. `not-authorized`).
#[must_use]
pub fn error_condition(el: &Element) -> Option<String> {
    if el.namespace() == Some(NS_SASL) {
        return el
            .children()
            .find(|c| c.local_name() != "text")
            .map(|c| c.local_name().to_owned());
    }

    let error = el.child("error")?;
    error
        .children()
        .find(|c| c.namespace() == Some(NS_STANZAS) && c.local_name() != "text")
        .or_else(|| error.children().next())
        .map(|c| c.local_name().to_owned())
}
