//! SASL mechanisms.
//!
//! The handshake only moves opaque payloads; building them is the job of a
//! [`SaslMechanism`]. Payloads are raw bytes here and base64 on the wire.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::{element::Element, stanza::NS_SASL};

/// A client-side SASL mechanism.
pub trait SaslMechanism: Send + Sync {
    /// The IANA mechanism name, e.g. `PLAIN`.
    fn name(&self) -> &str;

    /// The initial response sent with `<auth/>`, if the mechanism has one.
    fn initial_response(&self) -> Option<Vec<u8>>;

    /// Answer a server challenge.
    ///
    /// # Errors
    ///
    /// Returns a reason string if the challenge cannot be answered; the
    /// handshake then aborts the exchange.
    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>, String>;
}

impl<M: SaslMechanism + ?Sized> SaslMechanism for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn initial_response(&self) -> Option<Vec<u8>> {
        (**self).initial_response()
    }

    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        (**self).respond(challenge)
    }
}

/// RFC 4505 `ANONYMOUS`: no credentials, no challenges.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn initial_response(&self) -> Option<Vec<u8>> {
        None
    }

    fn respond(&self, _challenge: &[u8]) -> Result<Vec<u8>, String> {
        Err("ANONYMOUS does not expect challenges".into())
    }
}

/// Build `<auth mechanism='…'>` for `mechanism`.
///
/// An empty initial response is sent as `=` (RFC 6120 §6.4.2).
#[must_use]
pub fn auth_element(mechanism: &dyn SaslMechanism) -> Element {
    let auth = Element::new("auth")
        .with_namespace(NS_SASL)
        .with_attr("mechanism", mechanism.name());

    match mechanism.initial_response() {
        Some(bytes) if bytes.is_empty() => auth.with_text("="),
        Some(bytes) => auth.with_text(STANDARD.encode(bytes)),
        None => auth,
    }
}

/// Build `<response/>` carrying `payload`.
#[must_use]
pub fn response_element(payload: &[u8]) -> Element {
    let response = Element::new("response").with_namespace(NS_SASL);
    if payload.is_empty() {
        response
    } else {
        response.with_text(STANDARD.encode(payload))
    }
}

/// Build `<abort/>`.
#[must_use]
pub fn abort_element() -> Element {
    Element::new("abort").with_namespace(NS_SASL)
}

/// Decode the base64 text of a `<challenge/>` or `<success/>`.
///
/// # Errors
///
/// Returns the decoder's message if the text is not valid base64.
pub fn decode_payload(el: &Element) -> Result<Vec<u8>, String> {
    let text = el.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD.decode(text).map_err(|e| e.to_string())
}
