//! The XMPP login sequence run over a fresh BOSH session.
//!
//! ```text
//!   Connected ──features(mechanisms)──► Authenticating ──success──► BindingResource
//!       ▲                                    │                          │ features(bind)
//!       │            failure / iq error      │                          ▼
//!       └────────────────────────────────────┴─────────────────── bind ─► [session] ─► Active
//! ```
//!
//! [`Handshake`] is a pure state machine: it consumes inbound elements and
//! returns [`HandshakeAction`]s for the dispatcher to carry out.

use core::fmt;

use crate::{
    element::Element,
    jid::Jid,
    sasl::{self, SaslMechanism},
    stanza::{self, NS_BIND, NS_CLIENT, NS_SASL, NS_SESSION},
};

/// Reported when none of the server's mechanisms is supported locally.
const NO_MECHANISM: &str = "invalid-mechanism";

/// Login progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// The session is up; nothing has been negotiated yet.
    Connected,

    /// `<auth/>` sent, waiting for the outcome.
    Authenticating,

    /// Authenticated; binding a resource (and establishing a session).
    BindingResource,

    /// Bound and ready for application traffic.
    Active,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::BindingResource => "binding-resource",
            Self::Active => "active",
        })
    }
}

/// Which correlated iq a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Resource binding.
    Bind,

    /// Legacy session establishment.
    Session,
}

/// Something the dispatcher must do on the handshake's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send a SASL element.
    Send(String),

    /// Send an iq and feed its response back through
    /// [`Handshake::on_result`].
    SendCorrelated {
        /// The serialized iq.
        stanza: String,

        /// Its `id` attribute.
        id: String,

        /// What the response answers.
        step: HandshakeStep,
    },

    /// Request an XEP-0206 stream restart.
    Restart,

    /// Login completed with this JID.
    Active(Jid),

    /// Login failed with this condition.
    Failed(String),
}

/// Login state for one session.
pub struct Handshake {
    state: HandshakeState,
    resource: Option<String>,
    mechanisms: Vec<Box<dyn SaslMechanism>>,
    selected: Option<usize>,
    features: Option<Element>,
    session_required: bool,
    bound: Option<Jid>,
    next_id: u64,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.mechanisms.iter().map(|m| m.name()).collect();
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("mechanisms", &names)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

impl Handshake {
    /// Create a handshake offering `mechanisms` in preference order.
    #[must_use]
    pub fn new(mechanisms: Vec<Box<dyn SaslMechanism>>, resource: Option<String>) -> Self {
        Self {
            state: HandshakeState::Connected,
            resource,
            mechanisms,
            selected: None,
            features: None,
            session_required: false,
            bound: None,
            next_id: 1,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether login completed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == HandshakeState::Active
    }

    /// The bound JID, once known.
    #[must_use]
    pub const fn jid(&self) -> Option<&Jid> {
        self.bound.as_ref()
    }

    /// Handle `<stream:features/>`.
    pub fn on_features(&mut self, features: &Element) -> Vec<HandshakeAction> {
        self.features = Some(features.clone());
        let bind = features.child_ns("bind", NS_BIND).is_some();

        match self.state {
            HandshakeState::Connected if features.child_ns("mechanisms", NS_SASL).is_some() => {
                self.authenticate(features)
            }
            HandshakeState::Connected | HandshakeState::BindingResource if bind => {
                self.session_required = features
                    .child_ns("session", NS_SESSION)
                    .is_some_and(|s| s.child("optional").is_none());
                self.state = HandshakeState::BindingResource;
                vec![self.bind()]
            }
            state => {
                tracing::debug!(%state, "ignoring stream features");
                Vec::new()
            }
        }
    }

    /// Handle an element in the SASL namespace.
    pub fn on_sasl(&mut self, el: &Element) -> Vec<HandshakeAction> {
        if self.state != HandshakeState::Authenticating {
            tracing::debug!(element = el.local_name(), state = %self.state, "unexpected SASL element");
            return Vec::new();
        }

        match el.local_name() {
            "success" => {
                tracing::info!("SASL authentication succeeded");
                self.state = HandshakeState::BindingResource;
                vec![HandshakeAction::Restart]
            }
            "failure" => {
                let reason =
                    stanza::error_condition(el).unwrap_or_else(|| "not-authorized".into());
                self.fail(reason)
            }
            "challenge" => self.answer(el),
            other => {
                tracing::debug!(element = other, "ignoring SASL element");
                Vec::new()
            }
        }
    }

    /// Handle the response to an iq sent through
    /// [`HandshakeAction::SendCorrelated`].
    pub fn on_result(&mut self, step: HandshakeStep, iq: &Element) -> Vec<HandshakeAction> {
        if self.state != HandshakeState::BindingResource {
            return Vec::new();
        }
        if stanza::is_error(iq) {
            let reason =
                stanza::error_condition(iq).unwrap_or_else(|| "undefined-condition".into());
            return self.fail(reason);
        }

        match step {
            HandshakeStep::Bind => {
                let jid = iq
                    .child_ns("bind", NS_BIND)
                    .and_then(|b| b.child("jid"))
                    .map(Element::text);
                let Some(jid) = jid.and_then(|j| j.trim().parse::<Jid>().ok()) else {
                    return self.fail("bad-request".into());
                };
                tracing::info!(%jid, "resource bound");
                self.bound = Some(jid);

                if self.session_required {
                    vec![self.establish_session()]
                } else {
                    self.activate()
                }
            }
            HandshakeStep::Session => self.activate(),
        }
    }

    /// Handle an iq error that matched no correlation.
    pub fn on_uncorrelated_error(&mut self, iq: &Element) -> Vec<HandshakeAction> {
        if self.is_active() || iq.local_name() != "iq" {
            return Vec::new();
        }
        let reason = stanza::error_condition(iq).unwrap_or_else(|| "undefined-condition".into());
        self.fail(reason)
    }

    /// Start over from the last features seen, after a failure.
    pub fn retry(&mut self) -> Vec<HandshakeAction> {
        if self.state != HandshakeState::Connected {
            return Vec::new();
        }
        match self.features.clone() {
            Some(features) => self.on_features(&features),
            None => Vec::new(),
        }
    }

    fn authenticate(&mut self, features: &Element) -> Vec<HandshakeAction> {
        let offered: Vec<String> = features
            .child_ns("mechanisms", NS_SASL)
            .map(|m| m.children().map(|c| c.text().trim().to_owned()).collect())
            .unwrap_or_default();

        let chosen = self
            .mechanisms
            .iter()
            .position(|m| offered.iter().any(|o| o == m.name()));

        let Some(index) = chosen else {
            tracing::warn!(?offered, "no supported SASL mechanism");
            return vec![HandshakeAction::Failed(NO_MECHANISM.into())];
        };

        self.selected = Some(index);
        self.state = HandshakeState::Authenticating;
        self.mechanisms
            .get(index)
            .map(|m| {
                tracing::debug!(mechanism = m.name(), "starting SASL");
                HandshakeAction::Send(sasl::auth_element(&**m).to_xml())
            })
            .into_iter()
            .collect()
    }

    fn answer(&mut self, challenge: &Element) -> Vec<HandshakeAction> {
        let mechanism = self.selected.and_then(|i| self.mechanisms.get(i));
        let reply = sasl::decode_payload(challenge).and_then(|payload| {
            mechanism
                .ok_or_else(|| "no mechanism selected".to_owned())?
                .respond(&payload)
        });

        match reply {
            Ok(bytes) => vec![HandshakeAction::Send(sasl::response_element(&bytes).to_xml())],
            Err(e) => {
                tracing::warn!("cannot answer SASL challenge: {e}");
                let mut actions = vec![HandshakeAction::Send(sasl::abort_element().to_xml())];
                actions.extend(self.fail("aborted".into()));
                actions
            }
        }
    }

    fn bind(&mut self) -> HandshakeAction {
        let id = self.iq_id("bind");
        let mut bind = Element::new("bind").with_namespace(NS_BIND);
        if let Some(resource) = &self.resource {
            bind = bind.with_child(Element::new("resource").with_text(resource.clone()));
        }
        let iq = Element::new("iq")
            .with_namespace(NS_CLIENT)
            .with_attr("type", "set")
            .with_attr("id", id.clone())
            .with_child(bind);

        HandshakeAction::SendCorrelated {
            stanza: iq.to_xml(),
            id,
            step: HandshakeStep::Bind,
        }
    }

    fn establish_session(&mut self) -> HandshakeAction {
        let id = self.iq_id("session");
        let iq = Element::new("iq")
            .with_namespace(NS_CLIENT)
            .with_attr("type", "set")
            .with_attr("id", id.clone())
            .with_child(Element::new("session").with_namespace(NS_SESSION));

        HandshakeAction::SendCorrelated {
            stanza: iq.to_xml(),
            id,
            step: HandshakeStep::Session,
        }
    }

    fn activate(&mut self) -> Vec<HandshakeAction> {
        self.state = HandshakeState::Active;
        self.bound
            .clone()
            .map(HandshakeAction::Active)
            .into_iter()
            .collect()
    }

    fn fail(&mut self, reason: String) -> Vec<HandshakeAction> {
        tracing::warn!(%reason, state = %self.state, "login failed");
        self.state = HandshakeState::Connected;
        self.selected = None;
        vec![HandshakeAction::Failed(reason)]
    }

    fn iq_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}_{}", self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::Anonymous;

    fn parse(xml: &str) -> Element {
        Element::parse(xml).expect("parse")
    }

    fn handshake() -> Handshake {
        Handshake::new(vec![Box::new(Anonymous)], Some("desk".into()))
    }

    fn sasl_features() -> Element {
        parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism><mechanism>ANONYMOUS</mechanism>\
             </mechanisms></stream:features>",
        )
    }

    fn bind_features(session: &str) -> Element {
        parse(&format!(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>{session}</stream:features>"
        ))
    }

    fn success() -> Element {
        parse("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
    }

    fn bind_result(id: &str) -> Element {
        parse(&format!(
            "<iq xmlns='jabber:client' type='result' id='{id}'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>anon@example.com/desk</jid></bind>\
             </iq>"
        ))
    }

    fn correlated(actions: &[HandshakeAction]) -> (String, String, HandshakeStep) {
        match actions {
            [HandshakeAction::SendCorrelated { stanza, id, step }] => {
                (stanza.clone(), id.clone(), *step)
            }
            other => panic!("expected one correlated send, got {other:?}"),
        }
    }

    #[test]
    fn selects_supported_mechanism() {
        let mut hs = handshake();
        let actions = hs.on_features(&sasl_features());
        assert_eq!(
            actions,
            vec![HandshakeAction::Send(
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>".into()
            )]
        );
        assert_eq!(hs.state(), HandshakeState::Authenticating);
    }

    #[test]
    fn unsupported_mechanisms_fail_without_state_change() {
        let mut hs = handshake();
        let features = parse(
            "<features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>SCRAM-SHA-1</mechanism></mechanisms></features>",
        );
        assert_eq!(
            hs.on_features(&features),
            vec![HandshakeAction::Failed("invalid-mechanism".into())]
        );
        assert_eq!(hs.state(), HandshakeState::Connected);
    }

    #[test]
    fn success_requests_restart_then_binds() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        assert_eq!(hs.on_sasl(&success()), vec![HandshakeAction::Restart]);
        assert_eq!(hs.state(), HandshakeState::BindingResource);

        let (stanza, id, step) = correlated(&hs.on_features(&bind_features("")));
        assert_eq!(step, HandshakeStep::Bind);
        assert!(stanza.contains(&format!("id='{id}'")));
        assert!(stanza.contains("<resource>desk</resource>"));

        let actions = hs.on_result(HandshakeStep::Bind, &bind_result(&id));
        let jid: Jid = "anon@example.com/desk".parse().expect("jid");
        assert_eq!(actions, vec![HandshakeAction::Active(jid)]);
        assert!(hs.is_active());
    }

    #[test]
    fn mandatory_session_is_established_before_active() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        hs.on_sasl(&success());
        let (_, bind_id, _) = correlated(&hs.on_features(&bind_features(
            "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>",
        )));

        let (stanza, _, step) = correlated(&hs.on_result(HandshakeStep::Bind, &bind_result(&bind_id)));
        assert_eq!(step, HandshakeStep::Session);
        assert!(stanza.contains("urn:ietf:params:xml:ns:xmpp-session"));
        assert_eq!(hs.state(), HandshakeState::BindingResource);

        let done = hs.on_result(
            HandshakeStep::Session,
            &parse("<iq type='result' id='session_2'/>"),
        );
        assert!(matches!(done.as_slice(), [HandshakeAction::Active(_)]));
    }

    #[test]
    fn optional_session_is_skipped() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        hs.on_sasl(&success());
        let (_, bind_id, _) = correlated(&hs.on_features(&bind_features(
            "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>",
        )));
        let actions = hs.on_result(HandshakeStep::Bind, &bind_result(&bind_id));
        assert!(matches!(actions.as_slice(), [HandshakeAction::Active(_)]));
    }

    #[test]
    fn sasl_failure_reports_condition() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        let failure = parse(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        );
        assert_eq!(
            hs.on_sasl(&failure),
            vec![HandshakeAction::Failed("not-authorized".into())]
        );
        assert_eq!(hs.state(), HandshakeState::Connected);
    }

    #[test]
    fn retry_reuses_cached_features() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        hs.on_sasl(&parse(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><temporary-auth-failure/></failure>",
        ));

        let actions = hs.retry();
        assert!(matches!(actions.as_slice(), [HandshakeAction::Send(auth)] if auth.starts_with("<auth")));
        assert_eq!(hs.state(), HandshakeState::Authenticating);
    }

    #[test]
    fn bind_error_is_login_failure() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        hs.on_sasl(&success());
        let (_, id, _) = correlated(&hs.on_features(&bind_features("")));

        let error = parse(&format!(
            "<iq type='error' id='{id}'><error type='cancel'>\
             <conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
        ));
        assert_eq!(
            hs.on_result(HandshakeStep::Bind, &error),
            vec![HandshakeAction::Failed("conflict".into())]
        );
    }

    #[test]
    fn uncorrelated_iq_error_before_active_fails_login() {
        let mut hs = handshake();
        let error = parse(
            "<iq type='error' id='x'><error type='auth'>\
             <forbidden xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        );
        assert_eq!(
            hs.on_uncorrelated_error(&error),
            vec![HandshakeAction::Failed("forbidden".into())]
        );
    }

    #[test]
    fn challenge_with_anonymous_aborts() {
        let mut hs = handshake();
        hs.on_features(&sasl_features());
        let actions = hs.on_sasl(&parse(
            "<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>Zm9v</challenge>",
        ));
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], HandshakeAction::Send(s) if s.contains("abort")));
        assert_eq!(actions[1], HandshakeAction::Failed("aborted".into()));
    }
}
