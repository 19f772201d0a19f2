//! The BOSH session state machine, free of I/O.
//!
//! [`SessionCore`] decides what to send and what to deliver; the
//! [`SessionDriver`](super::SessionDriver) performs the HTTP exchanges and timers and
//! feeds their outcomes back in. Anything time-dependent takes the current
//! instant as an argument, so the whole machine can be exercised
//! synchronously.
//!
//! ```text
//!   open() ──► NotReady ──(response with sid)──► Ready ──┐
//!                 │                                │     │ close()
//!                 │ creation failed                │     │ terminate body
//!                 ▼                                ▼     │ fatal error
//!             Terminate ◄──────────────────────────┴─────┘
//! ```

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use super::{ReassemblyBuffer, Rid, RidSequence, Sid};
use crate::{
    BOSH_VERSION, CONTENT_TYPE, XMPP_VERSION,
    body::{NS_XBOSH, RequestBody, ResponseBody},
    config::{BoshConfig, TransportStrategy},
    element::Element,
    error::TransportError,
};

/// Condition reported when the creation response carries no `sid`.
const NO_SID_CONDITION: &str = "service-unavailable";

/// Condition reported when the transport keeps failing.
const CONNECTION_FAILED_CONDITION: &str = "remote-connection-failed";

/// Upper bound on a server-requested `Retry-After` delay.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the creation response.
    NotReady,

    /// A `sid` has been assigned; exchanges flow.
    Ready,

    /// The session is over. Absorbing.
    Terminate,
}

/// Whether an exchange is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    /// Nothing in flight.
    Idle,

    /// At least one exchange in flight.
    Transmitting,

    /// The last exchange failed; the next flush waits for the retry delay.
    Error,
}

/// A request ready to be POSTed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// The request id carried by the envelope.
    pub rid: Rid,

    /// The envelope.
    pub body: RequestBody,

    /// When the request was built.
    pub enqueued_at: Instant,
}

impl OutboundRequest {
    /// Serialize the envelope for the wire.
    #[must_use]
    pub fn encode(&self) -> String {
        self.body.encode()
    }
}

/// The session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// The terminate condition, if any (`None` for a local close).
    pub reason: Option<String>,
}

/// What an inbound event produced for the layers above.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Set when this event moved the session to `Ready`.
    pub ready: Option<Sid>,

    /// Stanzas to dispatch, in rid order then document order.
    pub stanzas: Vec<Element>,

    /// Set when this event moved the session to `Terminate`.
    pub terminated: Option<Termination>,
}

/// Result of [`SessionCore::close`].
#[derive(Debug, Default)]
pub struct Closing {
    /// The terminate envelope to send, if the session had a `sid`.
    pub request: Option<OutboundRequest>,

    /// Set when this call moved the session to `Terminate`.
    pub terminated: Option<Termination>,
}

/// Sequencing, batching, retry and reordering state for one session.
#[derive(Debug)]
pub struct SessionCore {
    domain: String,
    lang: String,
    route: Option<String>,
    secure: bool,
    strategy: TransportStrategy,
    retry_delay: Duration,
    max_consecutive_errors: u32,

    state: SessionState,
    transmit: TransmitState,
    rids: RidSequence,
    sid: Option<Sid>,
    authid: Option<String>,
    hold: u32,
    requests: u32,
    wait: Duration,
    polling: Duration,

    opened: bool,
    restart_requested: bool,
    pending: Vec<String>,
    pending_since: Option<Instant>,

    /// Exchanges whose HTTP request has not completed.
    in_flight: BTreeSet<Rid>,

    /// Requests sent whose response has been neither accepted nor failed.
    unanswered: BTreeSet<Rid>,

    reassembly: ReassemblyBuffer,
    last_poll: Option<Instant>,
    retry_at: Option<Instant>,
    consecutive_errors: u32,
}

impl SessionCore {
    /// Create a session with a randomly seeded rid sequence.
    #[must_use]
    pub fn new(config: &BoshConfig) -> Self {
        Self::with_rids(config, RidSequence::random())
    }

    /// Create a session with an explicit rid sequence.
    #[must_use]
    pub fn with_rids(config: &BoshConfig, rids: RidSequence) -> Self {
        let hold = config.effective_hold();
        Self {
            domain: config.domain.clone(),
            lang: config.lang.clone(),
            route: config.route.clone(),
            secure: config.secure,
            strategy: config.strategy,
            retry_delay: config.retry_delay(),
            max_consecutive_errors: config.max_consecutive_errors,

            state: SessionState::NotReady,
            transmit: TransmitState::Idle,
            rids,
            sid: None,
            authid: None,
            hold,
            requests: hold.saturating_add(1),
            wait: config.wait(),
            polling: config.polling(),

            opened: false,
            restart_requested: false,
            pending: Vec::new(),
            pending_since: None,
            in_flight: BTreeSet::new(),
            unanswered: BTreeSet::new(),
            reassembly: ReassemblyBuffer::new(config.reassembly_slack),
            last_poll: None,
            retry_at: None,
            consecutive_errors: 0,
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminate
    }

    /// Transmit sub-state.
    #[must_use]
    pub const fn transmit_state(&self) -> TransmitState {
        self.transmit
    }

    /// The server-assigned session id.
    #[must_use]
    pub const fn sid(&self) -> Option<&Sid> {
        self.sid.as_ref()
    }

    /// The server's stream id.
    #[must_use]
    pub fn authid(&self) -> Option<&str> {
        self.authid.as_deref()
    }

    /// Effective `hold`.
    #[must_use]
    pub const fn hold(&self) -> u32 {
        self.hold
    }

    /// Effective `wait`.
    #[must_use]
    pub const fn wait(&self) -> Duration {
        self.wait
    }

    /// Effective minimum empty-poll interval.
    #[must_use]
    pub const fn polling(&self) -> Duration {
        self.polling
    }

    /// The rid the next request will carry.
    #[must_use]
    pub const fn next_rid(&self) -> Rid {
        self.rids.peek()
    }

    /// The oldest request whose response has not been accepted.
    #[must_use]
    pub fn expected_rid(&self) -> Option<Rid> {
        self.unanswered.first().copied()
    }

    /// Number of HTTP exchanges in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of responses parked for reordering.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.reassembly.len()
    }

    /// Whether stanzas are waiting to be sent.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// When the oldest pending stanza was queued.
    #[must_use]
    pub const fn pending_since(&self) -> Option<Instant> {
        self.pending_since
    }

    /// When the next flush may go out after a transport error.
    #[must_use]
    pub const fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    fn max_in_flight(&self) -> usize {
        let slots = match self.strategy {
            TransportStrategy::Polling => 1,
            TransportStrategy::LongPoll => self.requests.max(1),
        };
        usize::try_from(slots).unwrap_or(usize::MAX)
    }

    /// Build the session creation request.
    ///
    /// Returns `None` if the session was already opened or has ended.
    pub fn open(&mut self, now: Instant) -> Option<OutboundRequest> {
        if self.opened || self.state != SessionState::NotReady {
            return None;
        }
        self.opened = true;

        let rid = self.rids.next_rid();
        let body = RequestBody::new(rid)
            .attr("to", &self.domain)
            .attr("xml:lang", &self.lang)
            .attr("wait", self.wait.as_secs())
            .attr("hold", self.hold)
            .attr("content", CONTENT_TYPE)
            .attr("ver", BOSH_VERSION)
            .attr("xmlns:xmpp", NS_XBOSH)
            .attr("xmpp:version", XMPP_VERSION)
            .attr_opt("secure", self.secure.then_some("true"))
            .attr_opt("route", self.route.as_deref());

        tracing::info!(%rid, domain = %self.domain, "opening BOSH session");
        Some(self.launch(rid, body, now))
    }

    /// Queue serialized stanza text for the next flush.
    ///
    /// Returns `false` (and drops the text) once the session has ended.
    pub fn enqueue(&mut self, stanza: String, now: Instant) -> bool {
        if self.is_terminated() {
            tracing::debug!("dropping stanza queued after terminate");
            return false;
        }
        if self.pending.is_empty() {
            self.pending_since = Some(now);
        }
        self.pending.push(stanza);
        true
    }

    /// Ask for an XEP-0206 stream restart on the next flush.
    pub fn request_restart(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.restart_requested = true;
        true
    }

    /// Build the next request, if one should be sent now.
    ///
    /// In priority order: a pending restart, the pending stanza buffer (when
    /// a request slot is free), or an empty poll (when nothing is in flight
    /// and the polling interval has elapsed).
    pub fn flush(&mut self, now: Instant) -> Option<OutboundRequest> {
        if self.state != SessionState::Ready {
            return None;
        }
        if self.in_flight.len() >= self.max_in_flight() {
            return None;
        }
        if self.retry_at.is_some_and(|at| now < at) {
            return None;
        }

        if self.restart_requested {
            self.restart_requested = false;
            let rid = self.rids.next_rid();
            let body = self
                .session_body(rid)
                .attr("to", &self.domain)
                .attr("xml:lang", &self.lang)
                .attr("xmlns:xmpp", NS_XBOSH)
                .attr("xmpp:restart", "true");
            tracing::debug!(%rid, "requesting stream restart");
            return Some(self.launch(rid, body, now));
        }

        if !self.pending.is_empty() {
            let payload = core::mem::take(&mut self.pending).concat();
            self.pending_since = None;
            let rid = self.rids.next_rid();
            let body = self.session_body(rid).payload(payload);
            tracing::debug!(%rid, bytes = body.encode().len(), "flushing pending stanzas");
            return Some(self.launch(rid, body, now));
        }

        let poll_due = self
            .last_poll
            .is_none_or(|at| now.saturating_duration_since(at) >= self.polling);
        if self.in_flight.is_empty() && poll_due {
            self.last_poll = Some(now);
            let rid = self.rids.next_rid();
            tracing::trace!(%rid, "empty poll");
            return Some(self.launch(rid, self.session_body(rid), now));
        }

        None
    }

    /// Handle a 2xx response to request `rid`.
    pub fn on_response(&mut self, rid: Rid, body: ResponseBody) -> Delivery {
        self.in_flight.remove(&rid);
        let mut delivery = Delivery::default();

        if self.is_terminated() {
            tracing::debug!(%rid, "ignoring response after terminate");
            return delivery;
        }

        let Some(expected) = self.expected_rid() else {
            tracing::debug!(%rid, "dropping response with nothing outstanding");
            return delivery;
        };
        if !self.unanswered.contains(&rid) {
            tracing::debug!(%rid, %expected, "dropping stale response");
            return delivery;
        }

        self.consecutive_errors = 0;
        self.retry_at = None;

        if rid == expected {
            self.accept(rid, body, &mut delivery);
            self.replay(&mut delivery);
        } else if self.reassembly.in_window(expected, rid, self.hold) {
            tracing::debug!(%rid, %expected, "buffering out-of-order response");
            self.reassembly.park(rid, body);
        } else {
            tracing::debug!(%rid, %expected, hold = self.hold, "dropping response outside reassembly window");
            self.unanswered.remove(&rid);
        }

        if !self.is_terminated() {
            self.transmit = if self.in_flight.is_empty() {
                TransmitState::Idle
            } else {
                TransmitState::Transmitting
            };
        }
        delivery
    }

    /// Handle a failed exchange for request `rid`.
    ///
    /// The payload of the failed request is not resent. The session either
    /// terminates (fatal condition, failed creation, or too many consecutive
    /// failures) or schedules the next flush after the retry delay.
    pub fn on_transport_error(
        &mut self,
        rid: Rid,
        error: &TransportError,
        now: Instant,
    ) -> Delivery {
        self.in_flight.remove(&rid);
        let mut delivery = Delivery::default();

        if self.is_terminated() || !self.unanswered.remove(&rid) {
            tracing::debug!(%rid, "ignoring failure of retired request");
            return delivery;
        }

        self.transmit = TransmitState::Error;
        self.consecutive_errors += 1;

        if let Some(condition) = error.terminate_condition() {
            tracing::error!(%rid, %condition, "server terminated session");
            self.terminate(Some(condition), &mut delivery);
            return delivery;
        }

        if self.sid.is_none() {
            tracing::error!(%rid, "session creation failed: {error}");
            self.terminate(Some(CONNECTION_FAILED_CONDITION.into()), &mut delivery);
            return delivery;
        }

        if self.max_consecutive_errors != 0 && self.consecutive_errors >= self.max_consecutive_errors
        {
            tracing::error!(
                %rid,
                consecutive_errors = self.consecutive_errors,
                "giving up after repeated transport errors"
            );
            self.terminate(Some(CONNECTION_FAILED_CONDITION.into()), &mut delivery);
            return delivery;
        }

        let delay = error
            .retry_after()
            .map_or(self.retry_delay, |d| d.min(MAX_RETRY_AFTER).max(self.retry_delay));
        tracing::warn!(
            %rid,
            consecutive_errors = self.consecutive_errors,
            retry_in = ?delay,
            "transport error: {error}"
        );
        self.retry_at = Some(now.checked_add(delay).unwrap_or(now));

        // The failed rid may have been the gap holding back parked responses.
        self.replay(&mut delivery);
        delivery
    }

    /// End the session, optionally sending one last stanza.
    ///
    /// Anything still pending is sent along with `final_stanza` in a
    /// `type="terminate"` envelope. The session moves to `Terminate`
    /// immediately. Calling this again is a no-op.
    pub fn close(&mut self, final_stanza: Option<String>, now: Instant) -> Closing {
        if self.is_terminated() {
            return Closing::default();
        }

        let mut payload = core::mem::take(&mut self.pending).concat();
        if let Some(stanza) = final_stanza {
            payload.push_str(&stanza);
        }

        let request = self.sid.is_some().then(|| {
            let rid = self.rids.next_rid();
            let body = self
                .session_body(rid)
                .attr("type", "terminate")
                .payload(payload);
            OutboundRequest {
                rid,
                body,
                enqueued_at: now,
            }
        });

        tracing::info!(sid = ?self.sid.as_ref().map(Sid::as_str), "closing BOSH session");

        let mut delivery = Delivery::default();
        self.terminate(None, &mut delivery);
        Closing {
            request,
            terminated: delivery.terminated,
        }
    }

    fn session_body(&self, rid: Rid) -> RequestBody {
        RequestBody::new(rid).attr_opt("sid", self.sid.as_ref().map(Sid::as_str))
    }

    fn launch(&mut self, rid: Rid, body: RequestBody, now: Instant) -> OutboundRequest {
        self.in_flight.insert(rid);
        self.unanswered.insert(rid);
        self.transmit = TransmitState::Transmitting;
        self.retry_at = None;
        OutboundRequest {
            rid,
            body,
            enqueued_at: now,
        }
    }

    fn accept(&mut self, rid: Rid, body: ResponseBody, delivery: &mut Delivery) {
        self.unanswered.remove(&rid);
        if self.is_terminated() {
            return;
        }

        if body.is_terminate() {
            let reason = body.condition().map(str::to_owned);
            tracing::warn!(%rid, reason = ?reason, "server sent terminate");
            self.terminate(reason, delivery);
            return;
        }

        if self.sid.is_none() {
            let Some(sid) = body.sid().and_then(Sid::new) else {
                tracing::error!(%rid, "creation response carried no sid");
                self.terminate(Some(NO_SID_CONDITION.into()), delivery);
                return;
            };
            self.establish(&body, sid.clone());
            delivery.ready = Some(sid);
        }

        delivery.stanzas.extend(body.into_stanzas());
    }

    fn establish(&mut self, body: &ResponseBody, sid: Sid) {
        self.authid = body.authid().map(str::to_owned);
        if let Some(hold) = body.hold() {
            self.hold = hold;
        }
        self.requests = body.requests().unwrap_or(self.hold.saturating_add(1));
        if let Some(wait) = body.wait() {
            self.wait = wait;
        }
        if let Some(polling) = body.polling() {
            self.polling = polling;
        }
        self.state = SessionState::Ready;

        tracing::info!(
            %sid,
            hold = self.hold,
            requests = self.requests,
            wait = ?self.wait,
            polling = ?self.polling,
            inactivity = ?body.inactivity(),
            "BOSH session ready"
        );
        self.sid = Some(sid);
    }

    /// Deliver parked responses that have become next in line.
    fn replay(&mut self, delivery: &mut Delivery) {
        while !self.is_terminated() {
            let Some(next) = self.expected_rid() else {
                break;
            };
            let Some(body) = self.reassembly.take(next) else {
                break;
            };
            tracing::debug!(rid = %next, "replaying buffered response");
            self.accept(next, body, delivery);
        }
    }

    fn terminate(&mut self, reason: Option<String>, delivery: &mut Delivery) {
        if self.is_terminated() {
            return;
        }
        self.state = SessionState::Terminate;
        self.pending.clear();
        self.pending_since = None;
        self.reassembly.clear();
        self.unanswered.clear();
        self.in_flight.clear();
        self.restart_requested = false;
        self.retry_at = None;
        delivery.terminated = Some(Termination { reason });
    }
}
