//! Stanza routing and request/response correlation.
//!
//! ```text
//!   dispatch(stanza, Correlation) ──► pending.insert(key) ──► SessionHandle::enqueue
//!                                          │
//!   on_stanza(el) ── classify ──► pending.remove(key)? ──► PendingStanza resolves
//!                                          │ miss
//!                    features / sasl ──────┴──► Handshake ──► actions
//!                    iq / presence / message ─► StanzaHandler
//! ```
//!
//! The correlation table uses the same pending-map + oneshot scheme as the
//! long-poll connection: the caller registers a oneshot sender keyed by the
//! value it expects back, then waits on the receiver. Entries never expire
//! on their own; [`Dispatcher::dispatch_with_timeout`] offers an opt-in
//! deadline.

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_lock::Mutex;
use futures::{FutureExt, channel::oneshot, future::BoxFuture};

use crate::{
    config::BoshConfig,
    element::Element,
    error::{CallError, SendError},
    events::SessionEvent,
    handshake::{Handshake, HandshakeAction, HandshakeState},
    sasl::SaslMechanism,
    session::{InboundSink, SessionHandle},
    stanza::{self, StanzaKind},
};

/// What a caller expects back for a dispatched stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    kind: StanzaKind,
    value: String,
    attribute: Option<String>,
}

impl Correlation {
    /// Wait for a stanza of `kind` whose match attribute equals `value`.
    ///
    /// The match attribute is the configured one for `kind` (`id` unless
    /// overridden).
    #[must_use]
    pub fn new(kind: StanzaKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            attribute: None,
        }
    }

    /// Shorthand for an iq answered by `id`.
    #[must_use]
    pub fn iq(id: impl Into<String>) -> Self {
        Self::new(StanzaKind::Iq, id)
    }

    /// Match on `attribute` for this call only.
    #[must_use]
    pub fn with_match_attr(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

/// A registered expectation: stanzas of `kind` whose `attribute` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationKey {
    /// The stanza kind.
    pub kind: StanzaKind,

    /// The attribute compared.
    pub attribute: String,

    /// The expected attribute value.
    pub value: String,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Element>,
}

/// Pending correlations, grouped by the attribute they compare.
///
/// An inbound stanza costs one keyed lookup per attribute in use for its
/// kind, which is almost always just the configured one.
#[derive(Debug, Default)]
struct Table {
    groups: BTreeMap<(StanzaKind, String), BTreeMap<String, Waiter>>,
}

impl Table {
    fn insert(&mut self, key: &CorrelationKey, waiter: Waiter) -> Option<Waiter> {
        self.groups
            .entry((key.kind, key.attribute.clone()))
            .or_default()
            .insert(key.value.clone(), waiter)
    }

    /// Remove `key` if it still belongs to waiter `id`.
    fn remove_waiter(&mut self, key: &CorrelationKey, id: u64) -> bool {
        let group = (key.kind, key.attribute.clone());
        let Some(values) = self.groups.get_mut(&group) else {
            return false;
        };
        if values.get(&key.value).is_none_or(|w| w.id != id) {
            return false;
        }
        values.remove(&key.value);
        if values.is_empty() {
            self.groups.remove(&group);
        }
        true
    }

    /// Remove and return the waiter `stanza` answers, if any.
    fn take_match(
        &mut self,
        kind: StanzaKind,
        stanza: &Element,
    ) -> Option<(CorrelationKey, Waiter)> {
        let (key, waiter) = self
            .groups
            .range_mut((kind, String::new())..)
            .take_while(|((k, _), _)| *k == kind)
            .find_map(|((_, attribute), values)| {
                let value = stanza.attr(attribute)?;
                let waiter = values.remove(value)?;
                let key = CorrelationKey {
                    kind,
                    attribute: attribute.clone(),
                    value: value.to_owned(),
                };
                Some((key, waiter))
            })?;

        let group = (kind, key.attribute.clone());
        if self.groups.get(&group).is_some_and(BTreeMap::is_empty) {
            self.groups.remove(&group);
        }
        Some((key, waiter))
    }

    fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Receives stanzas that matched no correlation.
///
/// Every method defaults to doing nothing.
pub trait StanzaHandler: Send + Sync + 'static {
    /// An uncorrelated `<iq/>`.
    fn on_iq(&self, _iq: &Element) {}

    /// An uncorrelated `<presence/>`.
    fn on_presence(&self, _presence: &Element) {}

    /// An uncorrelated `<message/>`.
    fn on_message(&self, _message: &Element) {}

    /// An uncorrelated stanza with `type="error"`.
    fn on_error(&self, _stanza: &Element) {}
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl StanzaHandler for NoopHandler {}

/// An uncorrelated stanza forwarded by [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedStanza {
    /// How it was classified.
    pub kind: StanzaKind,

    /// Whether it carried `type="error"`.
    pub is_error: bool,

    /// The stanza itself.
    pub stanza: Element,
}

/// Forwards uncorrelated stanzas into a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: async_channel::Sender<RoutedStanza>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, async_channel::Receiver<RoutedStanza>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, kind: StanzaKind, is_error: bool, stanza: &Element) {
        let routed = RoutedStanza {
            kind,
            is_error,
            stanza: stanza.clone(),
        };
        if self.tx.try_send(routed).is_err() {
            tracing::debug!(%kind, "routed stanza receiver dropped");
        }
    }
}

impl StanzaHandler for ChannelHandler {
    fn on_iq(&self, iq: &Element) {
        self.forward(StanzaKind::Iq, false, iq);
    }

    fn on_presence(&self, presence: &Element) {
        self.forward(StanzaKind::Presence, false, presence);
    }

    fn on_message(&self, message: &Element) {
        self.forward(StanzaKind::Message, false, message);
    }

    fn on_error(&self, stanza: &Element) {
        if let Some(kind) = StanzaKind::classify(stanza) {
            self.forward(kind, true, stanza);
        }
    }
}

/// A correlated response that has not arrived yet.
///
/// Resolves with the matching stanza, even if it is a `type="error"`.
/// Dropping it unresolved removes the correlation entry.
#[derive(Debug)]
#[must_use = "dropping a PendingStanza discards the response"]
pub struct PendingStanza {
    rx: oneshot::Receiver<Element>,
    key: CorrelationKey,
    waiter: u64,
    table: Arc<Mutex<Table>>,
    cancelled: bool,
}

impl PendingStanza {
    /// The key this call waits on.
    #[must_use]
    pub const fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Stop waiting and remove the correlation entry.
    ///
    /// A matching stanza that arrives later is routed to the handler as if
    /// nothing had been waiting. Polling afterwards yields
    /// [`CallError::Cancelled`].
    pub async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.rx.close();

        if self.table.lock().await.remove_waiter(&self.key, self.waiter) {
            tracing::debug!(key = ?self.key, "correlation cancelled");
        }
    }
}

impl Drop for PendingStanza {
    fn drop(&mut self) {
        if self.cancelled {
            return;
        }
        // Best effort; a contended entry is cleaned up when its reply arrives.
        let removed = self
            .table
            .try_lock()
            .is_some_and(|mut table| table.remove_waiter(&self.key, self.waiter));
        if removed {
            tracing::debug!(key = ?self.key, "dropped correlation removed");
        }
    }
}

impl Future for PendingStanza {
    type Output = Result<Element, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancelled {
            return Poll::Ready(Err(CallError::Cancelled));
        }
        self.rx
            .poll_unpin(cx)
            .map(|r| r.map_err(CallError::ResponseDropped))
    }
}

struct Inner {
    session: SessionHandle,
    match_attributes: BTreeMap<StanzaKind, String>,
    pending: Arc<Mutex<Table>>,
    next_waiter: AtomicU64,
    handshake: Mutex<Handshake>,
    handler: Arc<dyn StanzaHandler>,
    /// Weak so the channel closes once the session driver is gone.
    events: async_channel::WeakSender<SessionEvent>,
    closed: AtomicBool,
}

/// Demultiplexes inbound stanzas and correlates responses.
///
/// Cheap to clone; clones share one correlation table.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("match_attributes", &self.inner.match_attributes)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher feeding `session`.
    #[must_use]
    pub fn new(
        session: SessionHandle,
        config: &BoshConfig,
        mechanisms: Vec<Box<dyn SaslMechanism>>,
        handler: Arc<dyn StanzaHandler>,
        events: async_channel::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                match_attributes: config.match_attributes.clone(),
                pending: Arc::new(Mutex::new(Table::default())),
                next_waiter: AtomicU64::new(0),
                handshake: Mutex::new(Handshake::new(mechanisms, config.resource.clone())),
                handler,
                events: events.downgrade(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The attribute stanzas of `kind` are correlated on.
    #[must_use]
    pub fn match_attribute(&self, kind: StanzaKind) -> &str {
        self.inner
            .match_attributes
            .get(&kind)
            .map_or(crate::config::DEFAULT_MATCH_ATTRIBUTE, String::as_str)
    }

    /// Queue `stanza` and wait for the response described by `correlation`.
    ///
    /// Registering the same key twice replaces the first entry, whose future
    /// then fails with [`CallError::ResponseDropped`].
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the session has shut down.
    pub async fn dispatch(
        &self,
        stanza: impl Into<String>,
        correlation: Correlation,
    ) -> Result<PendingStanza, SendError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SendError);
        }

        let key = CorrelationKey {
            attribute: correlation
                .attribute
                .unwrap_or_else(|| self.match_attribute(correlation.kind).to_owned()),
            kind: correlation.kind,
            value: correlation.value,
        };
        let waiter = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.inner.pending.lock().await;
            if table.insert(&key, Waiter { id: waiter, tx }).is_some() {
                tracing::warn!(?key, "replaced existing correlation");
            }
        }

        if let Err(e) = self.inner.session.enqueue(stanza) {
            self.inner.pending.lock().await.remove_waiter(&key, waiter);
            return Err(e);
        }
        tracing::debug!(?key, "dispatched correlated stanza");

        Ok(PendingStanza {
            rx,
            key,
            waiter,
            table: self.inner.pending.clone(),
            cancelled: false,
        })
    }

    /// Queue `stanza` without waiting for anything.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the session has shut down.
    pub fn send(&self, stanza: impl Into<String>) -> Result<(), SendError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SendError);
        }
        self.inner.session.enqueue(stanza)
    }

    /// [`dispatch`](Self::dispatch) and wait at most `timeout` for the
    /// response. On timeout the entry is removed.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::SessionClosed`] if the stanza could not be
    /// queued, [`CallError::Timeout`] if no response arrived in time, or
    /// [`CallError::ResponseDropped`] if the session ended first.
    pub async fn dispatch_with_timeout(
        &self,
        stanza: impl Into<String>,
        correlation: Correlation,
        timeout: Duration,
    ) -> Result<Element, CallError> {
        let mut pending = self.dispatch(stanza, correlation).await?;
        if let Ok(result) = tokio::time::timeout(timeout, &mut pending).await {
            result
        } else {
            tracing::warn!(key = ?pending.key(), "correlated response timed out");
            pending.cancel().await;
            Err(CallError::Timeout)
        }
    }

    /// Number of outstanding correlations.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Current login state.
    pub async fn handshake_state(&self) -> HandshakeState {
        self.inner.handshake.lock().await.state()
    }

    /// Retry login after a [`SessionEvent::LoginFailure`], reusing the last
    /// stream features the server sent.
    pub async fn reauthenticate(&self) {
        let actions = self.inner.handshake.lock().await.retry();
        self.perform(actions).await;
    }

    /// Route one inbound stanza.
    pub async fn route(&self, stanza: Element) {
        let Some(kind) = StanzaKind::classify(&stanza) else {
            tracing::debug!(element = stanza.name(), "ignoring unroutable element");
            return;
        };

        let stanza = match self.resolve(kind, stanza).await {
            Some(unmatched) => unmatched,
            None => return,
        };

        match kind {
            StanzaKind::Features => {
                let actions = self.inner.handshake.lock().await.on_features(&stanza);
                self.perform(actions).await;
            }
            StanzaKind::Sasl => {
                let actions = self.inner.handshake.lock().await.on_sasl(&stanza);
                self.perform(actions).await;
            }
            _ if stanza::is_error(&stanza) => {
                if kind == StanzaKind::Iq {
                    let actions = self
                        .inner
                        .handshake
                        .lock()
                        .await
                        .on_uncorrelated_error(&stanza);
                    self.perform(actions).await;
                }
                self.inner.handler.on_error(&stanza);
            }
            StanzaKind::Iq => self.inner.handler.on_iq(&stanza),
            StanzaKind::Presence => self.inner.handler.on_presence(&stanza),
            StanzaKind::Message => self.inner.handler.on_message(&stanza),
        }
    }

    /// Fail every outstanding correlation and refuse new dispatches.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let dropped = core::mem::take(&mut *self.inner.pending.lock().await);
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropping pending correlations");
        }
    }

    /// Fulfil a matching correlation, or hand the stanza back.
    async fn resolve(&self, kind: StanzaKind, stanza: Element) -> Option<Element> {
        let waiter = self.inner.pending.lock().await.take_match(kind, &stanza);

        match waiter {
            Some((key, waiter)) => {
                if let Err(stanza) = waiter.tx.send(stanza) {
                    tracing::debug!(?key, "correlated caller went away; routing normally");
                    return Some(stanza);
                }
                tracing::debug!(?key, "correlation fulfilled");
                None
            }
            None => Some(stanza),
        }
    }

    fn perform(&self, actions: Vec<HandshakeAction>) -> BoxFuture<'_, ()> {
        async move {
            for action in actions {
                match action {
                    HandshakeAction::Send(text) => {
                        if self.inner.session.enqueue(text).is_err() {
                            tracing::debug!("session closed during handshake");
                        }
                    }
                    HandshakeAction::SendCorrelated { stanza, id, step } => {
                        let pending = match self.dispatch(stanza, Correlation::iq(id)).await {
                            Ok(pending) => pending,
                            Err(e) => {
                                tracing::debug!("handshake iq not sent: {e}");
                                continue;
                            }
                        };
                        let this = self.clone();
                        tokio::spawn(async move {
                            match pending.await {
                                Ok(iq) => {
                                    let next = this.inner.handshake.lock().await.on_result(step, &iq);
                                    this.perform(next).await;
                                }
                                Err(e) => tracing::debug!(?step, "handshake iq abandoned: {e}"),
                            }
                        });
                    }
                    HandshakeAction::Restart => {
                        if self.inner.session.restart().is_err() {
                            tracing::debug!("session closed before restart");
                        }
                    }
                    HandshakeAction::Active(jid) => {
                        tracing::info!(%jid, "session active");
                        self.emit(SessionEvent::Active { jid }).await;
                    }
                    HandshakeAction::Failed(reason) => {
                        self.emit(SessionEvent::LoginFailure { reason }).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn emit(&self, event: SessionEvent) {
        let Some(events) = self.inner.events.upgrade() else {
            tracing::debug!("session driver gone; event dropped");
            return;
        };
        if events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}

impl InboundSink for Dispatcher {
    fn on_stanza(&self, stanza: Element) -> BoxFuture<'_, ()> {
        self.route(stanza).boxed()
    }

    fn on_terminated(&self, reason: Option<&str>) -> BoxFuture<'_, ()> {
        tracing::debug!(?reason, "session terminated; releasing dispatcher");
        self.shutdown().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http_client::{HttpClient, HttpResponse},
        session::{SessionDriver, session},
    };
    use url::Url;

    #[derive(Clone)]
    struct Unreachable;

    #[derive(Debug, thiserror::Error)]
    #[error("unreachable")]
    struct NoNetwork;

    impl HttpClient for Unreachable {
        type Error = NoNetwork;

        fn post(
            &self,
            _url: &str,
            _headers: &[(&str, &str)],
            _body: Vec<u8>,
        ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>> {
            futures::future::pending().boxed()
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        routed: async_channel::Receiver<RoutedStanza>,
        events: async_channel::Receiver<SessionEvent>,
        _driver: SessionDriver<Unreachable>,
    }

    fn fixture(config: &BoshConfig) -> Fixture {
        let (events_tx, events) = async_channel::unbounded();
        let (handle, driver) = session(config, Unreachable, events_tx.clone());
        let (handler, routed) = ChannelHandler::new();
        let dispatcher = Dispatcher::new(
            handle,
            config,
            vec![Box::new(crate::sasl::Anonymous)],
            Arc::new(handler),
            events_tx,
        );
        Fixture {
            dispatcher,
            routed,
            events,
            _driver: driver,
        }
    }

    fn config() -> BoshConfig {
        BoshConfig::new(
            Url::parse("http://localhost:5280/http-bind").expect("url"),
            "example.com",
        )
    }

    fn parse(xml: &str) -> Element {
        Element::parse(xml).expect("parse")
    }

    #[tokio::test]
    async fn correlated_iq_resolves_exactly_once() {
        let fx = fixture(&config());
        let pending = fx
            .dispatcher
            .dispatch("<iq type='get' id='q1'/>", Correlation::iq("q1"))
            .await
            .expect("dispatch");

        fx.dispatcher.route(parse("<iq type='result' id='q1'/>")).await;
        fx.dispatcher
            .route(parse("<iq type='result' id='q1'><dup/></iq>"))
            .await;

        let resolved = pending.await.expect("resolved");
        assert!(resolved.child("dup").is_none());

        let routed = fx.routed.try_recv().expect("second reaches handler");
        assert_eq!(routed.kind, StanzaKind::Iq);
        assert!(routed.stanza.child("dup").is_some());
        assert_eq!(fx.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn error_stanza_goes_to_correlation_first() {
        let fx = fixture(&config());
        let pending = fx
            .dispatcher
            .dispatch("<iq type='get' id='q2'/>", Correlation::iq("q2"))
            .await
            .expect("dispatch");

        fx.dispatcher
            .route(parse(
                "<iq type='error' id='q2'><error type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            ))
            .await;

        let error = pending.await.expect("resolved");
        assert_eq!(
            stanza::error_condition(&error).as_deref(),
            Some("item-not-found")
        );
        assert!(fx.routed.try_recv().is_err());
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn uncorrelated_error_reaches_error_handler() {
        let fx = fixture(&config());
        fx.dispatcher
            .route(parse("<message type='error' id='m9'/>"))
            .await;

        let routed = fx.routed.try_recv().expect("routed");
        assert!(routed.is_error);
        assert_eq!(routed.kind, StanzaKind::Message);
    }

    #[tokio::test]
    async fn uncorrelated_iq_error_before_active_is_login_failure() {
        let fx = fixture(&config());
        fx.dispatcher
            .route(parse(
                "<iq type='error' id='zz'><error type='auth'>\
                 <not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            ))
            .await;

        assert_eq!(
            fx.events.try_recv(),
            Ok(SessionEvent::LoginFailure {
                reason: "not-authorized".into()
            })
        );
    }

    #[tokio::test]
    async fn match_attribute_override_applies() {
        let config = config().with_match_attribute(StanzaKind::Presence, "from");
        let fx = fixture(&config);
        let pending = fx
            .dispatcher
            .dispatch(
                "<presence to='room@muc.example.com/me'/>",
                Correlation::new(StanzaKind::Presence, "room@muc.example.com/me"),
            )
            .await
            .expect("dispatch");
        assert_eq!(pending.key().attribute, "from");

        fx.dispatcher
            .route(parse("<presence from='room@muc.example.com/me'/>"))
            .await;
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn per_call_attribute_wins() {
        let fx = fixture(&config());
        let pending = fx
            .dispatcher
            .dispatch(
                "<message/>",
                Correlation::new(StanzaKind::Message, "thread-7").with_match_attr("thread"),
            )
            .await
            .expect("dispatch");
        fx.dispatcher
            .route(parse("<message thread='thread-7'/>"))
            .await;
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn cancel_removes_entry_and_routes_later_reply() {
        let fx = fixture(&config());
        let mut pending = fx
            .dispatcher
            .dispatch("<iq id='c1'/>", Correlation::iq("c1"))
            .await
            .expect("dispatch");
        pending.cancel().await;
        assert_eq!(fx.dispatcher.pending_count().await, 0);
        assert_eq!((&mut pending).await, Err(CallError::Cancelled));

        fx.dispatcher.route(parse("<iq type='result' id='c1'/>")).await;
        assert!(fx.routed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_pending_releases_entry() {
        let fx = fixture(&config());
        let pending = fx
            .dispatcher
            .dispatch("<iq id='gone'/>", Correlation::iq("gone"))
            .await
            .expect("dispatch");
        assert_eq!(fx.dispatcher.pending_count().await, 1);

        drop(pending);
        assert_eq!(fx.dispatcher.pending_count().await, 0);

        fx.dispatcher
            .route(parse("<iq type='result' id='gone'/>"))
            .await;
        let routed = fx.routed.try_recv().expect("late reply reaches handler");
        assert_eq!(routed.stanza.attr("id"), Some("gone"));
    }

    #[tokio::test]
    async fn configured_and_per_call_attributes_coexist() {
        let config = config().with_match_attribute(StanzaKind::Presence, "from");
        let fx = fixture(&config);
        let by_from = fx
            .dispatcher
            .dispatch(
                "<presence to='room@muc.example.com/me'/>",
                Correlation::new(StanzaKind::Presence, "room@muc.example.com/me"),
            )
            .await
            .expect("dispatch");
        let by_id = fx
            .dispatcher
            .dispatch(
                "<presence id='p1'/>",
                Correlation::new(StanzaKind::Presence, "p1").with_match_attr("id"),
            )
            .await
            .expect("dispatch");
        assert_eq!(fx.dispatcher.pending_count().await, 2);

        fx.dispatcher.route(parse("<presence id='p1'/>")).await;
        fx.dispatcher
            .route(parse("<presence from='room@muc.example.com/me'/>"))
            .await;

        assert_eq!(by_id.await.expect("by id").attr("id"), Some("p1"));
        assert_eq!(
            by_from.await.expect("by from").attr("from"),
            Some("room@muc.example.com/me")
        );
        assert!(fx.routed.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_close_when_driver_stops() {
        let Fixture {
            dispatcher,
            events,
            _driver: driver,
            ..
        } = fixture(&config());
        drop(driver);

        assert!(events.recv().await.is_err());
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_key_drops_first_waiter() {
        let fx = fixture(&config());
        let first = fx
            .dispatcher
            .dispatch("<iq id='d'/>", Correlation::iq("d"))
            .await
            .expect("dispatch");
        let second = fx
            .dispatcher
            .dispatch("<iq id='d'/>", Correlation::iq("d"))
            .await
            .expect("dispatch");

        assert!(matches!(first.await, Err(CallError::ResponseDropped(_))));
        fx.dispatcher.route(parse("<iq type='result' id='d'/>")).await;
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_refuses_new_dispatch() {
        let fx = fixture(&config());
        let pending = fx
            .dispatcher
            .dispatch("<iq id='s'/>", Correlation::iq("s"))
            .await
            .expect("dispatch");

        fx.dispatcher.shutdown().await;
        assert!(matches!(pending.await, Err(CallError::ResponseDropped(_))));
        assert!(
            fx.dispatcher
                .dispatch("<iq id='t'/>", Correlation::iq("t"))
                .await
                .is_err()
        );
        assert_eq!(fx.dispatcher.send("<presence/>"), Err(SendError));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_with_timeout_removes_entry() {
        let fx = fixture(&config());
        let result = fx
            .dispatcher
            .dispatch_with_timeout(
                "<iq id='slow'/>",
                Correlation::iq("slow"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(result, Err(CallError::Timeout));
        assert_eq!(fx.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_elements_are_ignored() {
        let fx = fixture(&config());
        fx.dispatcher.route(parse("<unknown/>")).await;
        assert!(fx.routed.try_recv().is_err());
    }

    #[tokio::test]
    async fn sasl_features_start_authentication() {
        let fx = fixture(&config());
        fx.dispatcher
            .route(parse(
                "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
                 <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                 <mechanism>ANONYMOUS</mechanism></mechanisms></stream:features>",
            ))
            .await;
        assert_eq!(
            fx.dispatcher.handshake_state().await,
            HandshakeState::Authenticating
        );
    }
}
