//! Async driver for a [`SessionCore`].
//!
//! One task owns the core and multiplexes everything that can move it:
//!
//! ```text
//!   SessionHandle ──► commands ─┐
//!   in-flight POSTs (n ≤ slots) ┼──► select! ──► SessionCore ──► InboundSink
//!   keepalive tick ─────────────┤                    │
//!   debounce / retry deadline ──┤                    └──► HttpClient::post
//!   cancel ─────────────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::time::{Instant, MissedTickBehavior};

use super::{Delivery, OutboundRequest, Rid, SessionCore};
use crate::{
    CONTENT_TYPE,
    body::ResponseBody,
    config::BoshConfig,
    element::Element,
    error::{SendError, TransportError},
    events::SessionEvent,
    http_client::HttpClient,
};

/// Floor for the keepalive tick; `tokio::time::interval` rejects zero.
const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

type Exchange = BoxFuture<'static, (Rid, Result<ResponseBody, TransportError>)>;

/// Receives what the session accepts, in rid order.
pub trait InboundSink: Send + Sync + 'static {
    /// Handle one inbound stanza.
    fn on_stanza(&self, stanza: Element) -> BoxFuture<'_, ()>;

    /// The session ended; release anything waiting on it.
    fn on_terminated(&self, reason: Option<&str>) -> BoxFuture<'_, ()>;
}

#[derive(Debug)]
enum Command {
    Enqueue(String),
    Restart,
    Close(Option<String>),
}

/// A cloneable handle for feeding a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: async_channel::Sender<Command>,
}

impl SessionHandle {
    /// Queue serialized stanza text.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the session has shut down.
    pub fn enqueue(&self, stanza: impl Into<String>) -> Result<(), SendError> {
        self.command(Command::Enqueue(stanza.into()))
    }

    /// Request an XEP-0206 stream restart.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the session has shut down.
    pub fn restart(&self) -> Result<(), SendError> {
        self.command(Command::Restart)
    }

    /// Terminate the session, optionally with a last stanza.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the session has already shut down.
    pub fn close(&self, final_stanza: Option<String>) -> Result<(), SendError> {
        self.command(Command::Close(final_stanza))
    }

    /// Whether the driver has stopped accepting commands.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn command(&self, cmd: Command) -> Result<(), SendError> {
        self.tx.try_send(cmd).map_err(|_| SendError)
    }
}

/// Build a session and the handle that feeds it.
///
/// Nothing is sent until [`SessionDriver::run`] is polled.
pub fn session<H: HttpClient>(
    config: &BoshConfig,
    http: H,
    events: async_channel::Sender<SessionEvent>,
) -> (SessionHandle, SessionDriver<H>) {
    SessionDriver::with_core(SessionCore::new(config), config, http, events)
}

/// Runs one BOSH session to completion.
pub struct SessionDriver<H> {
    core: SessionCore,
    url: Arc<str>,
    request_timeout: Duration,
    send_debounce: Duration,
    keepalive_interval: Duration,
    http: H,
    events: async_channel::Sender<SessionEvent>,
    commands: async_channel::Receiver<Command>,
    exchanges: FuturesUnordered<Exchange>,
    deadline: Option<Instant>,
}

impl<H> core::fmt::Debug for SessionDriver<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("core", &self.core)
            .field("url", &self.url)
            .field("in_flight", &self.exchanges.len())
            .finish_non_exhaustive()
    }
}

impl<H: HttpClient> SessionDriver<H> {
    /// Build a driver around an existing core.
    pub fn with_core(
        core: SessionCore,
        config: &BoshConfig,
        http: H,
        events: async_channel::Sender<SessionEvent>,
    ) -> (SessionHandle, Self) {
        let (tx, commands) = async_channel::unbounded();
        let driver = Self {
            core,
            url: Arc::from(config.service_url.as_str()),
            request_timeout: config.request_timeout(),
            send_debounce: config.send_debounce(),
            keepalive_interval: config.keepalive_interval(),
            http,
            events,
            commands,
            exchanges: FuturesUnordered::new(),
            deadline: None,
        };
        (SessionHandle { tx }, driver)
    }

    /// Open the session and drive it until it terminates, handing accepted
    /// stanzas to `sink`.
    ///
    /// When `cancel` resolves the session is closed as if
    /// [`SessionHandle::close`] had been called.
    pub async fn run<S, Cancel>(mut self, sink: S, cancel: Cancel)
    where
        S: InboundSink,
        Cancel: Future<Output = ()> + Send,
    {
        let mut keepalive = tokio::time::interval(self.keepalive_interval.max(MIN_KEEPALIVE));
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = cancel.fuse();
        futures::pin_mut!(cancel);

        if let Some(req) = self.core.open(now()) {
            self.launch(req);
        }

        loop {
            if self.core.is_terminated() && self.exchanges.is_empty() {
                break;
            }
            let terminated = self.core.is_terminated();
            let wake_at = self.deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                () = &mut cancel, if !terminated => {
                    tracing::info!("session cancelled");
                    self.close(None, &sink).await;
                }

                cmd = self.commands.recv(), if !terminated => {
                    self.on_commands(cmd.ok(), &sink).await;
                }

                Some((rid, result)) = self.exchanges.next(), if !self.exchanges.is_empty() => {
                    let at = now();
                    let delivery = match result {
                        Ok(body) => self.core.on_response(rid, body),
                        Err(e) => self.core.on_transport_error(rid, &e, at),
                    };
                    self.deliver(delivery, &sink).await;

                    if let Some(retry_at) = self.core.retry_at() {
                        self.deadline = Some(Instant::from_std(retry_at));
                    } else {
                        self.pump();
                    }
                }

                () = tokio::time::sleep_until(wake_at), if self.deadline.is_some() => {
                    self.deadline = None;
                    self.pump();
                }

                _ = keepalive.tick(), if !terminated => {
                    self.pump();
                }
            }

            if !self.core.has_pending() && self.core.retry_at().is_none() {
                self.deadline = None;
            }
        }

        self.commands.close();
        tracing::debug!("session driver stopped");
    }

    /// Apply `first` and every command already queued behind it, then flush.
    ///
    /// A synchronous burst of enqueues therefore leaves in one envelope.
    async fn on_commands<S: InboundSink>(&mut self, first: Option<Command>, sink: &S) {
        let mut next = first;
        let mut flush_now = false;

        loop {
            match next {
                Some(Command::Enqueue(stanza)) => {
                    self.core.enqueue(stanza, now());
                }
                Some(Command::Restart) => {
                    flush_now |= self.core.request_restart();
                }
                Some(Command::Close(final_stanza)) => {
                    self.close(final_stanza, sink).await;
                    return;
                }
                None => {
                    tracing::debug!("all session handles dropped");
                    self.close(None, sink).await;
                    return;
                }
            }

            match self.commands.try_recv() {
                Ok(cmd) => next = Some(cmd),
                Err(_) => break,
            }
        }

        if flush_now || self.core.in_flight() == 0 {
            self.pump();
        }
        if let (None, Some(since)) = (self.deadline, self.core.pending_since()) {
            let since = Instant::from_std(since);
            self.deadline = Some(since.checked_add(self.send_debounce).unwrap_or(since));
        }
    }

    /// Send every request the core is willing to send right now.
    fn pump(&mut self) {
        while let Some(req) = self.core.flush(now()) {
            self.launch(req);
        }
    }

    async fn close<S: InboundSink>(&mut self, final_stanza: Option<String>, sink: &S) {
        let closing = self.core.close(final_stanza, now());
        self.exchanges.clear();
        if let Some(req) = closing.request {
            self.launch(req);
        }
        if let Some(termination) = closing.terminated {
            self.finish(termination.reason, sink).await;
        }
    }

    async fn deliver<S: InboundSink>(&mut self, delivery: Delivery, sink: &S) {
        if let Some(sid) = delivery.ready {
            self.emit(SessionEvent::Ready { sid }).await;
        }

        for stanza in delivery.stanzas {
            sink.on_stanza(stanza).await;
        }

        if let Some(termination) = delivery.terminated {
            self.exchanges.clear();
            self.finish(termination.reason, sink).await;
        }
    }

    async fn finish<S: InboundSink>(&mut self, reason: Option<String>, sink: &S) {
        sink.on_terminated(reason.as_deref()).await;
        self.emit(SessionEvent::Terminated { reason }).await;
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    fn launch(&mut self, req: OutboundRequest) {
        let http = self.http.clone();
        let url = self.url.clone();
        let limit = self.request_timeout;
        let rid = req.rid;
        let payload = req.encode().into_bytes();
        tracing::trace!(%rid, "POST {url}");

        let exchange = async move {
            let post = http.post(&url, &[("content-type", CONTENT_TYPE)], payload);
            let result = match tokio::time::timeout(limit, post).await {
                Err(_elapsed) => Err(TransportError::Timeout),
                Ok(Err(e)) => Err(TransportError::Request(e.to_string())),
                Ok(Ok(resp)) if resp.is_success() => {
                    ResponseBody::parse(&resp.body).map_err(TransportError::from)
                }
                Ok(Ok(resp)) => Err(TransportError::Status {
                    status: resp.status,
                    body: ResponseBody::parse(&resp.body).ok(),
                    retry_after: resp
                        .header("retry-after")
                        .and_then(|v| v.trim().parse().ok())
                        .map(Duration::from_secs),
                }),
            };
            (rid, result)
        };
        self.exchanges.push(exchange.boxed());
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
