//! Connection setup.
//!
//! [`BoshClient::connect`] builds the session, the dispatcher and the
//! handshake, spawns the driver task, and returns a [`BoshConnection`]
//! that exposes the dispatcher and the lifecycle event stream.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    config::BoshConfig,
    dispatcher::{Dispatcher, StanzaHandler},
    error::{ClientError, ConfigError, SendError},
    events::SessionEvent,
    http_client::HttpClient,
    jid::Jid,
    sasl::SaslMechanism,
    session::{self, SessionHandle},
};

/// Opens BOSH sessions against one connection manager.
#[derive(Debug, Clone)]
pub struct BoshClient<H> {
    config: BoshConfig,
    http: H,
}

impl<H: HttpClient> BoshClient<H> {
    /// Create a client.
    #[must_use]
    pub const fn new(config: BoshConfig, http: H) -> Self {
        Self { config, http }
    }

    /// The configuration sessions are opened with.
    #[must_use]
    pub const fn config(&self) -> &BoshConfig {
        &self.config
    }

    /// Open a session and start logging in.
    ///
    /// Returns as soon as the driver task is running; use
    /// [`BoshConnection::wait_active`] or [`BoshConnection::events`] to
    /// follow progress. The session is closed when `cancel` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if the configuration cannot
    /// open a session.
    pub fn connect<Cancel>(
        &self,
        mechanisms: Vec<Box<dyn SaslMechanism>>,
        handler: Arc<dyn StanzaHandler>,
        cancel: Cancel,
    ) -> Result<BoshConnection, ClientError>
    where
        Cancel: Future<Output = ()> + Send + 'static,
    {
        self.validate()?;

        let (events_tx, events) = async_channel::unbounded();
        let (handle, driver) = session::session(&self.config, self.http.clone(), events_tx.clone());
        let dispatcher = Dispatcher::new(
            handle.clone(),
            &self.config,
            mechanisms,
            handler,
            events_tx,
        );

        tracing::info!(
            url = %self.config.service_url,
            domain = %self.config.domain,
            strategy = ?self.config.strategy,
            "connecting"
        );
        let task = tokio::spawn(driver.run(dispatcher.clone(), cancel));

        Ok(BoshConnection {
            dispatcher,
            session: handle,
            events,
            task,
        })
    }

    fn validate(&self) -> Result<(), ClientError> {
        self.config.validate().map_err(|e| match e {
            ConfigError::Invalid(reason) => ClientError::InvalidConfig(reason),
            other => ClientError::InvalidConfig(other.to_string()),
        })
    }
}

/// A live BOSH session.
#[derive(Debug)]
pub struct BoshConnection {
    dispatcher: Dispatcher,
    session: SessionHandle,
    events: async_channel::Receiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl BoshConnection {
    /// The dispatcher for sending stanzas and awaiting responses.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Lifecycle events, in order.
    #[must_use]
    pub const fn events(&self) -> &async_channel::Receiver<SessionEvent> {
        &self.events
    }

    /// Wait until login completes.
    ///
    /// Consumes events up to and including the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::LoginFailed`] on a login failure and
    /// [`ClientError::Terminated`] if the session ends first.
    pub async fn wait_active(&self) -> Result<Jid, ClientError> {
        loop {
            match self.events.recv().await {
                Ok(SessionEvent::Active { jid }) => return Ok(jid),
                Ok(SessionEvent::LoginFailure { reason }) => {
                    return Err(ClientError::LoginFailed { reason });
                }
                Ok(SessionEvent::Terminated { reason }) => {
                    return Err(ClientError::Terminated { reason });
                }
                Ok(SessionEvent::Ready { sid }) => {
                    tracing::debug!(%sid, "session ready, waiting for login");
                }
                Err(_) => return Err(ClientError::Terminated { reason: None }),
            }
        }
    }

    /// Close the session, optionally sending one last stanza.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the session already ended.
    pub fn close(&self, final_stanza: Option<String>) -> Result<(), SendError> {
        self.session.close(final_stanza)
    }

    /// Wait for the driver task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("session driver panicked: {e}");
        }
    }
}
