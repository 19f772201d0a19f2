//! Connection lifecycle notifications.

use crate::{jid::Jid, session::Sid};

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection manager created the session.
    Ready {
        /// The assigned session id.
        sid: Sid,
    },

    /// Authentication and resource binding completed.
    Active {
        /// The full JID the server bound.
        jid: Jid,
    },

    /// Authentication or binding failed. The session stays open so the
    /// caller may retry.
    LoginFailure {
        /// The decoded error condition.
        reason: String,
    },

    /// The session ended. Emitted exactly once.
    Terminated {
        /// The terminate condition, or `None` for a local close.
        reason: Option<String>,
    },
}

impl SessionEvent {
    /// Whether no further events will follow.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}
