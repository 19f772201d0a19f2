//! Connection configuration.
//!
//! A [`BoshConfig`] can be built in code with the `with_*` methods or loaded
//! from TOML:
//!
//! ```toml
//! service_url = "https://xmpp.example.com/http-bind"
//! domain = "example.com"
//! resource = "desk"
//! hold = 1
//! wait_secs = 60
//! strategy = "long-poll"
//!
//! [match_attributes]
//! presence = "from"
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_SEND_DEBOUNCE_MS,
    REASSEMBLY_SLACK, error::ConfigError, stanza::StanzaKind,
};

/// Attribute used for correlation when no override is configured.
pub const DEFAULT_MATCH_ATTRIBUTE: &str = "id";

/// Longest `wait_secs` accepted.
pub const MAX_WAIT_SECS: u64 = 3_600;

/// Longest timer setting accepted, in milliseconds.
pub const MAX_TIMER_MS: u64 = 3_600_000;

/// Margin added on top of `wait` before a held request is declared lost.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// How exchanges are scheduled against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportStrategy {
    /// Request/response with the server holding up to `hold` requests open.
    #[default]
    LongPoll,

    /// One short exchange at a time (`hold = 0`), repeated at the polling
    /// interval.
    Polling,
}

/// Options for opening a BOSH session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoshConfig {
    /// The connection manager endpoint.
    pub service_url: Url,

    /// Target XMPP domain (`to` attribute).
    pub domain: String,

    /// Preferred resource; the server may assign a different one.
    #[serde(default)]
    pub resource: Option<String>,

    /// Maximum number of requests the server may hold open.
    #[serde(default = "default_hold")]
    pub hold: u32,

    /// Longest time, in seconds, the server may wait before responding.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    /// Minimum time, in milliseconds, between empty polls.
    #[serde(default = "default_polling_ms")]
    pub polling_ms: u64,

    /// Ask the connection manager to use an encrypted upstream connection.
    #[serde(default)]
    pub secure: bool,

    /// Exchange scheduling strategy.
    #[serde(default)]
    pub strategy: TransportStrategy,

    /// Value of `xml:lang`.
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Optional `route` attribute (`xmpp:host:port`).
    #[serde(default)]
    pub route: Option<String>,

    /// Coalescing window, in milliseconds, for stanzas queued while an
    /// exchange is outstanding.
    #[serde(default = "default_send_debounce_ms")]
    pub send_debounce_ms: u64,

    /// Keepalive timer interval in milliseconds.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Delay, in milliseconds, before the next flush after a transport error.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Consecutive transport failures tolerated before terminating.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Slack added to `hold` for the out-of-order reassembly window.
    #[serde(default = "default_reassembly_slack")]
    pub reassembly_slack: u64,

    /// Per-kind correlation attribute overrides (default `id`).
    #[serde(default)]
    pub match_attributes: BTreeMap<StanzaKind, String>,
}

const fn default_hold() -> u32 {
    1
}

const fn default_wait_secs() -> u64 {
    60
}

const fn default_polling_ms() -> u64 {
    2_000
}

fn default_lang() -> String {
    "en".into()
}

const fn default_send_debounce_ms() -> u64 {
    DEFAULT_SEND_DEBOUNCE_MS
}

const fn default_keepalive_interval_ms() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_MS
}

const fn default_retry_delay_ms() -> u64 {
    1_000
}

const fn default_max_consecutive_errors() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_ERRORS
}

const fn default_reassembly_slack() -> u64 {
    REASSEMBLY_SLACK
}

impl BoshConfig {
    /// Create a configuration with defaults for everything but the endpoint
    /// and domain.
    #[must_use]
    pub fn new(service_url: Url, domain: impl Into<String>) -> Self {
        Self {
            service_url,
            domain: domain.into(),
            resource: None,
            hold: default_hold(),
            wait_secs: default_wait_secs(),
            polling_ms: default_polling_ms(),
            secure: false,
            strategy: TransportStrategy::default(),
            lang: default_lang(),
            route: None,
            send_debounce_ms: default_send_debounce_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
            reassembly_slack: default_reassembly_slack(),
            match_attributes: BTreeMap::new(),
        }
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is invalid and
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that a session can be opened with these settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(reason))
        };

        if self.domain.trim().is_empty() {
            return invalid("domain is empty".into());
        }
        if !matches!(self.service_url.scheme(), "http" | "https") {
            return invalid(format!(
                "unsupported scheme {:?}",
                self.service_url.scheme()
            ));
        }
        if !(1..=MAX_WAIT_SECS).contains(&self.wait_secs) {
            return invalid(format!("wait_secs must be between 1 and {MAX_WAIT_SECS}"));
        }
        if self.keepalive_interval_ms == 0 {
            return invalid("keepalive_interval_ms must be positive".into());
        }
        for (name, value) in [
            ("polling_ms", self.polling_ms),
            ("send_debounce_ms", self.send_debounce_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("retry_delay_ms", self.retry_delay_ms),
        ] {
            if value > MAX_TIMER_MS {
                return invalid(format!("{name} must not exceed {MAX_TIMER_MS}"));
            }
        }
        Ok(())
    }

    /// Read and parse a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Set the preferred resource.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the maximum number of held requests.
    #[must_use]
    pub const fn with_hold(mut self, hold: u32) -> Self {
        self.hold = hold;
        self
    }

    /// Set the longest server wait.
    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_secs = wait.as_secs();
        self
    }

    /// Set the minimum interval between empty polls.
    #[must_use]
    pub fn with_polling(mut self, polling: Duration) -> Self {
        self.polling_ms = millis(polling);
        self
    }

    /// Set the transport strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: TransportStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Request a secure upstream connection.
    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the send coalescing window.
    #[must_use]
    pub fn with_send_debounce(mut self, debounce: Duration) -> Self {
        self.send_debounce_ms = millis(debounce);
        self
    }

    /// Set the keepalive interval.
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = millis(interval);
        self
    }

    /// Set the delay before retrying after a transport error.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = millis(delay);
        self
    }

    /// Set the consecutive transport failure limit.
    #[must_use]
    pub const fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    /// Correlate stanzas of `kind` on `attribute` instead of `id`.
    #[must_use]
    pub fn with_match_attribute(mut self, kind: StanzaKind, attribute: impl Into<String>) -> Self {
        self.match_attributes.insert(kind, attribute.into());
        self
    }

    /// The attribute used to correlate stanzas of `kind`.
    #[must_use]
    pub fn match_attribute(&self, kind: StanzaKind) -> &str {
        self.match_attributes
            .get(&kind)
            .map_or(DEFAULT_MATCH_ATTRIBUTE, String::as_str)
    }

    /// The `hold` value sent to the server: zero when polling.
    #[must_use]
    pub const fn effective_hold(&self) -> u32 {
        match self.strategy {
            TransportStrategy::LongPoll => self.hold,
            TransportStrategy::Polling => 0,
        }
    }

    /// Longest server wait.
    #[must_use]
    pub const fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Minimum interval between empty polls.
    #[must_use]
    pub const fn polling(&self) -> Duration {
        Duration::from_millis(self.polling_ms)
    }

    /// Send coalescing window.
    #[must_use]
    pub const fn send_debounce(&self) -> Duration {
        Duration::from_millis(self.send_debounce_ms)
    }

    /// Keepalive interval.
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Delay before retrying after a transport error.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Per-request timeout: the server wait plus a fixed margin.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.wait().saturating_add(REQUEST_TIMEOUT_MARGIN)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://localhost:5280/http-bind").expect("valid url")
    }

    #[test]
    fn defaults() {
        let config = BoshConfig::new(url(), "localhost");
        assert_eq!(config.hold, 1);
        assert_eq!(config.wait(), Duration::from_secs(60));
        assert_eq!(config.send_debounce(), Duration::from_millis(600));
        assert_eq!(config.reassembly_slack, 2);
        assert_eq!(config.match_attribute(StanzaKind::Iq), "id");
    }

    #[test]
    fn polling_strategy_forces_zero_hold() {
        let config = BoshConfig::new(url(), "localhost")
            .with_hold(2)
            .with_strategy(TransportStrategy::Polling);
        assert_eq!(config.effective_hold(), 0);
    }

    #[test]
    fn loads_from_toml_with_overrides() {
        let config = BoshConfig::from_toml_str(
            r#"
            service_url = "https://xmpp.example.com/http-bind"
            domain = "example.com"
            resource = "desk"
            hold = 2
            strategy = "polling"

            [match_attributes]
            presence = "from"
            "#,
        )
        .expect("valid config");

        assert_eq!(config.domain, "example.com");
        assert_eq!(config.resource.as_deref(), Some("desk"));
        assert_eq!(config.hold, 2);
        assert_eq!(config.strategy, TransportStrategy::Polling);
        assert_eq!(config.match_attribute(StanzaKind::Presence), "from");
        assert_eq!(config.match_attribute(StanzaKind::Iq), "id");
        assert_eq!(config.wait_secs, 60);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = BoshConfig::from_toml_str(
            r#"
            service_url = "https://xmpp.example.com/http-bind"
            domain = "example.com"
            holdd = 2
            "#,
        );
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn zero_keepalive_is_rejected() {
        let err = BoshConfig::from_toml_str(
            r#"
            service_url = "https://xmpp.example.com/http-bind"
            domain = "example.com"
            keepalive_interval_ms = 0
            "#,
        );
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn out_of_range_timers_are_rejected() {
        let mut config = BoshConfig::new(url(), "localhost");
        config.wait_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = BoshConfig::new(url(), "localhost");
        config.retry_delay_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(BoshConfig::new(url(), "localhost").validate().is_ok());
    }

    #[test]
    fn request_timeout_saturates() {
        let mut config = BoshConfig::new(url(), "localhost");
        config.wait_secs = u64::MAX;
        assert_eq!(config.request_timeout(), Duration::MAX);
    }
}
