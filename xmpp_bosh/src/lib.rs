//! # XMPP over BOSH
//!
//! A client for carrying an XMPP stream over BOSH (XEP-0124 / XEP-0206):
//! a sequence of ordinary HTTP request/response exchanges, each wrapping
//! zero or more stanzas in a `<body/>` envelope.
//!
//! # Protocol
//!
//! ```text
//! ┌──────────┐                                   ┌──────────┐
//! │  Client  │                                   │  Server  │
//! └────┬─────┘                                   └────┬─────┘
//!      │  POST <body rid=n to= wait= hold=/>          │
//!      │ ───────────────────────────────────────────► │
//!      │  <body sid= requests= polling=>              │
//!      │    <stream:features>…</stream:features>      │
//!      │  </body>                                     │
//!      │ ◄─────────────────────────────────────────── │
//!      │                                              │
//!      │  POST <body sid= rid=n+1/>   (held)          │
//!      │ ───────────────────────────────────────────► │
//!      │  POST <body sid= rid=n+2><iq…/></body>       │
//!      │ ───────────────────────────────────────────► │
//!      │  200 <body/>                 (rid n+2)       │
//!      │ ◄─────────────────────────────────────────── │
//!      │  200 <body><iq type=result…/></body> (n+1)   │
//!      │ ◄─────────────────────────────────────────── │
//!      │                                              │
//!      │  POST <body sid= rid=… type=terminate/>      │
//!      │ ───────────────────────────────────────────► │
//! ```
//!
//! Responses may complete out of order when more than one request is held.
//! The session reorders them by `rid` before any stanza reaches the
//! dispatcher.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       BoshConnection                       │
//! │                                                           │
//! │  Dispatcher::dispatch ──► SessionHandle ──► driver task    │
//! │    pending: Map<CorrelationKey, Waiter>     SessionCore    │
//! │                                             HttpClient     │
//! │  Dispatcher::on_stanza ◄── accepted envelopes (rid order)  │
//! │    └─► correlation │ StanzaHandler │ handshake             │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod body;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod element;
pub mod error;
pub mod events;
pub mod handshake;
pub mod http_client;
pub mod jid;
pub mod sasl;
pub mod session;
pub mod stanza;

/// BOSH protocol version advertised in the `ver` attribute.
pub const BOSH_VERSION: &str = "1.6";

/// XMPP version advertised in the `xmpp:version` attribute (XEP-0206).
pub const XMPP_VERSION: &str = "1.0";

/// Content type of every request body.
pub const CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Extra slack added to the server's `hold` value when deciding whether an
/// early response is buffered for reordering or dropped as stale.
pub const REASSEMBLY_SLACK: u64 = 2;

/// Default window during which a burst of enqueued stanzas is coalesced
/// into a single exchange while another exchange is outstanding.
pub const DEFAULT_SEND_DEBOUNCE_MS: u64 = 600;

/// Default interval of the keepalive timer.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 2_000;

/// Default number of consecutive transport failures tolerated before the
/// session gives up.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;
