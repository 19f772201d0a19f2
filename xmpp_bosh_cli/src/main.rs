//! `bosh-probe`: open an anonymous XMPP session over BOSH and report what
//! happens.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context as _, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use url::Url;
use xmpp_bosh::{
    client::{BoshClient, BoshConnection},
    config::{BoshConfig, TransportStrategy},
    dispatcher::{Correlation, StanzaHandler},
    element::Element,
    events::SessionEvent,
    http_client::ReqwestHttpClient,
    sasl::Anonymous,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let token = token.clone();
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if hits.fetch_add(1, Ordering::Relaxed) == 0 {
                        eprintln!("Ctrl+C, closing session… (press again to force)");
                        token.cancel();
                    } else {
                        eprintln!("Force exiting.");
                        std::process::exit(130);
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let token = token.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                eprintln!("SIGTERM, closing session…");
                token.cancel();
            }
        });
    }

    let args = Arguments::parse();
    let config = args.config()?;
    let http = ReqwestHttpClient::for_session(&config);

    let connection = BoshClient::new(config, http).connect(
        vec![Box::new(Anonymous)],
        Arc::new(LogHandler),
        token.clone().cancelled_owned(),
    )?;

    run(&connection, &args).await;
    connection.join().await;
    Ok(())
}

async fn run(connection: &BoshConnection, args: &Arguments) {
    while let Ok(event) = connection.events().recv().await {
        let last = event.is_terminal();
        match event {
            SessionEvent::Ready { sid } => tracing::info!(%sid, "session created"),
            SessionEvent::Active { jid } => {
                tracing::info!(%jid, "logged in");
                for n in 0..args.pings {
                    ping(connection, jid.domain(), n).await;
                }
                if !args.stay {
                    let _ = connection.close(Some(
                        "<presence xmlns='jabber:client' type='unavailable'/>".into(),
                    ));
                }
            }
            SessionEvent::LoginFailure { reason } => {
                tracing::error!(%reason, "login failed");
                let _ = connection.close(None);
            }
            SessionEvent::Terminated { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or("closed"), "session ended");
            }
        }
        if last {
            break;
        }
    }
}

async fn ping(connection: &BoshConnection, domain: &str, n: u32) {
    let id = format!("ping-{n}");
    let stanza = format!(
        "<iq xmlns='jabber:client' type='get' to='{domain}' id='{id}'>\
         <ping xmlns='urn:xmpp:ping'/></iq>"
    );
    let started = Instant::now();

    match connection
        .dispatcher()
        .dispatch_with_timeout(stanza, Correlation::iq(id), PING_TIMEOUT)
        .await
    {
        Ok(reply) => tracing::info!(
            rtt = ?started.elapsed(),
            kind = reply.attr("type").unwrap_or("?"),
            "ping answered"
        ),
        Err(e) => tracing::warn!("ping failed: {e}"),
    }
}

const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Logs every stanza nobody was waiting for.
struct LogHandler;

impl StanzaHandler for LogHandler {
    fn on_iq(&self, iq: &Element) {
        tracing::info!(stanza = %iq, "iq");
    }

    fn on_presence(&self, presence: &Element) {
        tracing::info!(stanza = %presence, "presence");
    }

    fn on_message(&self, message: &Element) {
        tracing::info!(stanza = %message, "message");
    }

    fn on_error(&self, stanza: &Element) {
        tracing::warn!(stanza = %stanza, "error stanza");
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Probe an XMPP-over-BOSH endpoint")]
struct Arguments {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// BOSH endpoint (overrides the config file).
    #[arg(short, long)]
    url: Option<Url>,

    /// XMPP domain (overrides the config file).
    #[arg(short, long)]
    domain: Option<String>,

    /// Preferred resource.
    #[arg(short, long)]
    resource: Option<String>,

    /// Poll instead of holding requests open.
    #[arg(long)]
    polling: bool,

    /// Number of XEP-0199 pings to send once logged in.
    #[arg(long, default_value_t = 1)]
    pings: u32,

    /// Keep the session open until Ctrl+C.
    #[arg(long)]
    stay: bool,
}

impl Arguments {
    fn config(&self) -> anyhow::Result<BoshConfig> {
        let mut config = match (&self.config, &self.url, &self.domain) {
            (Some(path), _, _) => BoshConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(url), Some(domain)) => BoshConfig::new(url.clone(), domain.clone()),
            _ => bail!("either --config or both --url and --domain are required"),
        };

        if let Some(url) = &self.url {
            config.service_url = url.clone();
        }
        if let Some(domain) = &self.domain {
            config.domain.clone_from(domain);
        }
        if let Some(resource) = &self.resource {
            config = config.with_resource(resource.clone());
        }
        if self.polling {
            config = config.with_strategy(TransportStrategy::Polling);
        }
        Ok(config)
    }
}
