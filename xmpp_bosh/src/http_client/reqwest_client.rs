//! [`reqwest`]-backed implementation of [`HttpClient`].

use futures::{FutureExt, future::BoxFuture};

use super::{HttpClient, HttpResponse};
use crate::config::BoshConfig;

/// Response headers the session reads; the body carries everything else.
const KEPT_HEADERS: [&str; 1] = ["retry-after"];

/// Error type for the reqwest-based HTTP client.
#[derive(Debug, thiserror::Error)]
#[error("HTTP request failed: {0}")]
pub struct ReqwestHttpError(#[from] reqwest::Error);

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a client with reqwest's default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client sized for a BOSH session.
    ///
    /// Keeps one idle connection per request slot (`hold + 1`) and applies
    /// the session's request timeout as a transport-level backstop.
    #[must_use]
    pub fn for_session(config: &BoshConfig) -> Self {
        let slots = usize::try_from(config.effective_hold())
            .unwrap_or(usize::MAX)
            .saturating_add(1);

        let inner = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(slots)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });

        Self { inner }
    }
}

impl HttpClient for ReqwestHttpClient {
    type Error = ReqwestHttpError;

    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>> {
        let request = headers
            .iter()
            .fold(self.inner.post(url), |req, &(name, value)| {
                req.header(name, value)
            })
            .body(body);

        async move {
            let resp = request.send().await?;
            let status = resp.status().as_u16();

            let headers = KEPT_HEADERS
                .iter()
                .filter_map(|&name| {
                    let value = resp.headers().get(name)?.to_str().ok()?;
                    Some((name.to_owned(), value.to_owned()))
                })
                .collect();

            let body = resp.bytes().await?.to_vec();

            Ok(HttpResponse {
                status,
                body,
                headers,
            })
        }
        .boxed()
    }
}
