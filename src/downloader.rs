use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::{Client, ClientBuilder, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;
use crate::html_parser::AssetReference;

/// Desktop Chrome; some hosts refuse obvious bot agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// HTTP session shared read-only by every fetch of a run.
///
/// Cookies are scoped to the root URL's host, so they accompany the root
/// document and same-host assets but never leak to third-party hosts.
#[derive(Clone)]
pub struct SessionContext {
    client: Client,
}

impl SessionContext {
    pub fn new(
        root_url: &Url,
        cookies: &[SessionCookie],
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let jar = Jar::default();
        for cookie in cookies {
            jar.add_cookie_str(&format!("{}={}; Path=/", cookie.name, cookie.value), root_url);
        }

        let client = ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(user_agent)
            .timeout(timeout)
            .cookie_provider(Arc::new(jar))
            .build()?;

        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// A successful retrieval.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// URL after redirects.
    pub final_url: Url,
}

pub type FetchOutcome = Result<Fetched, FetchError>;

/// Outcome of fetching one unique asset; handed to the writer once.
#[derive(Debug)]
pub struct FetchResult {
    pub asset: AssetReference,
    pub outcome: FetchOutcome,
}

/// Retrieves one URL. Implementations report every failure as a value.
pub trait AssetFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &Url,
        session: &SessionContext,
    ) -> impl Future<Output = FetchOutcome> + Send;
}

/// GETs over the session's client. Only `200 OK` counts as success.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, session: &SessionContext) -> FetchOutcome {
        debug!(%url, "sending request");
        let response = match session.client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = FetchError::from(e);
                warn!(%url, error = %err, "request failed");
                return Err(err);
            }
        };

        if response.status() != StatusCode::OK {
            warn!(%url, status = %response.status(), "unexpected status");
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!(%url, error = %e, "failed to read response body");
                return Err(if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Body(e.to_string())
                });
            }
        };

        debug!(%url, len = bytes.len(), "fetched");
        Ok(Fetched {
            bytes,
            content_type,
            final_url,
        })
    }
}
