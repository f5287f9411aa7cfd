//! HTTP retrieval of the activation code page
//!
//! The scheduler only depends on the [`Fetcher`] trait, so tests can substitute a
//! scripted fetcher. [`ReqwestFetcher`] is the real implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use thiserror::Error;

/// Page the codes are published on
pub const DEFAULT_CODES_URL: &str = "http://filecxx.com/en_US/activation_code.html";

/// Desktop browser identities, as (label, User-Agent) pairs
pub const BROWSER_IDENTITIES: [(&str, &str); 5] = [
    (
        "Chrome/Linux",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ),
    (
        "Chrome/Windows",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ),
    (
        "Firefox/Linux",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ),
    (
        "Firefox/Windows",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ),
    (
        "Edge/Windows",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
    ),
];

/// Broad classes of fetch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The request did not complete within the timeout
    Timeout,
    /// The server answered with a non-success status
    HttpStatus(u16),
    /// Connection, TLS, or body read failure
    Network,
    /// The fetch was abandoned because the process is shutting down
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Timeout => write!(f, "timeout"),
            FetchErrorKind::HttpStatus(status) => write!(f, "HTTP {}", status),
            FetchErrorKind::Network => write!(f, "network error"),
            FetchErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed page fetch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fetch failed ({kind}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if let Some(status) = err.status() {
            FetchErrorKind::HttpStatus(status.as_u16())
        } else {
            FetchErrorKind::Network
        };
        FetchError::new(kind, err.to_string())
    }
}

/// Raw page body plus what we know about how it was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub body: String,
    /// Label of the browser identity the request was sent as
    pub identity: String,
    /// Size of the response body in bytes
    pub bytes: usize,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError>;
}

/// Fetches the page over HTTP, posing as a randomly chosen desktop browser
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Create a fetcher with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn choose_identity() -> (&'static str, &'static str) {
        *BROWSER_IDENTITIES
            .choose(&mut rand::thread_rng())
            .unwrap_or(&BROWSER_IDENTITIES[0])
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, FetchError> {
        let (identity, user_agent) = Self::choose_identity();

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .header(USER_AGENT, user_agent)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FetchErrorKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        let body = response.text().await?;
        Ok(FetchedPage {
            bytes: body.len(),
            body,
            identity: identity.to_string(),
        })
    }
}
