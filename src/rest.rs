//! Minimal HTTP interface to the REST API.
//!
//! Per-resource wrappers are out of scope: [`RestClient::request`] submits any
//! request and decodes the JSON reply into the caller's type. The only
//! built-in route is gateway discovery.

use crate::Config;
use derivative::Derivative;
use reqwest::{
    header::{AUTHORIZATION, RETRY_AFTER},
    Client,
    Method,
    Response,
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{error::Error as StdError, fmt, time::Duration};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Sends authenticated requests to the REST API.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct RestClient {
    http: Client,
    base: String,
    #[derivative(Debug = "ignore")]
    token: String,
}

/// Reply of `GET /gateway/bot`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct GatewayBot {
    /// Websocket URL to connect shards to.
    pub url: String,
    /// Recommended number of shards.
    pub shards: u64,
    /// Remaining identify budget.
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

/// Identify budget reported alongside [`GatewayBot`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct SessionStartLimit {
    /// Identifies allowed in the current window.
    pub total: u64,
    /// Identifies remaining in the current window.
    pub remaining: u64,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
    /// Identifies which may run concurrently.
    #[serde(default = "one")]
    pub max_concurrency: u64,
}

fn one() -> u64 {
    1
}

impl RestClient {
    /// Creates a client for `config.api_base`, authenticating as `config.token`.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// As [`RestClient::new`], reusing an existing HTTP client.
    #[must_use]
    pub fn with_client(http: Client, config: &Config) -> Self {
        Self {
            http,
            base: config.api_base.trim_end_matches('/').to_owned(),
            token: config.token.clone(),
        }
    }

    /// Submits a request to `path` under the API base and decodes the JSON reply.
    ///
    /// A `429` reply is waited out once, for as long as the API asks.
    #[instrument(skip(self, body))]
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let mut retried = false;

        loop {
            let resp = self.send(method.clone(), path, body).await?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(resp).await;

                if retried {
                    return Err(Error::RateLimited(wait));
                }

                warn!("Rate limited on {} {}; retrying in {:?}.", method, path, wait);
                retried = true;
                sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let bytes = resp.bytes().await?;
            debug!("{} {} -> {} ({} bytes).", method, path, status, bytes.len());

            return Ok(serde_json::from_slice(&bytes)?);
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        let mut req = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, format!("Bot {}", self.token));

        if let Some(body) = body {
            req = req.json(body);
        }

        Ok(req.send().await?)
    }

    /// Looks up the gateway URL and recommended shard count.
    pub async fn gateway_bot(&self) -> Result<GatewayBot> {
        self.request(Method::GET, "/gateway/bot", None).await
    }
}

/// Reads how long a `429` asks us to wait, preferring the JSON body's
/// fractional `retry_after` over the whole-second header.
async fn retry_after(resp: Response) -> Duration {
    let header = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok());

    let body = resp
        .json::<Value>()
        .await
        .ok()
        .and_then(|v| v.get("retry_after").and_then(Value::as_f64));

    body.or(header)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map_or(Duration::from_secs(1), Duration::from_secs_f64)
}

/// Errors raised by a [`RestClient`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The request could not be sent, or its reply could not be read.
    Http(reqwest::Error),
    /// The reply was not the JSON the caller asked for.
    Json(serde_json::Error),
    /// The API was still rate limiting after one retry.
    RateLimited(Duration),
    /// The API answered with a non-success status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Reply body, usually a JSON error object.
        body: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP request failed: {}", e),
            Error::Json(e) => write!(f, "unexpected reply: {}", e),
            Error::RateLimited(wait) => write!(f, "rate limited, retry in {:?}", wait),
            Error::Status { status, body } => write!(f, "API returned {}: {}", status, body),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::RateLimited(_) | Error::Status { .. } => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

/// Convenience type for REST handling.
pub type Result<T> = std::result::Result<T, Error>;
