//! HTTP plumbing shared by the explorer and price source clients.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Applied to every upstream request unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Response bodies are cut to this many characters in error messages.
const BODY_SNIPPET_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{service} request timed out")]
    Timeout { service: &'static str },
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} responded with status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} returned an unexpected response: {reason}")]
    Malformed {
        service: &'static str,
        reason: String,
    },
}

impl UpstreamError {
    pub fn malformed(service: &'static str, reason: impl Into<String>) -> Self {
        UpstreamError::Malformed {
            service,
            reason: reason.into(),
        }
    }

    fn from_reqwest(service: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            UpstreamError::Timeout { service }
        } else {
            UpstreamError::Http { service, source }
        }
    }
}

pub fn build_client(timeout: Duration) -> Result<Client, UpstreamError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|source| UpstreamError::Http {
            service: "http client",
            source,
        })
}

/// GETs `url` and decodes a JSON body. Non-2xx statuses are errors.
pub async fn get_json<T>(client: &Client, service: &'static str, url: &str) -> Result<T, UpstreamError>
where
    T: DeserializeOwned,
{
    tracing::debug!(service, url, "upstream request");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| UpstreamError::from_reqwest(service, err))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| UpstreamError::from_reqwest(service, err))?;

    if !status.is_success() {
        return Err(UpstreamError::Status {
            service,
            status: status.as_u16(),
            body: snippet(&body),
        });
    }

    serde_json::from_str(&body).map_err(|err| {
        tracing::warn!(service, error = %err, body = %snippet(&body), "failed to decode response");
        UpstreamError::malformed(service, err.to_string())
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_LEN).collect()
}
