//! HTTP sink posting batches to a REST endpoint.
//!
//! One POST per batch. Any 2xx (200, 201, 204, ...) is an acknowledgment;
//! every other status, connection failure or timeout is a failure. There is no
//! retry inside a delivery: the batch stays unsent and the publisher's next
//! cycle retries it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use tracing::debug;

use super::{PayloadMode, Sink, SinkError};
use crate::config::{AuthMode, HttpSinkConfig};
use crate::reading::Reading;

/// Longest response body kept in a rejection reason.
const MAX_REASON_LEN: usize = 512;

/// Sink that POSTs each batch as a JSON array.
pub struct HttpSink {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Endpoint receiving the batches
    url: String,

    /// Pre-built authentication header, if any
    auth_header: Option<(HeaderName, HeaderValue)>,

    /// Wire shape of each reading
    payload: PayloadMode,

    /// Request timeout duration
    timeout: Duration,
}

impl HttpSink {
    /// Create a sink from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Config` if the client cannot be built or the auth
    /// header is not a valid HTTP header.
    pub fn new(config: &HttpSinkConfig, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SinkError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            auth_header: auth_header(&config.auth)?,
            payload: config.payload,
            timeout,
        })
    }

    /// Get the configured endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Translate an auth mode into a header pair.
fn auth_header(auth: &AuthMode) -> Result<Option<(HeaderName, HeaderValue)>, SinkError> {
    let (name, value) = match auth {
        AuthMode::None => return Ok(None),
        AuthMode::Bearer { key } => (AUTHORIZATION, format!("Bearer {}", key)),
        AuthMode::XApiKey { key } => (HeaderName::from_static("x-api-key"), key.clone()),
        AuthMode::Header { name, key } => {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SinkError::Config(format!("invalid header name '{}': {}", name, e)))?;
            (name, key.clone())
        }
    };

    let mut value = HeaderValue::from_str(&value)
        .map_err(|e| SinkError::Config(format!("invalid auth header value: {}", e)))?;
    value.set_sensitive(true);

    Ok(Some((name, value)))
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, batch: &[Reading]) -> Result<(), SinkError> {
        let body = self.payload.encode_batch(batch)?;

        debug!(
            batch_size = batch.len(),
            bytes = body.len(),
            url = %self.url,
            "Posting batch"
        );

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        if let Some((name, value)) = &self.auth_header {
            request = request.header(name.clone(), value.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout(self.timeout)
            } else {
                SinkError::Unreachable(e.to_string())
            }
        })?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let reason = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(SinkError::Rejected {
                status: Some(status.as_u16()),
                reason: truncate(reason),
            })
        }
    }
}
