use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::time::Instant;

use crate::config::DispatcherConfig;
use crate::error::FailureReason;

/// Maximum number of characters of a response body kept on the record.
pub const BODY_SNIPPET_LIMIT: usize = 1000;

// Enough bytes to hold BODY_SNIPPET_LIMIT characters of any UTF-8 text.
const SNIPPET_BYTE_BUDGET: usize = BODY_SNIPPET_LIMIT * 4;

/// One outbound POST.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,

    /// Serialized envelope. Sent as-is; any signature covers these bytes.
    pub body: Vec<u8>,

    /// `(header name, hex signature)`, absent when signing is disabled.
    pub signature: Option<(String, String)>,
}

/// Normalized result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// True iff the endpoint answered with a 2xx status.
    pub ok: bool,

    /// HTTP status, or 0 when no response was received.
    pub status_code: u16,

    /// At most `BODY_SNIPPET_LIMIT` characters of the response body.
    pub body_snippet: String,

    pub error: Option<FailureReason>,
    pub latency: Duration,
}

impl AttemptOutcome {
    pub fn from_response(status_code: u16, body: &str, latency: Duration) -> Self {
        let ok = (200..300).contains(&status_code);
        Self {
            ok,
            status_code,
            body_snippet: truncate_chars(body, BODY_SNIPPET_LIMIT),
            error: if ok {
                None
            } else {
                Some(FailureReason::Http { status: status_code })
            },
            latency,
        }
    }

    /// The request never produced a response.
    pub fn transport_failure(reason: FailureReason, latency: Duration) -> Self {
        Self {
            ok: false,
            status_code: 0,
            body_snippet: String::new(),
            error: Some(reason),
            latency,
        }
    }
}

/// Performs exactly one delivery attempt. Implementations never retry.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> AttemptOutcome;
}

/// HTTP delivery over a shared `reqwest` client.
///
/// Redirects are not followed: a 3xx is a failed attempt, and the signed
/// body never reaches a host other than `target_url`.
///
/// Built once and handed to the dispatcher; the connection pool is reused
/// across runs.
#[derive(Debug, Clone)]
pub struct HttpDeliveryClient {
    client: reqwest::Client,
}

impl HttpDeliveryClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &DispatcherConfig) -> Result<Self, reqwest::Error> {
        Self::new(config.request_timeout, &config.user_agent)
    }
}

#[async_trait]
impl Deliver for HttpDeliveryClient {
    async fn deliver(&self, request: &DeliveryRequest) -> AttemptOutcome {
        let started = Instant::now();

        let mut builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());

        if let Some((name, value)) = &request.signature {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = read_snippet(response).await;
                AttemptOutcome::from_response(status, &body, started.elapsed())
            }
            Err(err) => {
                let reason = if err.is_timeout() {
                    FailureReason::Timeout
                } else {
                    FailureReason::Network(err.to_string())
                };
                AttemptOutcome::transport_failure(reason, started.elapsed())
            }
        }
    }
}

// Reads only as much of the body as the snippet can hold. A failure while
// reading keeps whatever arrived; the status code already decided the outcome.
async fn read_snippet(mut response: reqwest::Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < SNIPPET_BYTE_BUDGET {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    truncate_chars(&String::from_utf8_lossy(&buf), BODY_SNIPPET_LIMIT)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
