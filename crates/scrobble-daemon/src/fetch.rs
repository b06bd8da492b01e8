/// Per-user fetch against the scrobbling service.
///
/// A fetch always settles into a `UserFetchResult`: connection failures,
/// timeouts, non-2xx statuses and unreadable bodies are all recorded on the
/// result.  The only `Err` is a request that cannot be built at all, which
/// the cycle aggregator folds into a failure result for that user.
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode, Url};
use scrobble_proto::config::ApiConfig;
use scrobble_proto::protocol::UserFetchResult;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub user: String,
    pub credential: String,
    pub limit: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid API base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<UserFetchResult, FetchError>;
}

pub struct LastFmFetcher {
    client: Client,
    base_url: String,
}

impl LastFmFetcher {
    pub fn new(api: &ApiConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder().user_agent(api.user_agent.clone());
        if let Some(timeout) = api.request_timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(Self::with_client(builder.build()?, api.base_url.clone()))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn request_url(&self, req: &FetchRequest) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| FetchError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("method", "user.getrecenttracks")
            .append_pair("api_key", &req.credential)
            .append_pair("user", &req.user)
            .append_pair("limit", &req.limit.to_string())
            .append_pair("extended", "1")
            .append_pair("format", "json");
        Ok(url)
    }
}

#[async_trait]
impl Fetcher for LastFmFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<UserFetchResult, FetchError> {
        let url = self.request_url(req)?;

        let response = match self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                // Strip the URL: it carries the API key.
                let e = e.without_url();
                let detail = if e.is_timeout() {
                    format!("request timed out: {}", e)
                } else {
                    format!("request failed: {}", e)
                };
                debug!("fetch {}: {}", req.user, detail);
                return Ok(UserFetchResult::failed(&req.user, detail));
            }
        };

        let status = response.status();
        let result = match response.text().await {
            Ok(body) => interpret_response(&req.user, status, &body),
            Err(e) => UserFetchResult {
                error_detail: Some(format!("failed to read body: {}", e.without_url())),
                ..status_only(&req.user, status)
            },
        };
        debug!(
            "fetch {}: status={} succeeded={}",
            req.user, status, result.succeeded
        );
        Ok(result)
    }
}

/// Turn a completed HTTP exchange into a result.
pub fn interpret_response(user: &str, status: StatusCode, body: &str) -> UserFetchResult {
    let parsed = parse_body(body);

    if status.is_success() {
        return match parsed {
            Ok(payload) => match service_error(&payload) {
                Some(detail) => UserFetchResult {
                    payload: Some(payload),
                    error_detail: Some(detail),
                    ..status_only(user, status)
                },
                None => UserFetchResult {
                    succeeded: true,
                    payload: Some(payload),
                    ..status_only(user, status)
                },
            },
            Err(detail) => UserFetchResult {
                error_detail: Some(detail),
                ..status_only(user, status)
            },
        };
    }

    let payload = parsed.ok();
    let detail = payload
        .as_ref()
        .and_then(service_error)
        .unwrap_or_else(|| format!("HTTP {}", status));
    UserFetchResult {
        payload,
        error_detail: Some(detail),
        ..status_only(user, status)
    }
}

fn status_only(user: &str, status: StatusCode) -> UserFetchResult {
    UserFetchResult {
        user: user.to_string(),
        succeeded: false,
        status_code: Some(status.as_u16()),
        status_text: status.canonical_reason().map(str::to_string),
        payload: None,
        error_detail: None,
    }
}

fn parse_body(body: &str) -> Result<Value, String> {
    if body.trim().is_empty() {
        return Err("empty response body".to_string());
    }
    serde_json::from_str(body).map_err(|e| format!("malformed JSON body: {}", e))
}

/// The service reports failures as `{"error": <code>, "message": "..."}`,
/// sometimes with a 2xx status.
fn service_error(payload: &Value) -> Option<String> {
    let code = payload.get("error")?;
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message");
    Some(format!("service error {}: {}", code, message))
}
