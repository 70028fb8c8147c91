//! HTTP client for downstream integration calls.
//!
//! Turns every call, including transport failures, into a
//! [`ProcessingOutcome`] and records it against the event through the
//! processing logger. A failure to log is reported next to the outcome and
//! never replaces it.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use eventide_core::{Error, EventId, ProcessingOutcome, Provenance, Result};
use eventide_store::{Config, LogReport, ProcessingLogger};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Response,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info_span, Instrument};
use uuid::Uuid;

const APPLICATION_JSON: &str = "application/json";

/// Configuration for the integration client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for calls that do not set their own.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(eventide_store::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Eventide-Integration/1.0".to_string(),
        }
    }
}

impl ClientConfig {
    /// Takes the call timeout from `API_CALL_TIMEOUT`.
    pub fn from_store_config(config: &Config) -> Self {
        Self { timeout: config.api_call_timeout(), ..Self::default() }
    }
}

/// HTTP method of an integration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`; body fields are sent as query parameters.
    Get,
    /// `POST` with a JSON body.
    Post,
    /// `PUT` with a JSON body.
    Put,
    /// `PATCH` with a JSON body.
    Patch,
    /// `DELETE`; no body is sent.
    Delete,
}

impl HttpMethod {
    /// Upper-case method name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    const fn sends_json_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(Error::validation(format!("Unsupported HTTP method: {s}"))),
        }
    }
}

/// One downstream call.
#[derive(Clone)]
pub struct IntegrationRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: String,
    /// JSON body; for `GET` its top-level fields become query parameters.
    pub body: Option<Value>,
    /// Extra headers; these override the defaults.
    pub headers: HashMap<String, String>,
    /// Token sent as `Authorization: Bearer ...`.
    pub bearer_token: Option<String>,
    /// Per-call timeout overriding the client default.
    pub timeout: Option<Duration>,
    /// Whether the outcome is recorded with the processing logger.
    pub log_outcome: bool,
}

impl fmt::Debug for IntegrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body", &self.body)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("log_outcome", &self.log_outcome)
            .finish()
    }
}

impl IntegrationRequest {
    /// Creates a bodiless request that will be logged.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: HashMap::new(),
            bearer_token: None,
            timeout: None,
            log_outcome: true,
        }
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Authenticates with a bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Overrides the client timeout for this call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skips the processing log for this call.
    #[must_use]
    pub fn without_logging(mut self) -> Self {
        self.log_outcome = false;
        self
    }

    fn provenance(&self) -> Provenance {
        Provenance {
            url: Some(self.url.clone()),
            method: Some(self.method.to_string()),
            payload: self.body.clone(),
        }
    }
}

/// Outcome of a call plus what happened when it was logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallReport {
    /// Result of the downstream call.
    #[serde(flatten)]
    pub outcome: ProcessingOutcome,
    /// Log row written for the outcome.
    #[serde(rename = "log_result", skip_serializing_if = "Option::is_none")]
    pub log: Option<LogReport>,
    /// Why logging failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_error: Option<String>,
}

/// HTTP client for downstream integration calls.
#[derive(Clone)]
pub struct IntegrationClient {
    client: reqwest::Client,
    config: ClientConfig,
    logger: Option<ProcessingLogger>,
}

impl fmt::Debug for IntegrationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationClient")
            .field("config", &self.config)
            .field("logs_outcomes", &self.logger.is_some())
            .finish_non_exhaustive()
    }
}

impl IntegrationClient {
    /// Creates a client that does not log outcomes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::validation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config, logger: None })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`IntegrationClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Records outcomes of calls for positive event ids with `logger`.
    #[must_use]
    pub fn with_logger(mut self, logger: ProcessingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Performs `request` for `event_id` and records the outcome.
    ///
    /// Never fails: transport errors become error outcomes and logging
    /// errors are reported in [`CallReport::log_error`]. Nothing is logged
    /// when the client has no logger, the request opts out, or `event_id`
    /// is not positive.
    pub async fn call(&self, event_id: EventId, request: IntegrationRequest) -> CallReport {
        let span = info_span!(
            "integration_call",
            event_id = %event_id,
            call_id = %Uuid::new_v4(),
            method = %request.method,
            url = %request.url
        );

        async move {
            let outcome = self.execute(&request).await;

            let mut report = CallReport { outcome, log: None, log_error: None };
            let Some(logger) = self.logger.as_ref() else {
                return report;
            };
            if !request.log_outcome || !event_id.is_valid() {
                return report;
            }

            match logger.log(event_id, &report.outcome, &request.provenance()).await {
                Ok(log) => {
                    tracing::info!(
                        action = %log.action,
                        log_id = %log.log_id(),
                        processed_status = %log.processed_status(),
                        "Event processing logged"
                    );
                    report.log = Some(log);
                },
                Err(e) => {
                    let message =
                        format!("Failed to log event processing for event_id {event_id}: {e}");
                    tracing::warn!("{message}");
                    report.log_error = Some(message);
                },
            }
            report
        }
        .instrument(span)
        .await
    }

    /// Performs `request` without logging.
    pub async fn execute(&self, request: &IntegrationRequest) -> ProcessingOutcome {
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let start_time = std::time::Instant::now();

        tracing::info!("Making {} request to {}", request.method, request.url);

        let headers = match build_headers(request) {
            Ok(headers) => headers,
            Err(e) => return ProcessingOutcome::failure(None, format!("Unexpected error: {e}")),
        };

        let mut http_request = self
            .client
            .request(request.method.to_reqwest(), &request.url)
            .headers(headers)
            .timeout(timeout);
        match (&request.body, request.method) {
            (Some(body), method) if method.sends_json_body() => {
                http_request = http_request.json(body);
            },
            (Some(body), HttpMethod::Get) => {
                http_request = http_request.query(&query_pairs(body));
            },
            _ => {},
        }

        let response = match http_request.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = request_failure(&request.url, timeout, &e);
                tracing::error!(duration_ms = start_time.elapsed().as_millis(), "{message}");
                return ProcessingOutcome::failure(None, message);
            },
        };

        let outcome = parse_response(&request.url, response).await;
        match outcome.status_code {
            Some(status) if outcome.is_success() => {
                tracing::info!(
                    status,
                    duration_ms = start_time.elapsed().as_millis(),
                    "API call successful"
                );
            },
            status => {
                tracing::warn!(
                    status,
                    duration_ms = start_time.elapsed().as_millis(),
                    "API call returned error status"
                );
            },
        }
        outcome
    }
}

/// Default headers, then the bearer token, then caller headers.
fn build_headers(request: &IntegrationRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
    if request.body.is_some() && request.method.sends_json_body() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    }

    if let Some(token) = &request.bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::validation(format!("invalid bearer token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }

    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::validation(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::validation(format!("invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Flattens the top-level fields of a GET body into query parameters.
///
/// Strings are sent as-is, arrays repeat the key once per element, and
/// anything else is sent as its JSON text. Non-object bodies yield nothing.
fn query_pairs(body: &Value) -> Vec<(String, String)> {
    let Some(fields) = body.as_object() else {
        tracing::warn!("Ignoring non-object GET body");
        return Vec::new();
    };

    let mut pairs = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        match value {
            Value::Null => {},
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (key.clone(), query_value(item))));
            },
            other => pairs.push((key.clone(), query_value(other))),
        }
    }
    pairs
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn request_failure(url: &str, timeout: Duration, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("Timeout connecting to {url} (timeout: {}s)", timeout.as_secs())
    } else if err.is_connect() {
        format!("Connection error to {url}: {err}")
    } else {
        format!("Unexpected error making API call to {url}: {err}")
    }
}

async fn parse_response(url: &str, response: Response) -> ProcessingOutcome {
    let status = response.status();
    let status_code = status.as_u16();
    let headers = extract_headers(response.headers());

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Failed to read response body: {}", e);
            return ProcessingOutcome::failure(
                Some(status_code),
                format!("Unexpected error making API call to {url}: {e}"),
            )
            .with_headers(headers);
        },
    };
    let data = serde_json::from_str::<Value>(&body).unwrap_or_else(|_| json!({ "text": body }));

    let outcome = if status.is_success() {
        ProcessingOutcome::success(status_code, Some(data))
    } else {
        let reason = status.canonical_reason().unwrap_or("Unknown");
        ProcessingOutcome::failure(Some(status_code), format!("HTTP {status_code}: {reason}"))
            .with_data(data)
    };
    outcome.with_headers(headers)
}

/// Extracts headers from a reqwest `HeaderMap`, skipping non-text values.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}
