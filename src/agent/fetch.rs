//! Upstream execution with bounded retries.

use reqwest::{Client, Method};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::RetryConfig;
use crate::policy::headers::sanitize_agent_headers;
use crate::protocol::{QueryValue, RequestSpec};

/// Longest upstream error body carried into an error frame.
const ERROR_EXCERPT_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request was aborted, normally because the control channel
    /// dropped.
    #[error("request aborted")]
    Aborted,

    /// The spec cannot be turned into an upstream request.
    #[error("invalid request: {0}")]
    Spec(String),

    /// Every attempt failed; `status` is the last one observed, or 0 when
    /// no attempt produced a response.
    #[error("upstream failed after {attempts} attempts: {message}")]
    Upstream {
        attempts: u32,
        status: u16,
        message: String,
    },
}

impl FetchError {
    /// Status carried in the error frame toward the server plane.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::Upstream { status, .. } if *status >= 100 => *status,
            _ => 500,
        }
    }
}

/// Executes request specs against the fixed upstream host.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl Fetcher {
    pub fn new(base_url: String, retry: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            base_url,
            retry,
        }
    }

    /// Run the request until a 2xx response or the attempt budget is
    /// spent.
    ///
    /// A 2xx response returns immediately and is never retried, even if
    /// its body later fails mid-stream. Cancellation wins over both the
    /// in-flight attempt and the inter-attempt delay.
    pub async fn fetch(
        &self,
        spec: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        let method = parse_method(&spec.method)?;
        let url = self.build_url(spec)?;
        let headers = sanitize_agent_headers(&spec.headers);
        let send_body = [Method::POST, Method::PUT, Method::PATCH].contains(&method);

        let mut last_status = 0u16;
        let mut last_failure = String::new();
        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Aborted);
            }

            let mut builder = self.client.request(method.clone(), url.clone());
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if send_body {
                if let Some(body) = &spec.body {
                    builder = builder.body(body.clone());
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                outcome = builder.send() => outcome,
            };
            match outcome {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        request_id = %spec.request_id,
                        attempt,
                        status = response.status().as_u16(),
                        "upstream accepted"
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    last_status = response.status().as_u16();
                    let excerpt: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(ERROR_EXCERPT_CHARS)
                        .collect();
                    last_failure = format!("status {last_status}: {excerpt}");
                    warn!(
                        request_id = %spec.request_id,
                        attempt,
                        status = last_status,
                        "upstream rejected attempt"
                    );
                }
                Err(e) => {
                    last_status = 0;
                    last_failure = e.to_string();
                    warn!(request_id = %spec.request_id, attempt, error = %e, "upstream attempt failed");
                }
            }

            if attempt < self.retry.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Aborted),
                    _ = tokio::time::sleep(self.retry.delay) => {}
                }
            }
        }

        Err(FetchError::Upstream {
            attempts: self.retry.max_attempts,
            status: last_status,
            message: last_failure,
        })
    }

    fn build_url(&self, spec: &RequestSpec) -> Result<Url, FetchError> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            spec.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined)
            .map_err(|e| FetchError::Spec(format!("bad url '{joined}': {e}")))?;
        if !spec.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &spec.query_params {
                match value {
                    QueryValue::Single(v) => {
                        pairs.append_pair(key, v);
                    }
                    QueryValue::Multi(values) => {
                        for v in values {
                            pairs.append_pair(key, v);
                        }
                    }
                }
            }
        }
        Ok(url)
    }
}

fn parse_method(verb: &str) -> Result<Method, FetchError> {
    match verb.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        other => Err(FetchError::Spec(format!("unsupported method: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(path: &str, query: &[(&str, QueryValue)]) -> RequestSpec {
        RequestSpec {
            request_id: "1-1".to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            query_params: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(
            "https://example.com".to_string(),
            RetryConfig::default(),
        )
    }

    #[test]
    fn test_build_url_joins_path_variants() {
        let f = fetcher();
        let with_slash = f.build_url(&spec("/v1beta/models", &[])).unwrap();
        let without = f.build_url(&spec("v1beta/models", &[])).unwrap();
        assert_eq!(with_slash.as_str(), "https://example.com/v1beta/models");
        assert_eq!(with_slash, without);
    }

    #[test]
    fn test_build_url_keeps_model_action_segment() {
        let f = fetcher();
        let url = f
            .build_url(&spec("/v1beta/models/gemini-pro:streamGenerateContent", &[]))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/v1beta/models/gemini-pro:streamGenerateContent"
        );
    }

    #[test]
    fn test_build_url_appends_query_values() {
        let f = fetcher();
        let url = f
            .build_url(&spec(
                "/m",
                &[
                    ("alt", QueryValue::Single("sse".to_string())),
                    (
                        "f",
                        QueryValue::Multi(vec!["a".to_string(), "b".to_string()]),
                    ),
                ],
            ))
            .unwrap();
        assert_eq!(url.query(), Some("alt=sse&f=a&f=b"));
    }

    #[test]
    fn test_parse_method_rejects_unknown_verbs() {
        assert!(parse_method("get").is_ok());
        assert!(parse_method("TRACE").is_err());
        assert!(parse_method("").is_err());
    }

    #[test]
    fn test_error_status_fallback() {
        let aborted = FetchError::Aborted;
        assert_eq!(aborted.status(), 500);

        let transport = FetchError::Upstream {
            attempts: 15,
            status: 0,
            message: "connection refused".to_string(),
        };
        assert_eq!(transport.status(), 500);

        let rejected = FetchError::Upstream {
            attempts: 15,
            status: 429,
            message: "quota".to_string(),
        };
        assert_eq!(rejected.status(), 429);
    }
}
