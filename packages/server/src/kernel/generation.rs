//! Generation API client.
//!
//! Thin collaborator: it turns a topic into a draft and reports failures
//! as [`RawFailure`] descriptors (HTTP status, vendor error code,
//! Retry-After) for the classifier. Nothing here retries or sleeps; the
//! pipeline owns that.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resilience::RawFailure;

/// A generated draft plus the token usage the rate limiter settles against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub body: String,
    pub model: String,
    pub tokens_used: i64,
}

/// Rough pre-call token estimate used to reserve rate-limit capacity.
/// The reservation is settled against actual usage after the call.
pub fn estimate_tokens(topic: &str, content_type: &str) -> i64 {
    let prompt = topic.len() as i64 / 4;
    let output = match content_type {
        "summary" => 400,
        "article" => 1_200,
        "newsletter" => 2_000,
        _ => 800,
    };
    prompt + output
}

#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Generate a draft for a topic. Failures come back as raw
    /// descriptors, not classified errors.
    async fn generate(
        &self,
        topic: &str,
        content_type: &str,
    ) -> std::result::Result<GeneratedContent, RawFailure>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    topic: &'a str,
    content_type: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    content: String,
    model: String,
    #[serde(default)]
    tokens_used: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpGenerationApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpGenerationApi {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl GenerationApi for HttpGenerationApi {
    async fn generate(
        &self,
        topic: &str,
        content_type: &str,
    ) -> std::result::Result<GeneratedContent, RawFailure> {
        let request = GenerateRequest {
            topic,
            content_type,
            model: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/v1/generate", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport_failure)?;

        if !response.status().is_success() {
            return Err(api_failure(response).await);
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RawFailure::new(None, format!("malformed generation response: {e}")))?;

        Ok(GeneratedContent {
            body: body.content,
            model: body.model,
            tokens_used: body.tokens_used,
        })
    }
}

/// Map a transport-level reqwest error onto a raw failure with no status.
pub(crate) fn transport_failure(e: reqwest::Error) -> RawFailure {
    if e.is_timeout() {
        RawFailure::new(None, format!("request timed out: {e}"))
    } else {
        RawFailure::new(None, e.to_string())
    }
}

/// Map an error-status response onto a raw failure, pulling the vendor
/// error code from the body and the Retry-After header when present.
pub(crate) async fn api_failure(response: reqwest::Response) -> RawFailure {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or_default();

    let mut failure = RawFailure::new(
        Some(status),
        detail.message.unwrap_or_else(|| {
            if body.is_empty() {
                format!("upstream returned status {status}")
            } else {
                body
            }
        }),
    );
    if let Some(code) = detail.code {
        failure = failure.with_code(code);
    }
    if let Some(delay) = retry_after {
        failure = failure.with_retry_after(delay);
    }
    failure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_content_type() {
        let topic = "quarterly infrastructure report";
        assert!(estimate_tokens(topic, "summary") < estimate_tokens(topic, "article"));
        assert!(estimate_tokens(topic, "article") < estimate_tokens(topic, "newsletter"));
    }

    #[test]
    fn unknown_content_types_still_estimate() {
        assert!(estimate_tokens("anything", "podcast_script") > 0);
    }
}
