//! Publishing API client.
//!
//! Posts finished drafts to the CMS backend. Same error contract as the
//! generation client: raw failure descriptors for the classifier.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::generation::{api_failure, transport_failure, GeneratedContent};
use crate::resilience::RawFailure;

/// Reference to the published post, stored on the job on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedPost {
    pub reference: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[async_trait]
pub trait PublishingApi: Send + Sync {
    async fn publish(
        &self,
        title: &str,
        content: &GeneratedContent,
    ) -> std::result::Result<PublishedPost, RawFailure>;
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    title: &'a str,
    body: &'a str,
    status: &'a str,
}

pub struct HttpPublishingApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPublishingApi {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl PublishingApi for HttpPublishingApi {
    async fn publish(
        &self,
        title: &str,
        content: &GeneratedContent,
    ) -> std::result::Result<PublishedPost, RawFailure> {
        let request = PublishRequest {
            title,
            body: &content.body,
            status: "publish",
        };

        let response = self
            .client
            .post(format!("{}/wp-json/wp/v2/posts", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport_failure)?;

        if !response.status().is_success() {
            return Err(api_failure(response).await);
        }

        let post: PublishedPost = response
            .json()
            .await
            .map_err(|e| RawFailure::new(None, format!("malformed publish response: {e}")))?;
        Ok(post)
    }
}
