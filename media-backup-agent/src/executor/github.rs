//! Manifest stored as a file in a GitHub repository (contents API).
//!
//! The blob `sha` is the version token; a PUT carrying a stale `sha` is
//! answered with 409 or 422.

use super::history::{ManifestRemote, PublishOutcome, VersionedManifest};
use super::manifest;
use crate::config::ManifestConfig;
use crate::{AgentError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContent,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

#[derive(Debug, Clone)]
pub struct GitHubManifestRemote {
    client: Client,
    contents_url: String,
    branch: String,
    token: String,
}

impl GitHubManifestRemote {
    pub fn new(config: &ManifestConfig, token: &str) -> Result<Self> {
        let owner = config
            .owner
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| AgentError::Config("manifest owner is not set".to_string()))?;
        if token.trim().is_empty() {
            return Err(AgentError::Config("manifest token is not set".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("media-backup-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            contents_url: format!(
                "{}/repos/{}/{}/contents/{}",
                config.api_base.trim_end_matches('/'),
                owner,
                config.repo,
                config.path
            ),
            branch: config.branch.clone(),
            token: token.trim().to_string(),
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
    }
}

#[async_trait]
impl ManifestRemote for GitHubManifestRemote {
    async fn fetch(&self) -> Result<Option<VersionedManifest>> {
        let resp = self
            .authorized(self.client.get(&self.contents_url))
            .query(&[("ref", self.branch.as_str())])
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!("No manifest published yet");
                Ok(None)
            }
            status if status.is_success() => {
                let body = resp.bytes().await?;
                decode_contents(&body).map(Some)
            }
            status => Err(AgentError::Manifest(format!(
                "fetching manifest failed with status {}",
                status
            ))),
        }
    }

    async fn publish(
        &self,
        content: &str,
        expected_version: Option<&str>,
    ) -> Result<PublishOutcome> {
        let message = match expected_version {
            Some(_) => format!("Update backup history - {}", Utc::now().to_rfc3339()),
            None => format!("Create backup history - {}", Utc::now().to_rfc3339()),
        };

        let mut body = serde_json::json!({
            "message": message,
            "content": STANDARD.encode(content.as_bytes()),
            "branch": self.branch,
        });
        if let Some(sha) = expected_version {
            body["sha"] = serde_json::Value::String(sha.to_string());
        }

        let resp = self
            .authorized(self.client.put(&self.contents_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let outcome = classify_publish(status.as_u16(), &text)?;
        if let PublishOutcome::Published { version } = &outcome {
            info!("Manifest committed as {}", version);
        }
        Ok(outcome)
    }
}

/// Decode a contents API GET body into entries plus the blob sha.
pub fn decode_contents(body: &[u8]) -> Result<VersionedManifest> {
    let resp: ContentsResponse = serde_json::from_slice(body)?;

    // The API wraps base64 at 60 columns.
    let compact: String = resp
        .content
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let raw = STANDARD
        .decode(compact)
        .map_err(|e| AgentError::Manifest(format!("manifest is not valid base64: {}", e)))?;

    let entries = if raw.iter().all(|b| b.is_ascii_whitespace()) {
        Vec::new()
    } else {
        manifest::parse(&raw)?
    };

    Ok(VersionedManifest {
        entries,
        version: resp.sha,
    })
}

pub fn classify_publish(status: u16, body: &str) -> Result<PublishOutcome> {
    match status {
        200 | 201 => {
            let resp: PutResponse = serde_json::from_str(body)?;
            Ok(PublishOutcome::Published {
                version: resp.content.sha,
            })
        }
        409 | 422 => Ok(PublishOutcome::Conflict),
        _ => Err(AgentError::Manifest(format!(
            "publishing manifest failed with status {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        ))),
    }
}
