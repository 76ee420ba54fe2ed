//! Render host client speaking JSON over HTTP.
//!
//! Talks to a render service exposing:
//!
//! | Call              | Request                                   | Reply                    |
//! |-------------------|-------------------------------------------|--------------------------|
//! | open              | `POST {base}/sessions`                    | any 2xx                  |
//! | fetch_asset       | `POST {base}/sessions/{id}/fetch`         | `{"size_bytes": n}`      |
//! | open_and_render   | `POST {base}/sessions/{id}/render`        | [`RenderReply`] JSON     |
//! | terminate         | `DELETE {base}/sessions/{id}`             | any 2xx                  |

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{RenderHost, RenderSession};
use crate::domain::outcome::RenderReply;
use crate::domain::reference::Reference;
use crate::domain::shard::SessionId;
use crate::error::{BroadsideError, Result};

/// Connection settings for [`HttpRenderHost`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRenderHostConfig {
    /// Base URL of the render service, without trailing slash
    pub base_url: String,
    /// Timeout for each individual call in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for HttpRenderHostConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9222".to_string(),
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Serialize)]
struct OpenRequest {
    session_id: uuid::Uuid,
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    reference: &'a str,
}

#[derive(Deserialize)]
struct FetchReply {
    size_bytes: u64,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_transparency: Option<bool>,
}

/// Production render host backed by reqwest.
#[derive(Clone)]
pub struct HttpRenderHost {
    client: reqwest::Client,
    config: HttpRenderHostConfig,
}

impl HttpRenderHost {
    pub fn new(config: HttpRenderHostConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }
}

/// Send a request and turn non-2xx replies into errors carrying the body.
async fn send(request: reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("render host returned {}: {}", status.as_u16(), body)
}

async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> anyhow::Result<T> {
    Ok(send(request).await?.json::<T>().await?)
}

#[async_trait]
impl RenderHost for HttpRenderHost {
    type Session = HttpRenderSession;

    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    async fn open(&self, session_id: SessionId) -> Result<HttpRenderSession> {
        let url = format!("{}/sessions", self.base_url());
        tracing::debug!(url = %url, "Opening render host session");

        send(
            self.client
                .post(&url)
                .timeout(Duration::from_millis(self.config.request_timeout_ms))
                .json(&OpenRequest {
                    session_id: session_id.0,
                }),
        )
        .await?;

        Ok(HttpRenderSession {
            client: self.client.clone(),
            session_url: format!("{}/sessions/{}", self.base_url(), session_id.0),
            timeout: Duration::from_millis(self.config.request_timeout_ms),
            session_id,
            terminated: AtomicBool::new(false),
        })
    }
}

/// Session handle on an [`HttpRenderHost`].
pub struct HttpRenderSession {
    client: reqwest::Client,
    session_url: String,
    timeout: Duration,
    session_id: SessionId,
    terminated: AtomicBool,
}

#[async_trait]
impl RenderSession for HttpRenderSession {
    #[tracing::instrument(
        skip(self, reference),
        fields(session_id = %self.session_id, reference = %reference)
    )]
    async fn fetch_asset(&self, reference: &Reference) -> Result<u64> {
        let request = self
            .client
            .post(format!("{}/fetch", self.session_url))
            .timeout(self.timeout)
            .json(&FetchRequest {
                reference: reference.as_str(),
            });

        let reply = send_json::<FetchReply>(request)
            .await
            .map_err(|e| BroadsideError::AssetFetch(e.to_string()))?;
        Ok(reply.size_bytes)
    }

    #[tracing::instrument(
        skip(self, reference),
        fields(session_id = %self.session_id, reference = %reference)
    )]
    async fn open_and_render(&self, reference: &Reference) -> Result<RenderReply> {
        let request = self
            .client
            .post(format!("{}/render", self.session_url))
            .timeout(self.timeout)
            .json(&RenderRequest {
                reference: reference.as_str(),
                expected_transparency: reference.hint.map(|h| h.expected_transparency),
            });

        send_json::<RenderReply>(request)
            .await
            .map_err(|e| BroadsideError::Render(e.to_string()))
    }

    async fn terminate(&self) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(session_id = %self.session_id, "Terminating render host session");
        send(self.client.delete(&self.session_url).timeout(self.timeout)).await?;
        Ok(())
    }
}
