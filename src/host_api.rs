// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! HTTP access to the host's liveness and introspection endpoints.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::config::HarnessConfig;
use crate::sysconfig::sysconfig;

/// Error types for host HTTP requests.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Status code {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait HostApi: Send + Sync {
    /// One liveness probe. `Ok` iff the host answered `200`.
    async fn queue(&self) -> Result<(), ApiError>;

    /// Fetches the capability snapshot as returned by the host.
    async fn object_info(&self) -> Result<serde_json::Value, ApiError>;
}

/// [`HostApi`] backed by a ComfyUI server reachable over HTTP.
#[derive(Debug, Clone)]
pub struct ComfyApi {
    client: reqwest::Client,
    liveness_url: String,
    object_info_url: String,
    probe_timeout: Duration,
    capability_timeout: Duration,
}

impl ComfyApi {
    pub fn new(config: &HarnessConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(sysconfig().user_agent())
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            liveness_url: config.liveness_url(),
            object_info_url: config.object_info_url(),
            probe_timeout: config.poll_interval,
            capability_timeout: config.capability_timeout,
        })
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, ApiError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        debug!("GET {url} -> {status}");
        if status != reqwest::StatusCode::OK {
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl HostApi for ComfyApi {
    async fn queue(&self) -> Result<(), ApiError> {
        self.get(&self.liveness_url, self.probe_timeout).await?;
        Ok(())
    }

    async fn object_info(&self) -> Result<serde_json::Value, ApiError> {
        let response = self
            .get(&self.object_info_url, self.capability_timeout)
            .await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
