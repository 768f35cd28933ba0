// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Bastion.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! HTTP device client
//!
//! [`DeviceApi`] implementation against the device's JSON management
//! endpoints. The engine core never names this type; it only sees the trait.

use crate::device::{
    ContentCheck, DeviceApi, JobHandle, JobResult, JobState, JobStatus, SoftwareCheck,
    VersionDescriptor, parse_progress,
};
use crate::error::{Result, UpgradeError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "bastion-upgrader/0.3";

#[derive(Debug, Clone)]
pub struct HttpDeviceClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SoftwareCheckWire {
    current: String,
    #[serde(default)]
    latest: Option<String>,
    #[serde(default)]
    versions: Vec<VersionDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ContentCheckWire {
    #[serde(default)]
    current: Option<String>,
    #[serde(default)]
    latest: Option<String>,
    #[serde(default)]
    downloaded: bool,
    #[serde(default)]
    needs_update: bool,
}

#[derive(Debug, Deserialize)]
struct JobWire {
    job: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusWire {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    #[serde(default)]
    msg: Option<String>,
}

impl HttpDeviceClient {
    pub fn new(base_url: &str, api_key: Option<String>, verify_tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            // Management planes ship self-signed certificates, so
            // verification is opt-in
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| UpgradeError::Device(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.request(method, url);
        if let Some(ref key) = self.api_key {
            req = req.header("X-API-Key", key);
        }
        req
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| UpgradeError::Device(format!("GET {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Device(format!(
                "GET {path} returned {status}: {}",
                error_message(response).await
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UpgradeError::Device(format!("GET {path}: malformed response: {e}")))
    }

    /// POST a job-submitting request; a rejection maps to `Submission`, not
    /// `Device`, because no job was created.
    async fn submit(&self, path: &str, body: serde_json::Value) -> Result<JobHandle> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpgradeError::Device(format!("POST {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Submission(format!(
                "POST {path} returned {status}: {}",
                error_message(response).await
            )));
        }

        let wire: JobWire = response
            .json()
            .await
            .map_err(|_| UpgradeError::Submission(format!("POST {path}: no job id in response")))?;

        debug!("submitted {path}, job id {}", wire.job);
        Ok(JobHandle { job_id: wire.job })
    }
}

async fn error_message(response: reqwest::Response) -> String {
    match response.json::<ErrorWire>().await {
        Ok(ErrorWire { msg: Some(msg) }) => msg,
        _ => "unknown error".into(),
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceClient {
    async fn check_versions(&self) -> Result<SoftwareCheck> {
        let wire: SoftwareCheckWire = self.get_json("/api/system/software").await?;
        Ok(SoftwareCheck {
            current: wire.current,
            latest: wire.latest,
            versions: wire.versions,
        })
    }

    async fn check_content(&self) -> Result<ContentCheck> {
        let wire: ContentCheckWire = self.get_json("/api/content/check").await?;
        Ok(ContentCheck {
            current: wire.current,
            latest: wire.latest,
            downloaded: wire.downloaded,
            needs_update: wire.needs_update,
        })
    }

    async fn download(&self, version: &str) -> Result<JobHandle> {
        self.submit(
            "/api/system/software/download",
            serde_json::json!({ "version": version }),
        )
        .await
    }

    async fn install(&self, version: &str) -> Result<JobHandle> {
        self.submit(
            "/api/system/software/install",
            serde_json::json!({ "version": version }),
        )
        .await
    }

    async fn download_content(&self) -> Result<JobHandle> {
        self.submit(
            "/api/content/download",
            serde_json::json!({ "version": "latest" }),
        )
        .await
    }

    async fn install_content(&self) -> Result<JobHandle> {
        self.submit(
            "/api/content/install",
            serde_json::json!({ "version": "latest" }),
        )
        .await
    }

    async fn request_reboot(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/api/system/reboot")
            .send()
            .await
            .map_err(|e| UpgradeError::Device(format!("reboot request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Submission(format!(
                "reboot rejected ({status}): {}",
                error_message(response).await
            )));
        }
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let wire: JobStatusWire = self.get_json(&format!("/api/jobs/{job_id}")).await?;
        let state = JobState::parse(&wire.status);
        Ok(JobStatus {
            job_id: wire.id,
            progress: parse_progress(&wire.progress, state),
            state,
            result: JobResult::parse(&wire.result),
            details: wire.details.filter(|d| !d.is_empty()),
        })
    }

    /// Single GET against the device's health endpoint. Any successful
    /// response counts; the endpoint never reaches out to update servers.
    async fn health_probe(&self) -> bool {
        match self.request(reqwest::Method::GET, "/api/health").send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
