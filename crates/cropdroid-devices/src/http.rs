//! HTTP device client.
//!
//! `GET /state`, `POST /switch?ch=&state=`, `POST /timer?ch=&seconds=`.
//! Transport errors and non-2xx answers are `DeviceUnreachable`; bodies that
//! don't match the contract are `DeviceProtocol`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::traits::DeviceClient;
use cropdroid_core::types::{DeviceSnapshot, StateReport, SwitchReport, TimerReport};
use serde::de::DeserializeOwned;

pub struct HttpDeviceClient {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new(name: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CropDroidError::Http(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CropDroidError::unreachable(
                &self.name,
                format!("HTTP {status}: {body}"),
            ));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| CropDroidError::unreachable(&self.name, e))?;
        serde_json::from_str(&text).map_err(|e| CropDroidError::protocol(&self.name, e))
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<DeviceSnapshot> {
        let resp = self
            .client
            .get(format!("{}/state", self.base_url))
            .send()
            .await
            .map_err(|e| CropDroidError::unreachable(&self.name, e))?;
        let report: StateReport = self.read(resp).await?;
        if let Some(bad) = report.channels.iter().find(|&&c| c != 0 && c != 1) {
            return Err(CropDroidError::protocol(
                &self.name,
                format!("channel state {bad} is not 0 or 1"),
            ));
        }
        Ok(DeviceSnapshot::new(report.metrics, report.channels, Utc::now()))
    }

    async fn switch(&self, channel: usize, state: i32) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/switch", self.base_url))
            .query(&[("ch", channel.to_string()), ("state", state.to_string())])
            .send()
            .await
            .map_err(|e| CropDroidError::unreachable(&self.name, e))?;
        let report: SwitchReport = self.read(resp).await?;
        if report.ch != channel || report.state != state {
            return Err(CropDroidError::protocol(
                &self.name,
                format!(
                    "switch echoed ch={} state={}, expected ch={channel} state={state}",
                    report.ch, report.state
                ),
            ));
        }
        tracing::debug!("🔌 {} ch{channel} → {state}", self.name);
        Ok(())
    }

    async fn timer_switch(&self, channel: usize, seconds: u64) -> Result<DateTime<Utc>> {
        let resp = self
            .client
            .post(format!("{}/timer", self.base_url))
            .query(&[("ch", channel.to_string()), ("seconds", seconds.to_string())])
            .send()
            .await
            .map_err(|e| CropDroidError::unreachable(&self.name, e))?;
        let report: TimerReport = self.read(resp).await?;
        if report.ch != channel {
            return Err(CropDroidError::protocol(
                &self.name,
                format!("timer echoed ch={}, expected {channel}", report.ch),
            ));
        }
        DateTime::from_timestamp(report.until, 0).ok_or_else(|| {
            CropDroidError::protocol(&self.name, format!("bad timer deadline {}", report.until))
        })
    }
}
