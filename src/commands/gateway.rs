//! Device Gateway Port
//! Mission: Abstract the device RPC wire format behind one async trait
//!
//! The production implementation speaks JSON over HTTP with a hard 10s
//! timeout; tests inject fakes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceInvokeStatus {
    /// Device confirmed synchronously.
    Acked,
    /// Device rejected the command.
    Failed,
    /// Accepted for asynchronous execution; the timeout sweep owns orphans.
    Sent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInvokeResult {
    pub status: DeviceInvokeStatus,
    pub error: Option<String>,
}

#[async_trait]
pub trait DeviceRpc: Send + Sync {
    async fn invoke(
        &self,
        tenant_id: &str,
        station_id: &str,
        device_id: &str,
        command_type: &str,
        payload: &serde_json::Value,
    ) -> Result<DeviceInvokeResult>;
}

#[derive(Debug, Serialize)]
struct InvokeBody<'a> {
    tenant_id: &'a str,
    station_id: &'a str,
    device_id: &'a str,
    command_type: &'a str,
    payload: &'a serde_json::Value,
}

pub struct HttpDeviceGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeviceGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build device gateway client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl DeviceRpc for HttpDeviceGateway {
    async fn invoke(
        &self,
        tenant_id: &str,
        station_id: &str,
        device_id: &str,
        command_type: &str,
        payload: &serde_json::Value,
    ) -> Result<DeviceInvokeResult> {
        let url = format!("{}/invoke", self.base_url.trim_end_matches('/'));
        debug!(device = device_id, command_type, "device rpc invoke");

        let response = self
            .client
            .post(&url)
            .json(&InvokeBody {
                tenant_id,
                station_id,
                device_id,
                command_type,
                payload,
            })
            .send()
            .await
            .context("device gateway unreachable")?;

        let response = response
            .error_for_status()
            .context("device gateway returned an error status")?;
        let result: DeviceInvokeResult = response
            .json()
            .await
            .context("device gateway returned malformed JSON")?;
        Ok(result)
    }
}
