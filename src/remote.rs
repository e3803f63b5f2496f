//! HTTP client for the remote inference service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfig;
use crate::request::{PayloadRef, Settings};
use crate::worker::executor::{InferenceInvoker, InvokeError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeBody<'a> {
    service_id: &'a str,
    payload_ref: &'a PayloadRef,
    settings: &'a Settings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeReply {
    payload_ref: PayloadRef,
}

/// Posts `{serviceId, payloadRef, settings}` to `{endpoint}/v1/invoke` and
/// expects `{payloadRef}` back.
#[derive(Debug, Clone)]
pub struct RemoteInvoker {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RemoteInvoker {
    pub fn new(config: &RemoteConfig) -> Result<Self, InvokeError> {
        let timeout = config.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InvokeError::Failed(format!("remote client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/v1/invoke", config.endpoint.trim_end_matches('/')),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl InferenceInvoker for RemoteInvoker {
    async fn invoke(
        &self,
        service_id: &str,
        payload: &PayloadRef,
        settings: &Settings,
    ) -> Result<PayloadRef, InvokeError> {
        tracing::debug!(service = service_id, url = %self.url, "Remote invocation");
        let body = InvokeBody {
            service_id,
            payload_ref: payload,
            settings,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout(self.timeout)
                } else {
                    InvokeError::Failed(format!("remote request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InvokeError::Failed(format!(
                "remote returned {}: {}",
                status,
                detail.trim()
            )));
        }

        let reply: InvokeReply = response
            .json()
            .await
            .map_err(|e| InvokeError::Failed(format!("invalid remote reply: {}", e)))?;
        Ok(reply.payload_ref)
    }
}
