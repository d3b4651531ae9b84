//! The voice-provider seam.
//!
//! The engine only ever talks to `VoiceProvider`; telephony signaling and
//! voice synthesis live on the other side of it.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::OutreachConfig;
use crate::error::EngineError;

use super::{CallHandle, CallRequest, CallStatus};

#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Place one call. Returns the provider's handle for it; the final
    /// outcome arrives later through the callback/poll contract.
    async fn initiate_call(&self, request: &CallRequest) -> anyhow::Result<CallHandle>;
}

/// ElevenLabs conversational-agent provider: one JSON POST per call.
pub struct HttpVoiceProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    agent_id: String,
    agent_phone_number_id: String,
}

impl HttpVoiceProvider {
    pub fn new(config: &OutreachConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.call_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            agent_id: config.agent_id.clone(),
            agent_phone_number_id: config.agent_phone_number_id.clone(),
        })
    }
}

#[async_trait]
impl VoiceProvider for HttpVoiceProvider {
    async fn initiate_call(&self, request: &CallRequest) -> anyhow::Result<CallHandle> {
        let url = format!("{}/v1/convai/twilio/outbound-call", self.base_url);
        let body = json!({
            "agent_id": self.agent_id,
            "agent_phone_number_id": self.agent_phone_number_id,
            "to_number": request.recipient_phone,
            "conversation_initiation_client_data": {
                "dynamic_variables": {
                    "script_text": request.script_text,
                    "recipient_name": request.recipient_name,
                }
            },
        });

        info!(
            store_id = request.store_id,
            escalation_id = request.escalation_id,
            "Initiating outreach call"
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ExternalCapability(format!("call provider unreachable: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();

        if !status.is_success() {
            let detail = payload
                .pointer("/detail/message")
                .or_else(|| payload.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("no detail");
            warn!(%status, detail, "Call provider rejected request");
            return Err(EngineError::ExternalCapability(format!(
                "call provider returned {status}: {detail}"
            ))
            .into());
        }

        let external_call_id = payload
            .get("conversation_id")
            .or_else(|| payload.get("call_id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(CallHandle {
            external_call_id,
            initial_status: CallStatus::InProgress,
        })
    }
}
