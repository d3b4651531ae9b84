//! The outreach trigger: exactly one call per qualifying escalation.
//!
//! Claiming the call record happens inside the store's evaluation critical
//! section; the provider call itself runs after the lock is released, so a
//! slow or hung provider cannot stall the store's next evaluation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::alerts::TaskDispatcher;
use crate::error::EngineError;
use crate::escalation::{Escalation, EscalationStore, CALL_LEVEL};
use crate::fleet::{FleetStore, Organization, Store};

use super::store::CallStore;
use super::{AiCallRecord, CallOutcome, CallRequest, CallStatus, ScriptKind, ScriptVars, VoiceProvider};

pub struct OutreachTrigger {
    calls: Arc<CallStore>,
    escalations: Arc<EscalationStore>,
    tasks: Arc<TaskDispatcher>,
    fleet: Arc<FleetStore>,
    provider: Option<Arc<dyn VoiceProvider>>,
    retry_backoff: Duration,
}

impl OutreachTrigger {
    pub fn new(
        calls: Arc<CallStore>,
        escalations: Arc<EscalationStore>,
        tasks: Arc<TaskDispatcher>,
        fleet: Arc<FleetStore>,
        provider: Option<Arc<dyn VoiceProvider>>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            calls,
            escalations,
            tasks,
            fleet,
            provider,
            retry_backoff,
        }
    }

    pub fn calls(&self) -> &Arc<CallStore> {
        &self.calls
    }

    /// Claim the outreach slot for an escalation. Safe to call inside the
    /// store's critical section: it renders and writes, but never touches
    /// the network. Returns None if the escalation already has a claim.
    pub async fn claim(
        &self,
        store: &Store,
        org: &Organization,
        escalation: &Escalation,
        script: ScriptKind,
        vars: &ScriptVars,
    ) -> anyhow::Result<Option<AiCallRecord>> {
        let recipient_name = store
            .manager_name
            .clone()
            .or_else(|| org.ops_manager_name.clone())
            .unwrap_or_else(|| "Store Manager".to_string());
        let recipient_phone = store
            .manager_phone
            .clone()
            .or_else(|| org.ops_manager_phone.clone())
            .unwrap_or_default();

        let script_text = script.render(vars);

        match self
            .calls
            .claim(
                store.id,
                escalation.alert_id,
                escalation.id,
                script,
                &recipient_name,
                &recipient_phone,
                &script_text,
                1,
            )
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(e) => match e.downcast_ref::<EngineError>() {
                // Already handled: a prior pass (or a concurrent one) owns
                // the slot for this escalation.
                Some(EngineError::DuplicateWrite(_)) => {
                    info!(
                        escalation_id = escalation.id,
                        "Outreach already claimed for escalation; skipping"
                    );
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    /// Place the claimed call. Runs outside the per-store lock.
    ///
    /// Transient provider failure earns exactly one retry with backoff; the
    /// retry re-checks the store's current level first and aborts if the
    /// escalation no longer warrants a call. An exhausted retry records
    /// `failed` and surfaces a follow-up task; the level is never advanced
    /// because a call could not connect.
    pub async fn dispatch(
        &self,
        record: AiCallRecord,
        store: &Store,
        escalation: &Escalation,
    ) -> anyhow::Result<()> {
        let Some(provider) = &self.provider else {
            warn!(
                store = %store.store_code,
                escalation_id = escalation.id,
                "No voice provider configured; call logged but not initiated"
            );
            return Ok(());
        };

        if record.recipient_phone.is_empty() {
            warn!(
                store = %store.store_code,
                escalation_id = escalation.id,
                "No phone number for outreach recipient"
            );
            self.calls.mark_failed(record.id).await?;
            self.tasks
                .create_call_follow_up(store, escalation, "failed")
                .await?;
            return Ok(());
        }

        let request = CallRequest {
            store_id: store.id,
            escalation_id: escalation.id,
            recipient_name: record.recipient_name.clone(),
            recipient_phone: record.recipient_phone.clone(),
            script_text: record.script_text.clone(),
        };

        match provider.initiate_call(&request).await {
            Ok(handle) => {
                self.calls
                    .mark_initiated(record.id, &handle.external_call_id)
                    .await?;
                info!(
                    store = %store.store_code,
                    escalation_id = escalation.id,
                    external_call_id = %handle.external_call_id,
                    "Outreach call initiated"
                );
                return Ok(());
            }
            Err(e) => {
                warn!(
                    store = %store.store_code,
                    escalation_id = escalation.id,
                    "Outreach call failed, will retry once: {e}"
                );
                self.calls.mark_failed(record.id).await?;
            }
        }

        tokio::time::sleep(self.retry_backoff).await;

        // The store may have resolved while we were backing off.
        let level = self.escalations.current_level(store.id).await?;
        if level < CALL_LEVEL {
            info!(
                store = %store.store_code,
                escalation_id = escalation.id,
                level,
                "Store recovered below call level; retry cancelled"
            );
            return Ok(());
        }

        let retry = match self
            .calls
            .claim(
                store.id,
                escalation.alert_id,
                escalation.id,
                record.call_type,
                &record.recipient_name,
                &record.recipient_phone,
                &record.script_text,
                record.attempt + 1,
            )
            .await
        {
            Ok(retry) => retry,
            Err(e) => {
                // Another path already owns the slot.
                if matches!(
                    e.downcast_ref::<EngineError>(),
                    Some(EngineError::DuplicateWrite(_))
                ) {
                    return Ok(());
                }
                return Err(e);
            }
        };

        match provider.initiate_call(&request).await {
            Ok(handle) => {
                self.calls
                    .mark_initiated(retry.id, &handle.external_call_id)
                    .await?;
                info!(
                    store = %store.store_code,
                    escalation_id = escalation.id,
                    attempt = retry.attempt,
                    "Outreach call initiated on retry"
                );
            }
            Err(e) => {
                warn!(
                    store = %store.store_code,
                    escalation_id = escalation.id,
                    "Outreach retry exhausted: {e}"
                );
                self.calls.mark_failed(retry.id).await?;
                self.tasks
                    .create_call_follow_up(store, escalation, "failed")
                    .await?;
            }
        }

        Ok(())
    }

    /// Apply the provider's final result (callback/poll contract).
    ///
    /// `no_answer` and `failed` end with a human follow-up task; neither
    /// ever moves the escalation level.
    pub async fn record_outcome(&self, call_id: i64, outcome: &CallOutcome) -> anyhow::Result<()> {
        self.calls.record_outcome(call_id, outcome).await?;

        let record = self
            .calls
            .get(call_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("call record {} not found", call_id))?;

        info!(
            call_id,
            status = outcome.status.as_str(),
            response = ?outcome.response,
            "Call outcome recorded"
        );

        if matches!(outcome.status, CallStatus::Failed | CallStatus::NoAnswer) {
            let escalation = self
                .escalations
                .get_escalation(record.escalation_id)
                .await?
                .ok_or_else(|| {
                    anyhow::anyhow!("escalation {} not found for call", record.escalation_id)
                })?;
            let store = self
                .fleet
                .get_store(record.store_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("store {} not found for call", record.store_id))?;

            self.tasks
                .create_call_follow_up(&store, &escalation, outcome.status.as_str())
                .await?;
        }

        Ok(())
    }
}
