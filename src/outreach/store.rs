//! Call record persistence.
//!
//! The partial unique index on (escalation_id) where status != 'failed' is
//! the exactly-once guarantee: claiming a call for an escalation that
//! already has a live or finished record fails cleanly, and the claimer
//! treats that as "already handled".

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::{is_unique_violation, EngineError};
use crate::kpi::store::parse_timestamp;

use super::{AiCallRecord, CallOutcome, CallResponse, CallStatus, ScriptKind};

pub struct CallStore {
    pool: SqlitePool,
}

impl CallStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claim the outreach slot for an escalation by inserting a `scheduled`
    /// row. A non-failed record already holding the slot (even from a
    /// concurrent attempt) surfaces as `DuplicateWrite`, which callers
    /// treat as already handled.
    #[allow(clippy::too_many_arguments)]
    pub async fn claim(
        &self,
        store_id: i64,
        alert_id: Option<i64>,
        escalation_id: i64,
        call_type: ScriptKind,
        recipient_name: &str,
        recipient_phone: &str,
        script_text: &str,
        attempt: i64,
    ) -> anyhow::Result<AiCallRecord> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO ai_calls (
                store_id, alert_id, escalation_id, call_type, call_status,
                recipient_name, recipient_phone, script_text, attempt,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'scheduled', ?, ?, ?, ?, ?, ?)",
        )
        .bind(store_id)
        .bind(alert_id)
        .bind(escalation_id)
        .bind(call_type.as_str())
        .bind(recipient_name)
        .bind(recipient_phone)
        .bind(script_text)
        .bind(attempt)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::DuplicateWrite(format!(
                    "outreach already claimed for escalation {}",
                    escalation_id
                ))
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(AiCallRecord {
            id,
            store_id,
            alert_id,
            task_id: None,
            escalation_id,
            call_type,
            call_status: CallStatus::Scheduled,
            recipient_name: recipient_name.to_string(),
            recipient_phone: recipient_phone.to_string(),
            script_text: script_text.to_string(),
            external_call_id: None,
            initiated_at: None,
            connected_at: None,
            ended_at: None,
            duration_seconds: None,
            transcript: None,
            sentiment: None,
            response: None,
            follow_up_required: false,
            attempt,
            created_at: now,
        })
    }

    /// The provider accepted the call.
    pub async fn mark_initiated(&self, call_id: i64, external_call_id: &str) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE ai_calls SET call_status = 'in_progress', external_call_id = ?,
                 initiated_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(external_call_id)
        .bind(&now)
        .bind(&now)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The attempt is dead: provider rejected it or the retry was
    /// exhausted. Failed rows release the escalation's uniqueness claim so
    /// a retry can insert a fresh row.
    pub async fn mark_failed(&self, call_id: i64) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE ai_calls SET call_status = 'failed', ended_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply the provider's final result.
    pub async fn record_outcome(&self, call_id: i64, outcome: &CallOutcome) -> anyhow::Result<()> {
        let follow_up = matches!(
            outcome.status,
            CallStatus::Failed | CallStatus::NoAnswer
        ) || outcome.response == Some(CallResponse::Yes);

        sqlx::query(
            "UPDATE ai_calls SET call_status = ?, connected_at = ?, ended_at = ?,
                 duration_seconds = ?, transcript = ?, sentiment = ?, response = ?,
                 follow_up_required = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(outcome.status.as_str())
        .bind(outcome.connected_at.map(|t| t.to_rfc3339()))
        .bind(outcome.ended_at.map(|t| t.to_rfc3339()))
        .bind(outcome.duration_seconds)
        .bind(&outcome.transcript)
        .bind(&outcome.sentiment)
        .bind(outcome.response.map(|r| r.as_str()))
        .bind(follow_up as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<AiCallRecord>> {
        let row = sqlx::query("SELECT * FROM ai_calls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_call(&row)?)),
            None => Ok(None),
        }
    }

    /// Look a call up by the provider's id, as delivered on its callback.
    /// Newest first, in case a retried escalation reused the same id.
    pub async fn get_by_external_id(
        &self,
        external_call_id: &str,
    ) -> anyhow::Result<Option<AiCallRecord>> {
        let row = sqlx::query(
            "SELECT * FROM ai_calls WHERE external_call_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(external_call_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row_to_call(&row)?)),
            None => Ok(None),
        }
    }

    /// The live (non-failed) record holding an escalation's outreach slot.
    pub async fn get_live_for_escalation(
        &self,
        escalation_id: i64,
    ) -> anyhow::Result<Option<AiCallRecord>> {
        let row = sqlx::query(
            "SELECT * FROM ai_calls WHERE escalation_id = ? AND call_status != 'failed'",
        )
        .bind(escalation_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row_to_call(&row)?)),
            None => Ok(None),
        }
    }

    /// All attempts for an escalation, oldest first.
    pub async fn attempts_for_escalation(
        &self,
        escalation_id: i64,
    ) -> anyhow::Result<Vec<AiCallRecord>> {
        let rows = sqlx::query("SELECT * FROM ai_calls WHERE escalation_id = ? ORDER BY id ASC")
            .bind(escalation_id)
            .fetch_all(&self.pool)
            .await?;

        let mut calls = Vec::with_capacity(rows.len());
        for row in rows {
            calls.push(row_to_call(&row)?);
        }
        Ok(calls)
    }

    /// Call history for a store, newest first.
    pub async fn history(&self, store_id: i64, limit: i64) -> anyhow::Result<Vec<AiCallRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM ai_calls WHERE store_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(store_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut calls = Vec::with_capacity(rows.len());
        for row in rows {
            calls.push(row_to_call(&row)?);
        }
        Ok(calls)
    }
}

fn row_to_call(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<AiCallRecord> {
    let call_type: String = row.get("call_type");
    let call_status: String = row.get("call_status");
    let initiated_at: Option<String> = row.get("initiated_at");
    let connected_at: Option<String> = row.get("connected_at");
    let ended_at: Option<String> = row.get("ended_at");
    let response: Option<String> = row.get("response");
    let created_at: String = row.get("created_at");

    Ok(AiCallRecord {
        id: row.get("id"),
        store_id: row.get("store_id"),
        alert_id: row.get("alert_id"),
        task_id: row.get("task_id"),
        escalation_id: row.get("escalation_id"),
        call_type: ScriptKind::parse(&call_type),
        call_status: CallStatus::parse(&call_status),
        recipient_name: row.get("recipient_name"),
        recipient_phone: row.get("recipient_phone"),
        script_text: row.get("script_text"),
        external_call_id: row.get("external_call_id"),
        initiated_at: initiated_at.map(|s| parse_timestamp(&s)),
        connected_at: connected_at.map(|s| parse_timestamp(&s)),
        ended_at: ended_at.map(|s| parse_timestamp(&s)),
        duration_seconds: row.get("duration_seconds"),
        transcript: row.get("transcript"),
        sentiment: row.get("sentiment"),
        response: response.map(|s| CallResponse::parse(&s)),
        follow_up_required: row.get::<i64, _>("follow_up_required") != 0,
        attempt: row.get("attempt"),
        created_at: parse_timestamp(&created_at),
    })
}
