//! The escalation state machine: validates and commits level transitions.
//!
//! Callers hold the store's evaluation lock across read-evaluate-commit.
//! The machine still re-reads the current level immediately before writing
//! and refuses to commit against stale state, so a lock bug or crash-retry
//! cannot corrupt the ladder.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::EngineError;

use super::rules::ProposedTransition;
use super::store::EscalationStore;
use super::{Escalation, EscalationStatus, EscalationTarget, EscalationTrigger, MAX_LEVEL};

pub struct EscalationMachine {
    store: Arc<EscalationStore>,
}

impl EscalationMachine {
    pub fn new(store: Arc<EscalationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EscalationStore> {
        &self.store
    }

    /// Commit a rule-proposed transition, returning the durable audit row.
    ///
    /// The row is persisted before any side effect runs, so alerts, tasks,
    /// and calls can always be traced back to (and retried from) it.
    ///
    /// Fails with `StaleState` if the store's level no longer matches the
    /// level the proposal was evaluated against; the caller re-reads and
    /// re-evaluates rather than force-applying.
    pub async fn commit_transition(
        &self,
        store_id: i64,
        proposal: &ProposedTransition,
        alert_id: Option<i64>,
        target: &EscalationTarget,
    ) -> anyhow::Result<Escalation> {
        if proposal.to_level <= proposal.from_level || proposal.to_level > MAX_LEVEL {
            anyhow::bail!(
                "invalid transition {} -> {} for store {}: levels only move up, to a maximum of {}",
                proposal.from_level,
                proposal.to_level,
                store_id,
                MAX_LEVEL
            );
        }

        let current = self.store.current_level(store_id).await?;
        if current != proposal.from_level {
            warn!(
                store_id,
                expected = proposal.from_level,
                found = current,
                "Escalation level moved under us; aborting transition"
            );
            return Err(EngineError::StaleState {
                store_id,
                expected: proposal.from_level,
                found: current,
            }
            .into());
        }

        let escalation = self
            .store
            .insert_escalation(
                store_id,
                alert_id,
                None,
                proposal.from_level,
                proposal.to_level,
                proposal.trigger,
                &proposal.reason,
                target,
                EscalationStatus::Pending,
                None,
            )
            .await?;

        info!(
            store_id,
            from = proposal.from_level,
            to = proposal.to_level,
            trigger = proposal.trigger.as_str(),
            action = proposal.action.as_str(),
            escalation_id = escalation.id,
            "Escalation committed"
        );

        Ok(escalation)
    }

    /// Explicit, audited resolve back to level 0.
    ///
    /// This is the only way a store's level decreases. Writes its own audit
    /// row and closes every open escalation; returns None if the store was
    /// already at level 0.
    pub async fn resolve(
        &self,
        store_id: i64,
        resolution: &str,
        target: &EscalationTarget,
    ) -> anyhow::Result<Option<Escalation>> {
        let current = self.store.current_level(store_id).await?;
        if current == 0 {
            return Ok(None);
        }

        let escalation = self
            .store
            .insert_escalation(
                store_id,
                None,
                None,
                current,
                0,
                EscalationTrigger::Manual,
                &format!("Resolved from level {}: {}", current, resolution),
                target,
                EscalationStatus::Resolved,
                Some(resolution),
            )
            .await?;

        let closed = self.store.resolve_open_for_store(store_id, resolution).await?;

        info!(
            store_id,
            from = current,
            closed_escalations = closed,
            "Store resolved to level 0"
        );

        Ok(Some(escalation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::escalation::{EscalationAction, EscalationTrigger};

    async fn setup() -> (EscalationMachine, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let pool = db::open_pool(db_file.path().to_str().unwrap())
            .await
            .unwrap();
        let store = Arc::new(EscalationStore::new(pool));
        (EscalationMachine::new(store), db_file)
    }

    fn proposal(from_level: i64, to_level: i64) -> ProposedTransition {
        ProposedTransition {
            rule_id: 1,
            from_level,
            to_level,
            trigger: EscalationTrigger::StatusRed,
            action: EscalationAction::SendAlert,
            reason: "test".to_string(),
        }
    }

    fn target() -> EscalationTarget {
        EscalationTarget {
            role: "store_manager".to_string(),
            name: Some("Jamie".to_string()),
            contact: Some("+15550101".to_string()),
        }
    }

    #[tokio::test]
    async fn test_commit_advances_level() {
        let (machine, _db) = setup().await;

        let escalation = machine
            .commit_transition(1, &proposal(0, 2), Some(11), &target())
            .await
            .unwrap();
        assert_eq!(escalation.from_level, 0);
        assert_eq!(escalation.to_level, 2);
        assert_eq!(escalation.alert_id, Some(11));
        assert_eq!(machine.store().current_level(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_state_aborts() {
        let (machine, _db) = setup().await;

        machine
            .commit_transition(1, &proposal(0, 2), None, &target())
            .await
            .unwrap();

        // A second evaluator that still believes the store is at level 0.
        let err = machine
            .commit_transition(1, &proposal(0, 2), None, &target())
            .await
            .unwrap_err();
        let stale = err.downcast_ref::<EngineError>();
        assert!(matches!(stale, Some(EngineError::StaleState { .. })));

        // The failed commit left no extra audit row.
        assert_eq!(machine.store().history(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_downward_transition_rejected() {
        let (machine, _db) = setup().await;

        machine
            .commit_transition(1, &proposal(0, 3), None, &target())
            .await
            .unwrap();

        let err = machine
            .commit_transition(1, &proposal(3, 2), None, &target())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only move up"));
        assert_eq!(machine.store().current_level(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_level_capped_at_max() {
        let (machine, _db) = setup().await;

        let err = machine
            .commit_transition(1, &proposal(0, 5), None, &target())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("maximum"));
    }

    #[tokio::test]
    async fn test_resolve_writes_audit_row_and_resets() {
        let (machine, _db) = setup().await;

        machine
            .commit_transition(1, &proposal(0, 2), None, &target())
            .await
            .unwrap();
        machine
            .commit_transition(1, &proposal(2, 3), None, &target())
            .await
            .unwrap();

        let resolved = machine
            .resolve(1, "Sales recovered after promo fix", &target())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.from_level, 3);
        assert_eq!(resolved.to_level, 0);
        assert_eq!(resolved.trigger, EscalationTrigger::Manual);
        assert_eq!(machine.store().current_level(1).await.unwrap(), 0);

        // Three audit rows total: two transitions up, one resolve.
        let history = machine.store().history(1, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        // Every prior open escalation got closed.
        assert!(machine.store().list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_at_level_0_is_noop() {
        let (machine, _db) = setup().await;
        assert!(machine.resolve(1, "nothing", &target()).await.unwrap().is_none());
        assert!(machine.store().history(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_can_reenter_after_resolve() {
        let (machine, _db) = setup().await;

        machine
            .commit_transition(1, &proposal(0, 2), None, &target())
            .await
            .unwrap();
        machine.resolve(1, "fixed", &target()).await.unwrap();

        // Fresh incident starts from 0 again.
        let escalation = machine
            .commit_transition(1, &proposal(0, 1), None, &target())
            .await
            .unwrap();
        assert_eq!(escalation.from_level, 0);
        assert_eq!(machine.store().current_level(1).await.unwrap(), 1);
    }
}
