//! Pure rule evaluation: given where a store is on the ladder and how long
//! its condition has held, decide whether a transition is due.

use crate::kpi::MetricStatus;

use super::{EscalationAction, EscalationRule, EscalationTrigger};

/// Everything a rule needs to know about one store at evaluation time.
///
/// `condition_held_hours` is measured from the driving alert's `raised_at`:
/// a condition that clears resolves the alert, so a re-entry restarts the
/// clock naturally.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext {
    pub current_level: i64,
    pub red_count: i64,
    pub yellow_count: i64,
    /// Severity of the driving alert, if one is live.
    pub alert_severity: Option<MetricStatus>,
    pub condition_held_hours: f64,
    /// A live alert has blown past its `expires_at` deadline.
    pub sla_breached: bool,
    /// Set by a prediction collaborator via ingestion; the engine itself
    /// never raises this flag.
    pub predicted_risk: bool,
}

/// A transition a rule proposes. Commitment (and the stale-state check) is
/// the state machine's job.
#[derive(Debug, Clone)]
pub struct ProposedTransition {
    pub rule_id: i64,
    pub from_level: i64,
    pub to_level: i64,
    pub trigger: EscalationTrigger,
    pub action: EscalationAction,
    pub reason: String,
}

/// Stateless evaluator over a store's applicable rules.
pub struct RuleEvaluator;

impl RuleEvaluator {
    /// The first due transition, or None.
    ///
    /// Only rules whose `from_level` matches the store's current level are
    /// eligible; that both prevents level-skipping and stops a rule from
    /// firing twice for the same incident. `rules` must be ordered
    /// specific-before-general (the store query does this) so a per-KPI
    /// rule wins over an org-wide one for the same rung.
    pub fn first_due(rules: &[EscalationRule], ctx: &RuleContext) -> Option<ProposedTransition> {
        rules
            .iter()
            .filter(|rule| rule.is_active && rule.from_level == ctx.current_level)
            .find(|rule| Self::is_due(rule, ctx))
            .map(|rule| ProposedTransition {
                rule_id: rule.id,
                from_level: rule.from_level,
                to_level: rule.to_level,
                trigger: rule.trigger,
                action: rule.action,
                reason: Self::reason(rule, ctx),
            })
    }

    fn is_due(rule: &EscalationRule, ctx: &RuleContext) -> bool {
        if !Self::condition_holds(rule.trigger, ctx) {
            return false;
        }
        ctx.condition_held_hours >= rule.duration_hours as f64
    }

    fn condition_holds(trigger: EscalationTrigger, ctx: &RuleContext) -> bool {
        match trigger {
            EscalationTrigger::StatusRed => {
                ctx.alert_severity == Some(MetricStatus::Red) || ctx.red_count > 0
            }
            EscalationTrigger::StatusYellow => ctx.alert_severity == Some(MetricStatus::Yellow),
            EscalationTrigger::MultipleYellow => ctx.yellow_count >= 2,
            EscalationTrigger::SlaBreach => ctx.sla_breached,
            EscalationTrigger::PredictedRisk => ctx.predicted_risk,
            // Manual transitions never come from rules.
            EscalationTrigger::Manual => false,
        }
    }

    fn reason(rule: &EscalationRule, ctx: &RuleContext) -> String {
        let condition = match rule.trigger {
            EscalationTrigger::StatusRed => "red status".to_string(),
            EscalationTrigger::StatusYellow => "yellow status".to_string(),
            EscalationTrigger::MultipleYellow => {
                format!("{} KPIs simultaneously below target", ctx.yellow_count)
            }
            EscalationTrigger::SlaBreach => "a breached response SLA".to_string(),
            EscalationTrigger::PredictedRisk => "predicted risk".to_string(),
            EscalationTrigger::Manual => "manual action".to_string(),
        };

        format!(
            "Store has held {} for {:.0} hours, exceeding the {}-hour policy window. \
             Escalating from level {} to level {}.",
            condition, ctx.condition_held_hours, rule.duration_hours, rule.from_level, rule.to_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        id: i64,
        kpi: Option<i64>,
        trigger: EscalationTrigger,
        duration_hours: i64,
        from_level: i64,
        to_level: i64,
        action: EscalationAction,
    ) -> EscalationRule {
        EscalationRule {
            id,
            organization_id: 1,
            kpi_definition_id: kpi,
            trigger,
            duration_hours,
            from_level,
            to_level,
            action,
            is_active: true,
        }
    }

    fn ctx(current_level: i64, held_hours: f64) -> RuleContext {
        RuleContext {
            current_level,
            red_count: 1,
            yellow_count: 0,
            alert_severity: Some(MetricStatus::Red),
            condition_held_hours: held_hours,
            sla_breached: false,
            predicted_risk: false,
        }
    }

    #[test]
    fn test_fires_after_duration() {
        let rules = vec![rule(
            1,
            None,
            EscalationTrigger::StatusRed,
            48,
            0,
            2,
            EscalationAction::SendAlert,
        )];

        assert!(RuleEvaluator::first_due(&rules, &ctx(0, 47.9)).is_none());

        let proposed = RuleEvaluator::first_due(&rules, &ctx(0, 48.0)).unwrap();
        assert_eq!(proposed.to_level, 2);
        assert_eq!(proposed.action, EscalationAction::SendAlert);
        assert_eq!(proposed.trigger, EscalationTrigger::StatusRed);
        assert!(proposed.reason.contains("48-hour"));
    }

    #[test]
    fn test_from_level_mismatch_is_ineligible() {
        let rules = vec![rule(
            1,
            None,
            EscalationTrigger::StatusRed,
            4,
            0,
            2,
            EscalationAction::SendAlert,
        )];

        // Already at level 2: the 0->2 rule must not re-fire.
        assert!(RuleEvaluator::first_due(&rules, &ctx(2, 100.0)).is_none());
    }

    #[test]
    fn test_inactive_rule_skipped() {
        let mut r = rule(
            1,
            None,
            EscalationTrigger::StatusRed,
            4,
            0,
            2,
            EscalationAction::SendAlert,
        );
        r.is_active = false;
        assert!(RuleEvaluator::first_due(&[r], &ctx(0, 100.0)).is_none());
    }

    #[test]
    fn test_condition_must_match_severity() {
        let rules = vec![rule(
            1,
            None,
            EscalationTrigger::StatusYellow,
            1,
            0,
            1,
            EscalationAction::CreateTask,
        )];

        // Driving alert is red, not yellow.
        assert!(RuleEvaluator::first_due(&rules, &ctx(0, 100.0)).is_none());

        let yellow_ctx = RuleContext {
            alert_severity: Some(MetricStatus::Yellow),
            red_count: 0,
            ..ctx(0, 100.0)
        };
        assert!(RuleEvaluator::first_due(&rules, &yellow_ctx).is_some());
    }

    #[test]
    fn test_sla_breach_requires_breach_flag() {
        let rules = vec![rule(
            1,
            None,
            EscalationTrigger::SlaBreach,
            24,
            2,
            3,
            EscalationAction::AiCall,
        )];

        assert!(RuleEvaluator::first_due(&rules, &ctx(2, 30.0)).is_none());

        let breached = RuleContext {
            sla_breached: true,
            ..ctx(2, 30.0)
        };
        let proposed = RuleEvaluator::first_due(&rules, &breached).unwrap();
        assert_eq!(proposed.action, EscalationAction::AiCall);
        assert_eq!(proposed.to_level, 3);
    }

    #[test]
    fn test_multiple_yellow_counts() {
        let rules = vec![rule(
            1,
            None,
            EscalationTrigger::MultipleYellow,
            2,
            0,
            2,
            EscalationAction::SendAlert,
        )];

        let one_yellow = RuleContext {
            yellow_count: 1,
            red_count: 0,
            alert_severity: Some(MetricStatus::Yellow),
            ..ctx(0, 10.0)
        };
        assert!(RuleEvaluator::first_due(&rules, &one_yellow).is_none());

        let two_yellow = RuleContext {
            yellow_count: 2,
            ..one_yellow
        };
        assert!(RuleEvaluator::first_due(&rules, &two_yellow).is_some());
    }

    #[test]
    fn test_specific_rule_wins_over_general() {
        // Store query orders specific rules first; first_due takes the first
        // match, so the per-KPI rule's shorter window applies.
        let rules = vec![
            rule(
                10,
                Some(7),
                EscalationTrigger::StatusRed,
                2,
                0,
                2,
                EscalationAction::AiCall,
            ),
            rule(
                11,
                None,
                EscalationTrigger::StatusRed,
                2,
                0,
                2,
                EscalationAction::SendAlert,
            ),
        ];

        let proposed = RuleEvaluator::first_due(&rules, &ctx(0, 3.0)).unwrap();
        assert_eq!(proposed.rule_id, 10);
        assert_eq!(proposed.action, EscalationAction::AiCall);
    }

    #[test]
    fn test_predicted_risk_is_inert_without_flag() {
        let rules = vec![rule(
            1,
            None,
            EscalationTrigger::PredictedRisk,
            0,
            0,
            1,
            EscalationAction::CreateTask,
        )];

        assert!(RuleEvaluator::first_due(&rules, &ctx(0, 100.0)).is_none());

        let flagged = RuleContext {
            predicted_risk: true,
            ..ctx(0, 100.0)
        };
        assert!(RuleEvaluator::first_due(&rules, &flagged).is_some());
    }
}
