use fibu_core::Decision;

use crate::rules::{MatchingRule, RuleTarget, TriggerKind};
use crate::util::normalize_counterparty;

/// Confidence a freshly synthesized rule starts at: above the default
/// floor, but low enough that a couple of reversals demote it.
pub const SEED_CONFIDENCE: f32 = 0.55;

/// Half-life for recency weighting, in days.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 30.0;

/// One history entry as seen by the learning pass.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub decision: Decision,
    pub age_days: i64,
}

/// Small bump toward 1.0 after a confirmed application.
pub fn reinforce(confidence: f32) -> f32 {
    (confidence + 0.05 * (1.0 - confidence)).clamp(0.0, 1.0)
}

/// Multiplicative decay after an override or reversal. Stronger than a
/// single reinforcement so repeated mistakes demote quickly.
pub fn weaken(confidence: f32) -> f32 {
    (confidence * 0.7).clamp(0.0, 1.0)
}

/// Recomputes a rule's confidence from its full decision history.
///
/// Confidence moves toward agreements / (agreements + reversals), with
/// exponential recency weighting so a recent reversal outweighs many
/// old agreements. Returns `None` when the history holds no relevant
/// entries, leaving the stored confidence untouched.
pub fn recompute_confidence(observations: &[Observation], half_life_days: f64) -> Option<f32> {
    let mut agreements = 0.0f64;
    let mut reversals = 0.0f64;

    for obs in observations {
        let weight = 0.5f64.powf(obs.age_days.max(0) as f64 / half_life_days);
        match obs.decision {
            Decision::AutoRule | Decision::AutoHeuristic | Decision::Manual => {
                agreements += weight;
            }
            Decision::Rejected => reversals += weight,
        }
    }

    let total = agreements + reversals;
    if total == 0.0 {
        return None;
    }
    Some(((agreements / total) as f32).clamp(0.0, 1.0))
}

/// Builds a new rule from a manually confirmed match with no covering
/// rule: the counterparty becomes an exact trigger, seeded conservative.
pub fn synthesize_rule(counterparty: &str, target: RuleTarget) -> MatchingRule {
    MatchingRule {
        id: None,
        pattern: normalize_counterparty(counterparty),
        kind: TriggerKind::Exact,
        source_scope: None,
        target,
        confidence: SEED_CONFIDENCE,
        hit_count: 0,
        last_applied: None,
    }
}
