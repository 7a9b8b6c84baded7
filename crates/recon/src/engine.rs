use chrono::NaiveDate;
use fibu_core::{DateWindow, InvoiceOrigin, Money, TransactionSource};
use serde::Deserialize;

use crate::exclusion::ExclusionPolicy;
use crate::rules::{RuleSet, RuleTarget};
use crate::util::contains_reference;

/// All matching thresholds. Defaults mirror observed payment behavior;
/// every value can be overridden from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Amount tolerance for heuristic candidate search, in cents.
    pub amount_tolerance_cents: i64,
    pub date_window: DateWindow,
    /// Minimum combined score a candidate must clear.
    pub min_score: f32,
    /// Relative band within which two candidates count as a tie.
    pub tie_band: f32,
    /// Rules below this confidence are kept out of the fast path.
    pub confidence_floor: f32,
    pub amount_weight: f32,
    pub date_weight: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            amount_tolerance_cents: 50,
            date_window: DateWindow::default(),
            min_score: 0.55,
            tie_band: 0.01,
            confidence_floor: 0.5,
            amount_weight: 0.6,
            date_weight: 0.4,
        }
    }
}

/// The transaction fields the engine looks at.
#[derive(Debug, Clone)]
pub struct MatchInput {
    pub source: TransactionSource,
    pub amount: Money,
    pub posted_date: NaiveDate,
    pub counterparty: String,
    pub memo: Option<String>,
}

impl MatchInput {
    /// Combined free text searched for order references.
    pub fn search_text(&self) -> String {
        match &self.memo {
            Some(memo) => format!("{} {}", self.counterparty, memo),
            None => self.counterparty.clone(),
        }
    }
}

/// An invoice candidate as returned by the repository search.
#[derive(Debug, Clone)]
pub struct CandidateInvoice {
    pub id: i64,
    pub invoice_number: String,
    pub order_reference: Option<String>,
    pub gross_cents: i64,
    pub issue_date: NaiveDate,
    pub counterparty: String,
    pub origin: InvoiceOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Mapping,
    Rule,
    Heuristic,
}

/// Engine verdict for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched {
        kind: MatchKind,
        invoice_id: Option<i64>,
        account_code: Option<String>,
        rule_id: Option<i64>,
        score: f32,
    },
    /// Several candidates within the tie band; surfaced for manual
    /// resolution, never auto-applied.
    Ambiguous { invoice_ids: Vec<i64>, best_score: f32 },
    /// The counterparty is restricted to one invoice population and the
    /// only viable candidates were outside it.
    Excluded { category: String },
    NoMatch,
}

struct Scored<'a> {
    invoice: &'a CandidateInvoice,
    score: f32,
    reference_hit: bool,
}

pub struct ReconEngine {
    config: MatchConfig,
}

impl ReconEngine {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Whether a matched pair settles the invoice completely (sets the
    /// invoice to paid instead of partially paid).
    pub fn settles_in_full(&self, tx_amount: Money, invoice_gross: Money) -> bool {
        tx_amount.abs().diff_cents(invoice_gross.abs()) <= self.config.amount_tolerance_cents
    }

    /// Runs the matching algorithm for one transaction against an
    /// already-fetched candidate list.
    ///
    /// Order: exclusion restriction → creditor mapping → rule fast path
    /// → heuristic scoring with tie-band ambiguity.
    pub fn decide(
        &self,
        tx: &MatchInput,
        mapping_account: Option<&str>,
        rules: &RuleSet,
        policy: &ExclusionPolicy,
        candidates: &[CandidateInvoice],
    ) -> Outcome {
        let restriction = policy.category_for(&tx.counterparty);
        let permitted = restriction.map(|c| c.permitted_origin);

        // Manual creditor/debtor mapping bypasses search entirely.
        if let Some(account) = mapping_account {
            return Outcome::Matched {
                kind: MatchKind::Mapping,
                invoice_id: None,
                account_code: Some(account.to_string()),
                rule_id: None,
                score: 1.0,
            };
        }

        if let Some(rule) = rules.find_match(tx.source, &tx.search_text()) {
            match &rule.target {
                RuleTarget::Account(code) if permitted.is_none() => {
                    return Outcome::Matched {
                        kind: MatchKind::Rule,
                        invoice_id: None,
                        account_code: Some(code.clone()),
                        rule_id: rule.id,
                        score: rule.confidence,
                    };
                }
                // An account rule on a restricted counterparty would book
                // around the settlement population; skip it.
                RuleTarget::Account(_) => {}
                RuleTarget::Origin(origin) if permitted.map_or(true, |p| p == *origin) => {
                    match self.best_heuristic(tx, candidates, Some(*origin)) {
                        Outcome::Matched {
                            invoice_id, score, ..
                        } => {
                            return Outcome::Matched {
                                kind: MatchKind::Rule,
                                invoice_id,
                                account_code: None,
                                rule_id: rule.id,
                                score,
                            };
                        }
                        Outcome::Ambiguous {
                            invoice_ids,
                            best_score,
                        } => {
                            return Outcome::Ambiguous {
                                invoice_ids,
                                best_score,
                            };
                        }
                        // No candidate in the rule's population yet; fall
                        // through to the general heuristic.
                        _ => {}
                    }
                }
                RuleTarget::Origin(_) => {}
            }
        }

        match self.best_heuristic(tx, candidates, permitted) {
            Outcome::NoMatch if permitted.is_some() => {
                // Did an out-of-population candidate score? Then the
                // domain rule, not the data, blocked the match.
                if self
                    .scored_candidates(tx, candidates, None)
                    .iter()
                    .any(|s| s.score >= self.config.min_score)
                {
                    Outcome::Excluded {
                        category: restriction.map(|c| c.name.clone()).unwrap_or_default(),
                    }
                } else {
                    Outcome::NoMatch
                }
            }
            outcome => outcome,
        }
    }

    fn best_heuristic(
        &self,
        tx: &MatchInput,
        candidates: &[CandidateInvoice],
        restrict: Option<InvoiceOrigin>,
    ) -> Outcome {
        let mut scored = self.scored_candidates(tx, candidates, restrict);
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let Some(best) = scored.first() else {
            return Outcome::NoMatch;
        };
        if best.score < self.config.min_score {
            return Outcome::NoMatch;
        }

        // An order-reference hit names its invoice; a same-day exact-amount
        // competitor must not drag it into the tie band. Only several
        // conflicting reference hits stay ambiguous.
        let mut referenced = scored.iter().filter(|s| s.reference_hit);
        if let (Some(hit), None) = (referenced.next(), referenced.next()) {
            return Outcome::Matched {
                kind: MatchKind::Heuristic,
                invoice_id: Some(hit.invoice.id),
                account_code: None,
                rule_id: None,
                score: hit.score,
            };
        }

        let tied: Vec<i64> = scored
            .iter()
            .take_while(|s| s.score >= best.score * (1.0 - self.config.tie_band))
            .map(|s| s.invoice.id)
            .collect();
        if tied.len() > 1 {
            return Outcome::Ambiguous {
                invoice_ids: tied,
                best_score: best.score,
            };
        }

        Outcome::Matched {
            kind: MatchKind::Heuristic,
            invoice_id: Some(best.invoice.id),
            account_code: None,
            rule_id: None,
            score: best.score,
        }
    }

    fn scored_candidates<'a>(
        &self,
        tx: &MatchInput,
        candidates: &'a [CandidateInvoice],
        restrict: Option<InvoiceOrigin>,
    ) -> Vec<Scored<'a>> {
        candidates
            .iter()
            .filter(|inv| restrict.map_or(true, |origin| inv.origin == origin))
            .filter_map(|inv| {
                self.score_pair(tx, inv).map(|(score, reference_hit)| Scored {
                    invoice: inv,
                    score,
                    reference_hit,
                })
            })
            .collect()
    }

    /// Scores one transaction/invoice pair, `None` when outside the
    /// amount tolerance or the date window. The flag marks an exact
    /// order-reference hit.
    fn score_pair(&self, tx: &MatchInput, inv: &CandidateInvoice) -> Option<(f32, bool)> {
        let diff_cents = (tx.amount.to_cents().abs() - inv.gross_cents.abs()).abs();
        if diff_cents > self.config.amount_tolerance_cents {
            return None;
        }

        let window = self.config.date_window.around(tx.posted_date);
        if !window.contains(inv.issue_date) {
            return None;
        }

        // An exact order-reference hit in the transaction text outranks
        // any score arithmetic.
        if let Some(reference) = &inv.order_reference {
            if contains_reference(&tx.search_text(), reference) {
                return Some((1.0, true));
            }
        }

        let date_dist = (tx.posted_date - inv.issue_date).num_days().abs();
        let amount_score =
            1.0 - diff_cents as f32 / (self.config.amount_tolerance_cents + 1) as f32;
        let date_score = 1.0 - date_dist as f32 / (self.config.date_window.span_days() + 1) as f32;

        Some((
            self.config.amount_weight * amount_score + self.config.date_weight * date_score,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MatchingRule, TriggerKind};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn tx(counterparty: &str, cents: i64, posted: NaiveDate) -> MatchInput {
        MatchInput {
            source: TransactionSource::Bank,
            amount: Money::from_cents(cents),
            posted_date: posted,
            counterparty: counterparty.to_string(),
            memo: None,
        }
    }

    fn invoice(
        id: i64,
        number: &str,
        counterparty: &str,
        cents: i64,
        issued: NaiveDate,
        origin: InvoiceOrigin,
    ) -> CandidateInvoice {
        CandidateInvoice {
            id,
            invoice_number: number.to_string(),
            order_reference: None,
            gross_cents: cents,
            issue_date: issued,
            counterparty: counterparty.to_string(),
            origin,
        }
    }

    fn engine() -> ReconEngine {
        ReconEngine::new(MatchConfig::default())
    }

    #[test]
    fn heuristic_match_marks_invoice_paid() {
        // 119.00 payment three days after a 119.00 invoice.
        let tx = tx("ACME GmbH", 11_900, date(2025, 10, 15));
        let candidates = vec![invoice(
            1,
            "RE-2025-0042",
            "ACME GmbH",
            11_900,
            date(2025, 10, 12),
            InvoiceOrigin::Sales,
        )];
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::empty(),
            &candidates,
        );
        match outcome {
            Outcome::Matched {
                kind: MatchKind::Heuristic,
                invoice_id: Some(1),
                ..
            } => {}
            other => panic!("expected heuristic match, got {other:?}"),
        }
        assert!(engine().settles_in_full(tx.amount, Money::from_cents(11_900)));
    }

    #[test]
    fn aggregator_never_binds_outside_settlement_population() {
        let tx = tx("Amazon Payment", 50_000, date(2025, 10, 15));
        let candidates = vec![
            // Direct sales invoice, best raw score (same day).
            invoice(
                1,
                "RE-2025-0099",
                "Amazon Payment",
                50_000,
                date(2025, 10, 15),
                InvoiceOrigin::Sales,
            ),
            // Settlement-derived invoice, lower score (older).
            invoice(
                2,
                "XRE-2025-0003",
                "Amazon Payment",
                50_000,
                date(2025, 10, 10),
                InvoiceOrigin::MarketplaceSettlement,
            ),
        ];
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::default(),
            &candidates,
        );
        match outcome {
            Outcome::Matched { invoice_id, .. } => assert_eq!(invoice_id, Some(2)),
            Outcome::Excluded { .. } => {}
            other => panic!("must never bind RE-2025-0099, got {other:?}"),
        }
    }

    #[test]
    fn aggregator_with_only_sales_candidates_is_excluded() {
        let tx = tx("Amazon Payment", 50_000, date(2025, 10, 15));
        let candidates = vec![invoice(
            1,
            "RE-2025-0099",
            "Amazon Payment",
            50_000,
            date(2025, 10, 15),
            InvoiceOrigin::Sales,
        )];
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::default(),
            &candidates,
        );
        assert_eq!(
            outcome,
            Outcome::Excluded {
                category: "payment_aggregator".to_string()
            }
        );
    }

    #[test]
    fn tie_band_yields_ambiguous() {
        let tx = tx("ACME GmbH", 11_900, date(2025, 10, 15));
        let candidates = vec![
            invoice(
                1,
                "RE-2025-0001",
                "ACME GmbH",
                11_900,
                date(2025, 10, 13),
                InvoiceOrigin::Sales,
            ),
            invoice(
                2,
                "RE-2025-0002",
                "ACME GmbH",
                11_900,
                date(2025, 10, 13),
                InvoiceOrigin::Sales,
            ),
        ];
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::empty(),
            &candidates,
        );
        match outcome {
            Outcome::Ambiguous { invoice_ids, .. } => {
                assert_eq!(invoice_ids.len(), 2);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn order_reference_overrides_score() {
        let mut input = tx("Unbekannt", 11_880, date(2025, 10, 22));
        input.memo = Some("Zahlung AUF-2025-0815".to_string());
        let mut with_ref = invoice(
            1,
            "RE-2025-0050",
            "ACME GmbH",
            11_900,
            date(2025, 10, 15),
            InvoiceOrigin::Sales,
        );
        with_ref.order_reference = Some("AUF-2025-0815".to_string());
        let closer = invoice(
            2,
            "RE-2025-0051",
            "Other",
            11_900,
            date(2025, 10, 21),
            InvoiceOrigin::Sales,
        );
        let outcome = engine().decide(
            &input,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::empty(),
            &[with_ref, closer],
        );
        match outcome {
            Outcome::Matched { invoice_id, score, .. } => {
                assert_eq!(invoice_id, Some(1));
                assert_eq!(score, 1.0);
            }
            other => panic!("expected reference override, got {other:?}"),
        }
    }

    #[test]
    fn reference_hit_beats_same_day_exact_amount_competitor() {
        // The competitor also scores 1.0; the named invoice must still
        // win instead of falling into the tie band.
        let mut input = tx("Unbekannt", 11_900, date(2025, 10, 20));
        input.memo = Some("Zahlung AUF-2025-0815".to_string());
        let mut with_ref = invoice(
            1,
            "RE-2025-0050",
            "ACME GmbH",
            11_900,
            date(2025, 10, 15),
            InvoiceOrigin::Sales,
        );
        with_ref.order_reference = Some("AUF-2025-0815".to_string());
        let same_day = invoice(
            2,
            "RE-2025-0051",
            "Other",
            11_900,
            date(2025, 10, 20),
            InvoiceOrigin::Sales,
        );
        let outcome = engine().decide(
            &input,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::empty(),
            &[with_ref, same_day],
        );
        match outcome {
            Outcome::Matched { invoice_id, .. } => assert_eq!(invoice_id, Some(1)),
            other => panic!("expected the referenced invoice to win, got {other:?}"),
        }
    }

    #[test]
    fn mapping_bypasses_everything() {
        let tx = tx("Hosting AG", -2_900, date(2025, 10, 15));
        let outcome = engine().decide(
            &tx,
            Some("4980"),
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::empty(),
            &[],
        );
        assert_eq!(
            outcome,
            Outcome::Matched {
                kind: MatchKind::Mapping,
                invoice_id: None,
                account_code: Some("4980".to_string()),
                rule_id: None,
                score: 1.0,
            }
        );
    }

    #[test]
    fn account_rule_wins_over_heuristic() {
        let rule = MatchingRule {
            id: Some(7),
            pattern: "deutsche post".to_string(),
            kind: TriggerKind::Contains,
            source_scope: None,
            target: RuleTarget::Account("4910".to_string()),
            confidence: 0.85,
            hit_count: 3,
            last_applied: None,
        };
        let tx = tx("Deutsche Post AG", -800, date(2025, 10, 15));
        let candidates = vec![invoice(
            1,
            "ER-2025-0400",
            "Deutsche Post AG",
            -800,
            date(2025, 10, 14),
            InvoiceOrigin::Purchase,
        )];
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![rule], 0.5),
            &ExclusionPolicy::empty(),
            &candidates,
        );
        match outcome {
            Outcome::Matched {
                kind: MatchKind::Rule,
                rule_id: Some(7),
                account_code: Some(code),
                ..
            } => assert_eq!(code, "4910"),
            other => panic!("expected rule match, got {other:?}"),
        }
    }

    #[test]
    fn demoted_rule_falls_back_to_heuristic() {
        let rule = MatchingRule {
            id: Some(9),
            pattern: "acme".to_string(),
            kind: TriggerKind::Contains,
            source_scope: None,
            target: RuleTarget::Account("4980".to_string()),
            confidence: 0.2,
            hit_count: 1,
            last_applied: None,
        };
        let tx = tx("ACME GmbH", 11_900, date(2025, 10, 15));
        let candidates = vec![invoice(
            1,
            "RE-2025-0042",
            "ACME GmbH",
            11_900,
            date(2025, 10, 12),
            InvoiceOrigin::Sales,
        )];
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![rule], 0.5),
            &ExclusionPolicy::empty(),
            &candidates,
        );
        assert!(matches!(
            outcome,
            Outcome::Matched {
                kind: MatchKind::Heuristic,
                ..
            }
        ));
    }

    #[test]
    fn outside_tolerance_or_window_is_no_match() {
        let tx = tx("ACME GmbH", 11_900, date(2025, 10, 15));
        let too_expensive = invoice(
            1,
            "RE-1",
            "ACME GmbH",
            12_000,
            date(2025, 10, 14),
            InvoiceOrigin::Sales,
        );
        let too_old = invoice(
            2,
            "RE-2",
            "ACME GmbH",
            11_900,
            date(2025, 10, 1),
            InvoiceOrigin::Sales,
        );
        let outcome = engine().decide(
            &tx,
            None,
            &RuleSet::new(vec![], 0.5),
            &ExclusionPolicy::empty(),
            &[too_expensive, too_old],
        );
        assert_eq!(outcome, Outcome::NoMatch);
    }
}
