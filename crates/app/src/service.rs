use chrono::Utc;
use fibu_core::{
    DateRange, Decision, DomainError, InvoiceOrigin, MatchState, Money, TransactionSource,
};
use fibu_export::{booking_rows, BookingRow, BookingSide, ExportError, MatchedBooking};
use fibu_recon::{
    feeds, learning, retry, rules, CancelFlag, CandidateInvoice, ExclusionPolicy, Feed,
    FeedError, IngestReport, MatchConfig, MatchInput, MatchKind, MatchingRule, Outcome,
    RawEvent, ReconEngine, RetryPolicy, RuleSet, RuleTarget, SkipReason, TriggerKind,
};
use fibu_storage::{
    self as storage, DbPool, InsertOutcome, InvoiceRecord, InvoiceSearch, MatchApplication,
    NewInvoiceRow, NewRuleRow, NewTransactionRow, RuleRecord, StorageError, TransactionRecord,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("Invalid rule set: {0}")]
    Rules(String),
}

/// Structured outcome of one matching pass: operators see partial
/// progress with reasons, never an opaque all-or-nothing failure.
#[derive(Debug, Default, Serialize)]
pub struct PassReport {
    pub processed: u64,
    pub matched: u64,
    pub ambiguous: u64,
    pub excluded: u64,
    pub unmatched: u64,
    /// Transactions another pass already claimed; expected, not errors.
    pub skipped_claimed: u64,
    pub failed: Vec<(i64, String)>,
}

/// Glue between storage, the matching engine and the exporter. One
/// instance per console; every batch operation is trigger-agnostic and
/// returns a structured report.
pub struct ReconService {
    pool: DbPool,
    engine: ReconEngine,
    policy: ExclusionPolicy,
}

impl ReconService {
    pub fn new(pool: DbPool, config: MatchConfig, policy: ExclusionPolicy) -> Self {
        Self {
            pool,
            engine: ReconEngine::new(config),
            policy,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ── Ingestion ─────────────────────────────────────────────────────────

    /// Normalizes and stores a batch of provider events. Malformed
    /// events are skipped with a reason; duplicates are counted.
    pub async fn ingest(
        &self,
        source: TransactionSource,
        events: &[RawEvent],
    ) -> Result<IngestReport, ServiceError> {
        let mut report = IngestReport::default();

        for (index, event) in events.iter().enumerate() {
            let tx = match feeds::normalize(source, event) {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::warn!("Skipping malformed event #{index}: {e}");
                    report.skipped_malformed.push(SkipReason {
                        index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let row = NewTransactionRow {
                source: tx.source,
                external_id: tx.external_id,
                amount_cents: tx.amount.to_cents(),
                currency: tx.currency,
                posted_date: tx.posted_date,
                counterparty: tx.counterparty,
                memo: tx.memo,
                raw_payload: tx.raw.to_string(),
            };
            match storage::insert_transaction(&self.pool, &row).await? {
                InsertOutcome::Inserted(_) => report.inserted += 1,
                InsertOutcome::Duplicate => report.skipped_duplicate += 1,
            }
        }

        tracing::info!(
            "Ingest from {source}: {} inserted, {} duplicates, {} malformed",
            report.inserted,
            report.skipped_duplicate,
            report.skipped_malformed.len()
        );
        Ok(report)
    }

    /// Drains an external feed chunk by chunk, then ingests the batch.
    /// A feed that keeps failing aborts before anything is written.
    pub async fn ingest_feed<F: Feed>(
        &self,
        source: TransactionSource,
        feed: &mut F,
        policy: RetryPolicy,
        cancel: &CancelFlag,
    ) -> Result<IngestReport, ServiceError> {
        let events = retry::drain_feed(feed, policy, cancel).await?;
        self.ingest(source, &events).await
    }

    // ── Matching ──────────────────────────────────────────────────────────

    /// Runs one matching pass over unmatched transactions in the date
    /// range. The rule set is snapshotted once per pass; each record is
    /// claimed atomically, so concurrent passes never double-book.
    pub async fn run_matching_pass(
        &self,
        range: Option<DateRange>,
        limit: i64,
        cancel: &CancelFlag,
    ) -> Result<PassReport, ServiceError> {
        let rule_set = self.load_rule_set().await?;
        let transactions = storage::unmatched_transactions(&self.pool, range, limit).await?;
        let mut report = PassReport::default();

        for tx in transactions {
            if cancel.is_cancelled() {
                tracing::info!("Matching pass cancelled after {} records", report.processed);
                break;
            }
            report.processed += 1;

            if !storage::claim_transaction(&self.pool, tx.id).await? {
                report.skipped_claimed += 1;
                continue;
            }

            if let Err(e) = self.match_one(&tx, &rule_set, &mut report).await {
                // Give the record back so the next pass retries it.
                storage::set_transaction_state(&self.pool, tx.id, MatchState::Unmatched).await?;
                tracing::warn!("Matching transaction {} failed: {e}", tx.id);
                report.failed.push((tx.id, e.to_string()));
            }
        }

        if report.ambiguous > 0 {
            tracing::info!("{} ambiguous matches pending manual resolution", report.ambiguous);
        }
        Ok(report)
    }

    async fn match_one(
        &self,
        tx: &TransactionRecord,
        rule_set: &RuleSet,
        report: &mut PassReport,
    ) -> Result<(), ServiceError> {
        let input = MatchInput {
            source: tx.source,
            amount: Money::from_cents(tx.amount_cents),
            posted_date: tx.posted_date,
            counterparty: tx.counterparty.clone(),
            memo: tx.memo.clone(),
        };
        let mapping = storage::get_creditor_mapping(&self.pool, &tx.counterparty).await?;

        let config = self.engine.config();
        let found = storage::search_invoices(
            &self.pool,
            &InvoiceSearch {
                amount_cents: Some(tx.amount_cents),
                amount_tolerance_cents: config.amount_tolerance_cents,
                date_range: Some(config.date_window.around(tx.posted_date)),
                exclude_paid: true,
                ..Default::default()
            },
        )
        .await?;
        let found = storage::dedupe_invoices(found);
        let candidates: Vec<CandidateInvoice> = found.iter().map(candidate_from_record).collect();

        let outcome = self.engine.decide(
            &input,
            mapping.as_deref(),
            rule_set,
            &self.policy,
            &candidates,
        );

        match outcome {
            Outcome::Matched {
                kind,
                invoice_id,
                account_code,
                rule_id,
                score,
            } => {
                let paid_in_full = invoice_id
                    .and_then(|id| found.iter().find(|inv| inv.id == id))
                    .map(|inv| {
                        self.engine
                            .settles_in_full(input.amount, Money::from_cents(inv.gross_cents))
                    })
                    .unwrap_or(false);
                let (state, decision) = match kind {
                    MatchKind::Heuristic => (MatchState::HeuristicMatched, Decision::AutoHeuristic),
                    MatchKind::Mapping | MatchKind::Rule => {
                        (MatchState::RuleMatched, Decision::AutoRule)
                    }
                };
                storage::apply_match(
                    &self.pool,
                    tx.id,
                    &MatchApplication {
                        state,
                        invoice_id,
                        account_code,
                        rule_id,
                        decision,
                        score,
                        paid_in_full,
                    },
                )
                .await?;
                if let Some(rule_id) = rule_id {
                    storage::record_rule_application(&self.pool, rule_id, tx.posted_date).await?;
                }
                report.matched += 1;
            }
            Outcome::Ambiguous {
                invoice_ids,
                best_score,
            } => {
                storage::set_transaction_state(&self.pool, tx.id, MatchState::Ambiguous).await?;
                tracing::info!(
                    "Transaction {} ambiguous between {:?} (best score {best_score:.2})",
                    tx.id,
                    invoice_ids
                );
                report.ambiguous += 1;
            }
            Outcome::Excluded { category } => {
                storage::set_transaction_state(&self.pool, tx.id, MatchState::Excluded).await?;
                tracing::warn!(
                    "Transaction {} excluded: counterparty '{}' is restricted ({category})",
                    tx.id,
                    tx.counterparty
                );
                report.excluded += 1;
            }
            Outcome::NoMatch => {
                storage::set_transaction_state(&self.pool, tx.id, MatchState::Unmatched).await?;
                report.unmatched += 1;
            }
        }
        Ok(())
    }

    // ── Manual overrides ──────────────────────────────────────────────────

    /// Confirms a match: either an explicit invoice for an ambiguous or
    /// excluded case, or the transaction's current automatic link. The
    /// rule behind the original match is reinforced.
    pub async fn confirm_match(
        &self,
        transaction_id: i64,
        invoice_id: Option<i64>,
    ) -> Result<(), ServiceError> {
        let tx = storage::get_transaction(&self.pool, transaction_id)
            .await?
            .ok_or(DomainError::TransactionNotFound(transaction_id))?;
        let invoice_id = invoice_id.or(tx.invoice_id);
        if invoice_id.is_none() && tx.account_code.is_none() {
            return Err(DomainError::NothingToConfirm(transaction_id).into());
        }

        let paid_in_full = match invoice_id {
            Some(id) => {
                let invoice = storage::get_invoice(&self.pool, id)
                    .await?
                    .ok_or(DomainError::InvoiceNotFound(id))?;
                self.engine.settles_in_full(
                    Money::from_cents(tx.amount_cents),
                    Money::from_cents(invoice.gross_cents),
                )
            }
            None => false,
        };

        let producing_rule = self.producing_rule(transaction_id).await?;
        storage::apply_match(
            &self.pool,
            transaction_id,
            &MatchApplication {
                state: MatchState::Confirmed,
                invoice_id,
                account_code: tx.account_code,
                rule_id: producing_rule,
                decision: Decision::Manual,
                score: 1.0,
                paid_in_full,
            },
        )
        .await?;

        if let Some(rule_id) = producing_rule {
            self.adjust_confidence(rule_id, learning::reinforce).await?;
        }
        Ok(())
    }

    /// Reverses a match: clears the link, restores the invoice status,
    /// appends a rejected history entry and decays the rule that
    /// produced the match.
    pub async fn reverse_match(&self, transaction_id: i64) -> Result<(), ServiceError> {
        let rule_id = storage::reverse_match(&self.pool, transaction_id).await?;
        if let Some(rule_id) = rule_id {
            self.adjust_confidence(rule_id, learning::weaken).await?;
        }
        Ok(())
    }

    async fn producing_rule(&self, transaction_id: i64) -> Result<Option<i64>, ServiceError> {
        let history = storage::history_for_transaction(&self.pool, transaction_id).await?;
        Ok(history
            .iter()
            .rev()
            .find(|h| h.decision != Decision::Rejected)
            .and_then(|h| h.rule_id))
    }

    async fn adjust_confidence(
        &self,
        rule_id: i64,
        adjust: fn(f32) -> f32,
    ) -> Result<(), ServiceError> {
        let rules = storage::get_rules(&self.pool).await?;
        if let Some(rule) = rules.iter().find(|r| r.id == rule_id) {
            let updated = adjust(rule.confidence as f32);
            storage::update_rule_confidence(&self.pool, rule_id, updated as f64).await?;
        }
        Ok(())
    }

    // ── Learning ──────────────────────────────────────────────────────────

    /// Seeds the baseline rule set; safe to call repeatedly.
    pub async fn import_default_rules(&self) -> Result<u64, ServiceError> {
        self.import_rules(rules::DEFAULT_RULES).await
    }

    pub async fn import_rules(&self, toml_content: &str) -> Result<u64, ServiceError> {
        let parsed = rules::rules_from_toml(toml_content).map_err(ServiceError::Rules)?;
        let mut inserted = 0;
        for rule in parsed {
            if let InsertOutcome::Inserted(_) =
                storage::insert_rule(&self.pool, &rule_to_row(&rule)).await?
            {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Finds manually confirmed matches with no covering rule and
    /// synthesizes conservative new rules from their counterparties.
    pub async fn promote_from_history(&self) -> Result<u64, ServiceError> {
        // Floor 0.0: a demoted rule still covers its pattern, promotion
        // must not duplicate it.
        let all_rules = RuleSet::new(self.rules_from_store().await?, 0.0);
        let decisions = storage::manual_decisions(&self.pool).await?;
        let mut promoted = 0;

        for decision in decisions {
            if all_rules
                .find_match(decision.source, &decision.counterparty)
                .is_some()
            {
                continue;
            }
            let target = match (&decision.invoice_origin, &decision.account_code) {
                (Some(origin), _) => RuleTarget::Origin(*origin),
                (None, Some(account)) => RuleTarget::Account(account.clone()),
                (None, None) => continue,
            };
            let rule = learning::synthesize_rule(&decision.counterparty, target);
            if let InsertOutcome::Inserted(_) =
                storage::insert_rule(&self.pool, &rule_to_row(&rule)).await?
            {
                tracing::info!(
                    "Promoted rule '{}' from transaction {}",
                    rule.pattern,
                    decision.transaction_id
                );
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Recomputes one rule's confidence from its decision history with
    /// recency weighting. Returns the new confidence, or `None` when the
    /// rule has no history yet.
    pub async fn recompute_confidence(&self, rule_id: i64) -> Result<Option<f64>, ServiceError> {
        let history = storage::history_for_rule(&self.pool, rule_id).await?;
        let today = Utc::now().date_naive();
        let observations: Vec<learning::Observation> = history
            .iter()
            .map(|h| learning::Observation {
                decision: h.decision,
                age_days: h
                    .created_at
                    .split_whitespace()
                    .next()
                    .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .map(|d| (today - d).num_days())
                    .unwrap_or(0),
            })
            .collect();

        match learning::recompute_confidence(&observations, learning::DEFAULT_HALF_LIFE_DAYS) {
            Some(confidence) => {
                storage::update_rule_confidence(&self.pool, rule_id, confidence as f64).await?;
                Ok(Some(confidence as f64))
            }
            None => Ok(None),
        }
    }

    async fn load_rule_set(&self) -> Result<RuleSet, ServiceError> {
        Ok(RuleSet::new(
            self.rules_from_store().await?,
            self.engine.config().confidence_floor,
        ))
    }

    async fn rules_from_store(&self) -> Result<Vec<MatchingRule>, ServiceError> {
        let records = storage::get_rules(&self.pool).await?;
        Ok(records.iter().filter_map(rule_from_record).collect())
    }

    // ── Invoices and mappings ──────────────────────────────────────────────

    pub async fn upsert_invoice(&self, row: &NewInvoiceRow) -> Result<InsertOutcome, ServiceError> {
        Ok(storage::upsert_invoice(&self.pool, row).await?)
    }

    pub async fn list_unresolved_invoices(
        &self,
        origin: Option<InvoiceOrigin>,
        range: Option<DateRange>,
        cursor: Option<i64>,
        limit: i64,
    ) -> Result<Vec<InvoiceRecord>, ServiceError> {
        Ok(storage::list_unresolved_invoices(&self.pool, origin, range, cursor, limit).await?)
    }

    pub async fn upsert_creditor_mapping(
        &self,
        counterparty: &str,
        account_code: &str,
    ) -> Result<(), ServiceError> {
        storage::get_account_by_code(&self.pool, account_code)
            .await?
            .ok_or_else(|| DomainError::AccountNotFound(account_code.to_string()))?;
        Ok(storage::upsert_creditor_mapping(&self.pool, counterparty, account_code).await?)
    }

    // ── Export ────────────────────────────────────────────────────────────

    /// Double-entry rows for all matched and confirmed transactions in
    /// the range.
    pub async fn export_bookings(&self, range: DateRange) -> Result<Vec<BookingRow>, ServiceError> {
        let transactions = storage::exportable_transactions(&self.pool, range).await?;
        let mut rows = Vec::new();

        for tx in transactions {
            let invoice = match tx.invoice_id {
                Some(id) => storage::get_invoice(&self.pool, id).await?,
                None => None,
            };
            let Some(booking) = self.booking_for(&tx, invoice.as_ref()).await? else {
                tracing::warn!("Transaction {} has no bookable account, skipped in export", tx.id);
                continue;
            };
            rows.extend(booking_rows(&booking));
        }
        Ok(rows)
    }

    /// The export file: semicolon-delimited, decimal comma, d.m.Y, BOM.
    pub async fn export_csv(&self, range: DateRange) -> Result<String, ServiceError> {
        let rows = self.export_bookings(range).await?;
        Ok(fibu_export::export_to_string(&rows)?)
    }

    async fn booking_for(
        &self,
        tx: &TransactionRecord,
        invoice: Option<&InvoiceRecord>,
    ) -> Result<Option<MatchedBooking>, ServiceError> {
        let account_code = invoice
            .and_then(|i| i.account_code.clone())
            .or_else(|| tx.account_code.clone());
        let Some(account_code) = account_code else {
            return Ok(None);
        };
        let account_label = storage::get_account_by_code(&self.pool, &account_code)
            .await?
            .map(|a| a.name)
            .unwrap_or_default();

        let side = match invoice {
            Some(i) if i.origin == InvoiceOrigin::Purchase => BookingSide::Purchase,
            Some(_) => BookingSide::Sales,
            None if tx.amount_cents < 0 => BookingSide::Purchase,
            None => BookingSide::Sales,
        };

        Ok(Some(MatchedBooking {
            posted_date: tx.posted_date,
            amount: Money::from_cents(tx.amount_cents),
            document_number: invoice
                .map(|i| i.invoice_number.clone())
                .unwrap_or_else(|| tx.external_id.clone()),
            memo: match &tx.memo {
                Some(memo) => format!("{} {}", tx.counterparty, memo),
                None => tx.counterparty.clone(),
            },
            account_code,
            account_label,
            bank_account: bank_account_for(tx.source).to_string(),
            side,
            vat_rate: invoice.map(|i| i.vat_rate),
            tax: invoice.map(|i| Money::from_cents((i.gross_cents - i.net_cents).abs())),
        }))
    }
}

/// The money account a settlement moved over, from the seeded chart.
fn bank_account_for(source: TransactionSource) -> &'static str {
    match source {
        TransactionSource::Bank => "1200",
        TransactionSource::MarketplaceSettlement => "1220",
        TransactionSource::PaymentProcessor => "1360",
    }
}

fn candidate_from_record(record: &InvoiceRecord) -> CandidateInvoice {
    CandidateInvoice {
        id: record.id,
        invoice_number: record.invoice_number.clone(),
        order_reference: record.order_reference.clone(),
        gross_cents: record.gross_cents,
        issue_date: record.issue_date,
        counterparty: record.counterparty.clone(),
        origin: record.origin,
    }
}

fn rule_to_row(rule: &MatchingRule) -> NewRuleRow {
    let (target_account, target_origin) = match &rule.target {
        RuleTarget::Account(code) => (Some(code.clone()), None),
        RuleTarget::Origin(origin) => (None, Some(origin.to_string())),
    };
    NewRuleRow {
        pattern: rule.pattern.clone(),
        kind: rule.kind.to_string(),
        source_scope: rule.source_scope.map(|s| s.to_string()),
        target_account,
        target_origin,
        confidence: rule.confidence as f64,
    }
}

fn rule_from_record(record: &RuleRecord) -> Option<MatchingRule> {
    let target = match (&record.target_account, &record.target_origin) {
        (Some(code), None) => RuleTarget::Account(code.clone()),
        (None, Some(origin)) => RuleTarget::Origin(origin.parse().ok()?),
        _ => {
            tracing::warn!("Rule {} has no usable target, ignored", record.id);
            return None;
        }
    };
    Some(MatchingRule {
        id: Some(record.id),
        pattern: record.pattern.clone(),
        kind: record.kind.parse().unwrap_or(TriggerKind::Contains),
        source_scope: record.source_scope.as_deref().and_then(|s| s.parse().ok()),
        target,
        confidence: record.confidence as f32,
        hit_count: record.hit_count,
        last_applied: record.last_applied,
    })
}
