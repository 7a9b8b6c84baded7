use chrono::NaiveDate;
use fibu_core::{
    Account, AccountId, AccountType, DateRange, Decision, DomainError, InvoiceOrigin, MatchState,
    PaymentStatus, TransactionSource, DEFAULT_ACCOUNTS,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

pub type DbPool = Pool<Sqlite>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// In-memory database with the full schema, for tests.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            account_type TEXT NOT NULL,
            document_required INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invoices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            origin TEXT NOT NULL,
            invoice_number TEXT NOT NULL,
            order_reference TEXT,
            gross_cents INTEGER NOT NULL,
            net_cents INTEGER NOT NULL,
            vat_rate REAL NOT NULL DEFAULT 0,
            issue_date TEXT NOT NULL,
            counterparty TEXT NOT NULL,
            account_code TEXT,
            payment_status TEXT NOT NULL DEFAULT 'open',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(origin, counterparty, invoice_number, gross_cents, issue_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'EUR',
            posted_date TEXT NOT NULL,
            counterparty TEXT NOT NULL,
            memo TEXT,
            raw_payload TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'unmatched',
            invoice_id INTEGER REFERENCES invoices(id),
            account_code TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matching_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pattern TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'contains',
            source_scope TEXT,
            target_account TEXT,
            target_origin TEXT,
            confidence REAL NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0,
            last_applied TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // NULL source scopes must still collide, hence the expression index.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_trigger
        ON matching_rules(pattern, kind, COALESCE(source_scope, ''))
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matching_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id INTEGER NOT NULL REFERENCES transactions(id),
            invoice_id INTEGER REFERENCES invoices(id),
            rule_id INTEGER REFERENCES matching_rules(id),
            decision TEXT NOT NULL,
            score REAL NOT NULL DEFAULT 0,
            previous_status TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS creditor_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            counterparty TEXT NOT NULL UNIQUE,
            account_code TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ── Accounts ──────────────────────────────────────────────────────────────────

pub async fn seed_default_accounts(pool: &DbPool) -> Result<(), sqlx::Error> {
    for (code, name, account_type, document_required) in DEFAULT_ACCOUNTS {
        sqlx::query(
            "INSERT OR IGNORE INTO accounts (code, name, account_type, document_required) VALUES (?, ?, ?, ?)",
        )
        .bind(code)
        .bind(name)
        .bind(account_type.to_string())
        .bind(*document_required as i64)
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn decode_account(r: (i64, String, String, String, i64)) -> Account {
    Account {
        id: Some(AccountId(r.0)),
        code: r.1,
        name: r.2,
        account_type: r.3.parse().unwrap_or(AccountType::Expense),
        document_required: r.4 != 0,
    }
}

pub async fn get_all_accounts(pool: &DbPool) -> Result<Vec<Account>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, String, String, String, i64)>(
        "SELECT id, code, name, account_type, document_required FROM accounts ORDER BY code",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_account).collect())
}

pub async fn get_account_by_code(
    pool: &DbPool,
    code: &str,
) -> Result<Option<Account>, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64, String, String, String, i64)>(
        "SELECT id, code, name, account_type, document_required FROM accounts WHERE code = ?",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(decode_account))
}

// ── Transactions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct NewTransactionRow {
    pub source: TransactionSource,
    pub external_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub posted_date: NaiveDate,
    pub counterparty: String,
    pub memo: Option<String>,
    pub raw_payload: String,
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: i64,
    pub source: TransactionSource,
    pub external_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub posted_date: NaiveDate,
    pub counterparty: String,
    pub memo: Option<String>,
    pub state: MatchState,
    pub invoice_id: Option<i64>,
    pub account_code: Option<String>,
}

type TransactionRow = (
    i64,
    String,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<i64>,
    Option<String>,
);

const TRANSACTION_COLUMNS: &str = "id, source, external_id, amount_cents, currency, posted_date, counterparty, memo, state, invoice_id, account_code";

fn decode_transaction(r: TransactionRow) -> TransactionRecord {
    TransactionRecord {
        id: r.0,
        source: r.1.parse().unwrap_or(TransactionSource::Bank),
        external_id: r.2,
        amount_cents: r.3,
        currency: r.4,
        posted_date: NaiveDate::parse_from_str(&r.5, "%Y-%m-%d").unwrap_or_default(),
        counterparty: r.6,
        memo: r.7,
        state: r.8.parse().unwrap_or(MatchState::Unmatched),
        invoice_id: r.9,
        account_code: r.10,
    }
}

/// Idempotent insert keyed on (source, external id); re-ingesting the
/// same event is reported as a duplicate, never re-inserted.
pub async fn insert_transaction(
    pool: &DbPool,
    row: &NewTransactionRow,
) -> Result<InsertOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO transactions
            (source, external_id, amount_cents, currency, posted_date, counterparty, memo, raw_payload)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.source.to_string())
    .bind(&row.external_id)
    .bind(row.amount_cents)
    .bind(&row.currency)
    .bind(row.posted_date.to_string())
    .bind(&row.counterparty)
    .bind(&row.memo)
    .bind(&row.raw_payload)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        Ok(InsertOutcome::Duplicate)
    } else {
        Ok(InsertOutcome::Inserted(result.last_insert_rowid()))
    }
}

pub async fn get_transaction(
    pool: &DbPool,
    id: i64,
) -> Result<Option<TransactionRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(decode_transaction))
}

pub async fn unmatched_transactions(
    pool: &DbPool,
    range: Option<DateRange>,
    limit: i64,
) -> Result<Vec<TransactionRecord>, sqlx::Error> {
    let (start, end) = match range {
        Some(r) => (Some(r.start.to_string()), Some(r.end.to_string())),
        None => (None, None),
    };
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions
        WHERE state = 'unmatched'
          AND (?1 IS NULL OR posted_date >= ?1)
          AND (?2 IS NULL OR posted_date <= ?2)
        ORDER BY id
        LIMIT ?3
        "#
    ))
    .bind(start)
    .bind(end)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_transaction).collect())
}

/// Transactions an export run picks up: matched or confirmed, within
/// the date range.
pub async fn exportable_transactions(
    pool: &DbPool,
    range: DateRange,
) -> Result<Vec<TransactionRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions
        WHERE state IN ('rule_matched', 'heuristic_matched', 'confirmed')
          AND posted_date >= ?1 AND posted_date <= ?2
        ORDER BY posted_date, id
        "#
    ))
    .bind(range.start.to_string())
    .bind(range.end.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_transaction).collect())
}

/// Atomic claim: only one pass may move a transaction out of
/// `unmatched`. A `false` return means someone else holds it, which is
/// expected, not an error.
pub async fn claim_transaction(pool: &DbPool, id: i64) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE transactions SET state = 'in_progress' WHERE id = ? AND state = 'unmatched'")
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_transaction_state(
    pool: &DbPool,
    id: i64,
    state: MatchState,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE transactions SET state = ? WHERE id = ?")
        .bind(state.to_string())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Match application / reversal ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MatchApplication {
    pub state: MatchState,
    pub invoice_id: Option<i64>,
    pub account_code: Option<String>,
    pub rule_id: Option<i64>,
    pub decision: Decision,
    pub score: f32,
    /// Whether the payment settles the invoice completely.
    pub paid_in_full: bool,
}

/// Applies a match decision: transaction state, invoice payment status
/// and the history append commit together or not at all.
pub async fn apply_match(
    pool: &DbPool,
    transaction_id: i64,
    application: &MatchApplication,
) -> Result<(), StorageError> {
    let mut txn = pool.begin().await?;

    let previous_status = match application.invoice_id {
        Some(invoice_id) => {
            let status: Option<(String,)> =
                sqlx::query_as("SELECT payment_status FROM invoices WHERE id = ?")
                    .bind(invoice_id)
                    .fetch_optional(&mut *txn)
                    .await?;
            let (previous,) =
                status.ok_or(DomainError::InvoiceNotFound(invoice_id))?;

            let new_status = if application.paid_in_full {
                PaymentStatus::Paid
            } else {
                PaymentStatus::PartiallyPaid
            };
            sqlx::query("UPDATE invoices SET payment_status = ? WHERE id = ?")
                .bind(new_status.to_string())
                .bind(invoice_id)
                .execute(&mut *txn)
                .await?;
            Some(previous)
        }
        None => None,
    };

    sqlx::query("UPDATE transactions SET state = ?, invoice_id = ?, account_code = ? WHERE id = ?")
        .bind(application.state.to_string())
        .bind(application.invoice_id)
        .bind(&application.account_code)
        .bind(transaction_id)
        .execute(&mut *txn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO matching_history
            (transaction_id, invoice_id, rule_id, decision, score, previous_status)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(transaction_id)
    .bind(application.invoice_id)
    .bind(application.rule_id)
    .bind(application.decision.to_string())
    .bind(application.score as f64)
    .bind(previous_status)
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;
    Ok(())
}

/// Reverses a match: clears the link, restores the invoice's pre-match
/// payment status and appends one `rejected` history entry. Returns the
/// rule that produced the original match, if any, so the caller can
/// decay its confidence.
pub async fn reverse_match(
    pool: &DbPool,
    transaction_id: i64,
) -> Result<Option<i64>, StorageError> {
    let mut txn = pool.begin().await?;

    let tx: Option<(String, Option<i64>)> =
        sqlx::query_as("SELECT state, invoice_id FROM transactions WHERE id = ?")
            .bind(transaction_id)
            .fetch_optional(&mut *txn)
            .await?;
    let (state, invoice_id) = tx.ok_or(DomainError::TransactionNotFound(transaction_id))?;
    let state: MatchState = state.parse().unwrap_or(MatchState::Unmatched);
    if !state.is_matched() {
        return Err(DomainError::NotMatched(transaction_id).into());
    }

    // The oldest entry of the current match episode carries the
    // pre-match payment status and the rule that produced the match; a
    // later confirmation only re-records the already-updated status.
    let (last_rejected,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(id), 0) FROM matching_history WHERE transaction_id = ? AND decision = 'rejected'",
    )
    .bind(transaction_id)
    .fetch_one(&mut *txn)
    .await?;
    let original: Option<(Option<i64>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT rule_id, previous_status FROM matching_history
        WHERE transaction_id = ? AND id > ?
        ORDER BY id LIMIT 1
        "#,
    )
    .bind(transaction_id)
    .bind(last_rejected)
    .fetch_optional(&mut *txn)
    .await?;
    let (rule_id, previous_status) = original.unwrap_or((None, None));

    if let Some(invoice_id) = invoice_id {
        let restored = previous_status.unwrap_or_else(|| PaymentStatus::Open.to_string());
        sqlx::query("UPDATE invoices SET payment_status = ? WHERE id = ?")
            .bind(restored)
            .bind(invoice_id)
            .execute(&mut *txn)
            .await?;
    }

    sqlx::query(
        "UPDATE transactions SET state = 'unmatched', invoice_id = NULL, account_code = NULL WHERE id = ?",
    )
    .bind(transaction_id)
    .execute(&mut *txn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO matching_history (transaction_id, invoice_id, rule_id, decision, score)
        VALUES (?, ?, ?, 'rejected', 0)
        "#,
    )
    .bind(transaction_id)
    .bind(invoice_id)
    .bind(rule_id)
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;
    Ok(rule_id)
}

// ── Invoices ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewInvoiceRow {
    pub origin: InvoiceOrigin,
    pub invoice_number: String,
    pub order_reference: Option<String>,
    pub gross_cents: i64,
    pub net_cents: i64,
    pub vat_rate: f64,
    pub issue_date: NaiveDate,
    pub counterparty: String,
    pub account_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvoiceRecord {
    pub id: i64,
    pub origin: InvoiceOrigin,
    pub invoice_number: String,
    pub order_reference: Option<String>,
    pub gross_cents: i64,
    pub net_cents: i64,
    pub vat_rate: f64,
    pub issue_date: NaiveDate,
    pub counterparty: String,
    pub account_code: Option<String>,
    pub payment_status: PaymentStatus,
}

type InvoiceRow = (
    i64,
    String,
    String,
    Option<String>,
    i64,
    i64,
    f64,
    String,
    String,
    Option<String>,
    String,
);

const INVOICE_COLUMNS: &str = "id, origin, invoice_number, order_reference, gross_cents, net_cents, vat_rate, issue_date, counterparty, account_code, payment_status";

fn decode_invoice(r: InvoiceRow) -> InvoiceRecord {
    InvoiceRecord {
        id: r.0,
        origin: r.1.parse().unwrap_or(InvoiceOrigin::Sales),
        invoice_number: r.2,
        order_reference: r.3,
        gross_cents: r.4,
        net_cents: r.5,
        vat_rate: r.6,
        issue_date: NaiveDate::parse_from_str(&r.7, "%Y-%m-%d").unwrap_or_default(),
        counterparty: r.8,
        account_code: r.9,
        payment_status: r.10.parse().unwrap_or(PaymentStatus::Open),
    }
}

/// Inserts unless an invoice with the same dedup key already exists in
/// this origin population (first-seen wins).
pub async fn upsert_invoice(
    pool: &DbPool,
    row: &NewInvoiceRow,
) -> Result<InsertOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO invoices
            (origin, invoice_number, order_reference, gross_cents, net_cents, vat_rate, issue_date, counterparty, account_code)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.origin.to_string())
    .bind(&row.invoice_number)
    .bind(&row.order_reference)
    .bind(row.gross_cents)
    .bind(row.net_cents)
    .bind(row.vat_rate)
    .bind(row.issue_date.to_string())
    .bind(&row.counterparty)
    .bind(&row.account_code)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        Ok(InsertOutcome::Duplicate)
    } else {
        Ok(InsertOutcome::Inserted(result.last_insert_rowid()))
    }
}

pub async fn get_invoice(pool: &DbPool, id: i64) -> Result<Option<InvoiceRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, InvoiceRow>(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(decode_invoice))
}

/// Invoice search filter. Every field is optional; amount tolerance and
/// the date window are first-class because the matcher always searches
/// "target amount ± tolerance, pivot date − before … + after".
#[derive(Debug, Clone, Default)]
pub struct InvoiceSearch {
    pub amount_cents: Option<i64>,
    pub amount_tolerance_cents: i64,
    pub date_range: Option<DateRange>,
    pub counterparty: Option<String>,
    pub order_reference: Option<String>,
    pub origin: Option<InvoiceOrigin>,
    pub exclude_paid: bool,
}

/// Most relevant first: smallest amount difference, then lowest id for
/// a stable order.
pub async fn search_invoices(
    pool: &DbPool,
    filter: &InvoiceSearch,
) -> Result<Vec<InvoiceRecord>, sqlx::Error> {
    let (start, end) = match filter.date_range {
        Some(r) => (Some(r.start.to_string()), Some(r.end.to_string())),
        None => (None, None),
    };
    let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
        r#"
        SELECT {INVOICE_COLUMNS} FROM invoices
        WHERE (?1 IS NULL OR ABS(ABS(gross_cents) - ABS(?1)) <= ?2)
          AND (?3 IS NULL OR issue_date >= ?3)
          AND (?4 IS NULL OR issue_date <= ?4)
          AND (?5 IS NULL OR instr(lower(counterparty), lower(?5)) > 0)
          AND (?6 IS NULL OR order_reference = ?6)
          AND (?7 IS NULL OR origin = ?7)
          AND (?8 = 0 OR payment_status != 'paid')
        ORDER BY
          CASE WHEN ?1 IS NULL THEN 0 ELSE ABS(ABS(gross_cents) - ABS(?1)) END,
          id
        "#
    ))
    .bind(filter.amount_cents)
    .bind(filter.amount_tolerance_cents)
    .bind(start)
    .bind(end)
    .bind(&filter.counterparty)
    .bind(&filter.order_reference)
    .bind(filter.origin.map(|o| o.to_string()))
    .bind(filter.exclude_paid as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_invoice).collect())
}

/// Collapses invoices sharing the dedup key across origin populations,
/// keeping the first-seen (lowest id). The per-origin unique index
/// already prevents duplicates inside one population; this handles
/// overlapping import jobs feeding different populations.
pub fn dedupe_invoices(mut invoices: Vec<InvoiceRecord>) -> Vec<InvoiceRecord> {
    use std::collections::HashSet;
    invoices.sort_by_key(|i| i.id);
    let mut seen = HashSet::new();
    invoices.retain(|inv| {
        seen.insert((
            inv.counterparty.to_lowercase(),
            inv.invoice_number.clone(),
            inv.gross_cents,
            inv.issue_date,
        ))
    });
    invoices
}

/// Invoices needing manual attention: no account reference yet, or a
/// non-positive amount. Cursor-paged by last-seen id so a resumed run
/// is unaffected by concurrent inserts.
pub async fn list_unresolved_invoices(
    pool: &DbPool,
    origin: Option<InvoiceOrigin>,
    range: Option<DateRange>,
    cursor: Option<i64>,
    limit: i64,
) -> Result<Vec<InvoiceRecord>, sqlx::Error> {
    let (start, end) = match range {
        Some(r) => (Some(r.start.to_string()), Some(r.end.to_string())),
        None => (None, None),
    };
    let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
        r#"
        SELECT {INVOICE_COLUMNS} FROM invoices
        WHERE (account_code IS NULL OR gross_cents <= 0)
          AND (?1 IS NULL OR origin = ?1)
          AND (?2 IS NULL OR issue_date >= ?2)
          AND (?3 IS NULL OR issue_date <= ?3)
          AND id > ?4
        ORDER BY id
        LIMIT ?5
        "#
    ))
    .bind(origin.map(|o| o.to_string()))
    .bind(start)
    .bind(end)
    .bind(cursor.unwrap_or(0))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_invoice).collect())
}

pub async fn set_invoice_account(
    pool: &DbPool,
    id: i64,
    account_code: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE invoices SET account_code = ? WHERE id = ?")
        .bind(account_code)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Matching rules ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewRuleRow {
    pub pattern: String,
    pub kind: String,
    pub source_scope: Option<String>,
    pub target_account: Option<String>,
    pub target_origin: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct RuleRecord {
    pub id: i64,
    pub pattern: String,
    pub kind: String,
    pub source_scope: Option<String>,
    pub target_account: Option<String>,
    pub target_origin: Option<String>,
    pub confidence: f64,
    pub hit_count: i64,
    pub last_applied: Option<NaiveDate>,
}

pub async fn get_rules(pool: &DbPool) -> Result<Vec<RuleRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<
        _,
        (
            i64,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            f64,
            i64,
            Option<String>,
        ),
    >(
        r#"
        SELECT id, pattern, kind, source_scope, target_account, target_origin, confidence, hit_count, last_applied
        FROM matching_rules ORDER BY confidence DESC, id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| RuleRecord {
            id: r.0,
            pattern: r.1,
            kind: r.2,
            source_scope: r.3,
            target_account: r.4,
            target_origin: r.5,
            confidence: r.6,
            hit_count: r.7,
            last_applied: r
                .8
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        })
        .collect())
}

/// Idempotent on the trigger pattern: re-seeding an existing rule is a
/// no-op and keeps its learned confidence.
pub async fn insert_rule(pool: &DbPool, row: &NewRuleRow) -> Result<InsertOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO matching_rules
            (pattern, kind, source_scope, target_account, target_origin, confidence)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.pattern)
    .bind(&row.kind)
    .bind(&row.source_scope)
    .bind(&row.target_account)
    .bind(&row.target_origin)
    .bind(row.confidence)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        Ok(InsertOutcome::Duplicate)
    } else {
        Ok(InsertOutcome::Inserted(result.last_insert_rowid()))
    }
}

pub async fn update_rule_confidence(
    pool: &DbPool,
    id: i64,
    confidence: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE matching_rules SET confidence = ? WHERE id = ?")
        .bind(confidence.clamp(0.0, 1.0))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_rule_application(
    pool: &DbPool,
    id: i64,
    on: NaiveDate,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE matching_rules SET hit_count = hit_count + 1, last_applied = ? WHERE id = ?")
        .bind(on.to_string())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Matching history ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub id: i64,
    pub transaction_id: i64,
    pub invoice_id: Option<i64>,
    pub rule_id: Option<i64>,
    pub decision: Decision,
    pub score: f64,
    pub previous_status: Option<String>,
    pub created_at: String,
}

type HistoryRow = (
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    String,
    f64,
    Option<String>,
    String,
);

fn decode_history(r: HistoryRow) -> HistoryRecord {
    HistoryRecord {
        id: r.0,
        transaction_id: r.1,
        invoice_id: r.2,
        rule_id: r.3,
        decision: r.4.parse().unwrap_or(Decision::Manual),
        score: r.5,
        previous_status: r.6,
        created_at: r.7,
    }
}

pub async fn history_for_transaction(
    pool: &DbPool,
    transaction_id: i64,
) -> Result<Vec<HistoryRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT id, transaction_id, invoice_id, rule_id, decision, score, previous_status, created_at
        FROM matching_history WHERE transaction_id = ? ORDER BY id
        "#,
    )
    .bind(transaction_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_history).collect())
}

pub async fn history_for_rule(
    pool: &DbPool,
    rule_id: i64,
) -> Result<Vec<HistoryRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT id, transaction_id, invoice_id, rule_id, decision, score, previous_status, created_at
        FROM matching_history WHERE rule_id = ? ORDER BY id
        "#,
    )
    .bind(rule_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(decode_history).collect())
}

/// A manually confirmed decision joined with its transaction, the input
/// for rule promotion.
#[derive(Debug, Clone)]
pub struct ManualDecisionRow {
    pub transaction_id: i64,
    pub source: TransactionSource,
    pub counterparty: String,
    pub account_code: Option<String>,
    pub invoice_origin: Option<InvoiceOrigin>,
}

pub async fn manual_decisions(pool: &DbPool) -> Result<Vec<ManualDecisionRow>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, Option<String>)>(
        r#"
        SELECT h.transaction_id, t.source, t.counterparty, t.account_code, i.origin
        FROM matching_history h
        JOIN transactions t ON t.id = h.transaction_id
        LEFT JOIN invoices i ON i.id = h.invoice_id
        WHERE h.decision = 'manual'
        ORDER BY h.id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ManualDecisionRow {
            transaction_id: r.0,
            source: r.1.parse().unwrap_or(TransactionSource::Bank),
            counterparty: r.2,
            account_code: r.3,
            invoice_origin: r.4.and_then(|o| o.parse().ok()),
        })
        .collect())
}

// ── Creditor mappings ─────────────────────────────────────────────────────────

/// Upsert keyed on the normalized counterparty name; at most one active
/// mapping per name.
pub async fn upsert_creditor_mapping(
    pool: &DbPool,
    counterparty: &str,
    account_code: &str,
) -> Result<(), sqlx::Error> {
    let normalized = fibu_core::normalize_counterparty(counterparty);
    sqlx::query(
        r#"
        INSERT INTO creditor_mappings (counterparty, account_code) VALUES (?, ?)
        ON CONFLICT(counterparty) DO UPDATE SET account_code = excluded.account_code
        "#,
    )
    .bind(normalized)
    .bind(account_code)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_creditor_mapping(
    pool: &DbPool,
    counterparty: &str,
) -> Result<Option<String>, sqlx::Error> {
    let normalized = fibu_core::normalize_counterparty(counterparty);
    let row: Option<(String,)> =
        sqlx::query_as("SELECT account_code FROM creditor_mappings WHERE counterparty = ?")
            .bind(normalized)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| r.0))
}

pub async fn list_creditor_mappings(
    pool: &DbPool,
) -> Result<Vec<(String, String)>, sqlx::Error> {
    sqlx::query_as("SELECT counterparty, account_code FROM creditor_mappings ORDER BY counterparty")
        .fetch_all(pool)
        .await
}
