use chrono::NaiveDate;
use fibu_core::{Money, TransactionSource};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

/// One raw provider event, shape-opaque until normalization.
pub type RawEvent = Value;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid date: {0}")]
    InvalidDate(String),
    #[error("Feed call timed out")]
    Timeout,
    #[error("Feed aborted after {attempts} attempts: {last_error}")]
    Aborted { attempts: u32, last_error: String },
    #[error("Feed cancelled")]
    Cancelled,
}

/// Canonical transaction shape every feed normalizes into.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub source: TransactionSource,
    pub external_id: String,
    pub amount: Money,
    pub currency: String,
    pub posted_date: NaiveDate,
    pub counterparty: String,
    pub memo: Option<String>,
    /// Original provider payload, kept verbatim for audit.
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct SkipReason {
    pub index: usize,
    pub reason: String,
}

/// Outcome of one ingestion batch. Malformed events are skipped and
/// counted, never fatal to the batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub skipped_malformed: Vec<SkipReason>,
}

/// Normalizes one provider event into the canonical transaction shape.
pub fn normalize(source: TransactionSource, raw: &RawEvent) -> Result<NewTransaction, FeedError> {
    match source {
        TransactionSource::Bank => normalize_bank(raw),
        TransactionSource::MarketplaceSettlement => normalize_settlement(raw),
        TransactionSource::PaymentProcessor => normalize_processor(raw),
    }
}

/// Bank statement line: string amounts (decimal comma or dot), ISO or
/// German dates, free-text name + purpose.
fn normalize_bank(raw: &RawEvent) -> Result<NewTransaction, FeedError> {
    let external_id = str_field(raw, "reference")?;
    let amount = parse_amount_str(&str_field(raw, "amount")?)?;
    let posted_date = parse_date_flexible(&str_field(raw, "booking_date")?)?;
    let counterparty = str_field(raw, "name")?;
    let memo = opt_str_field(raw, "purpose");

    Ok(NewTransaction {
        source: TransactionSource::Bank,
        external_id,
        amount,
        currency: opt_str_field(raw, "currency").unwrap_or_else(|| "EUR".to_string()),
        posted_date,
        counterparty,
        memo,
        raw: raw.clone(),
    })
}

/// Marketplace settlement posting: integer cents, settlement id plus an
/// optional order-level posting id.
fn normalize_settlement(raw: &RawEvent) -> Result<NewTransaction, FeedError> {
    let settlement_id = str_field(raw, "settlement_id")?;
    let external_id = match opt_str_field(raw, "posting_id") {
        Some(posting) => format!("{settlement_id}/{posting}"),
        None => settlement_id,
    };
    let cents = raw
        .get("amount_cents")
        .and_then(Value::as_i64)
        .ok_or(FeedError::MissingField("amount_cents"))?;
    let posted_date = parse_date_flexible(&str_field(raw, "posted_at")?)?;
    let counterparty = str_field(raw, "payee")?;
    let memo = opt_str_field(raw, "order_id");

    Ok(NewTransaction {
        source: TransactionSource::MarketplaceSettlement,
        external_id,
        amount: Money::from_cents(cents),
        currency: opt_str_field(raw, "currency").unwrap_or_else(|| "EUR".to_string()),
        posted_date,
        counterparty,
        memo,
        raw: raw.clone(),
    })
}

/// Payment processor transaction: amounts as JSON numbers in currency
/// units, RFC 3339 timestamps.
fn normalize_processor(raw: &RawEvent) -> Result<NewTransaction, FeedError> {
    let external_id = str_field(raw, "txn_id")?;
    let gross = raw
        .get("gross")
        .and_then(Value::as_f64)
        .ok_or(FeedError::MissingField("gross"))?;
    let amount = Decimal::try_from(gross)
        .map(Money::from_decimal)
        .map_err(|_| FeedError::InvalidAmount(gross.to_string()))?;
    let created = str_field(raw, "created")?;
    // Timestamps carry a time component; only the date matters here.
    let posted_date = parse_date_flexible(created.split('T').next().unwrap_or(&created))?;
    let counterparty = str_field(raw, "payer")?;
    let memo = opt_str_field(raw, "descriptor");

    Ok(NewTransaction {
        source: TransactionSource::PaymentProcessor,
        external_id,
        amount,
        currency: opt_str_field(raw, "currency").unwrap_or_else(|| "EUR".to_string()),
        posted_date,
        counterparty,
        memo,
        raw: raw.clone(),
    })
}

fn str_field(raw: &Value, key: &'static str) -> Result<String, FeedError> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(FeedError::MissingField(key))
}

fn opt_str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts "119,00", "119.00", "-1.234,56".
fn parse_amount_str(s: &str) -> Result<Money, FeedError> {
    let cleaned = if s.contains(',') {
        s.replace('.', "").replace(',', ".")
    } else {
        s.to_string()
    };
    Decimal::from_str(cleaned.trim())
        .map(Money::from_decimal)
        .map_err(|_| FeedError::InvalidAmount(s.to_string()))
}

/// Accepts "2025-10-15" and "15.10.2025".
fn parse_date_flexible(s: &str) -> Result<NaiveDate, FeedError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d.%m.%Y"))
        .map_err(|_| FeedError::InvalidDate(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bank_line_with_decimal_comma() {
        let raw = json!({
            "reference": "B-2025-1001",
            "booking_date": "15.10.2025",
            "amount": "-1.234,56",
            "name": "ACME GmbH",
            "purpose": "RE-2025-0042"
        });
        let tx = normalize(TransactionSource::Bank, &raw).unwrap();
        assert_eq!(tx.external_id, "B-2025-1001");
        assert_eq!(tx.amount.to_cents(), -123_456);
        assert_eq!(tx.posted_date.to_string(), "2025-10-15");
        assert_eq!(tx.memo.as_deref(), Some("RE-2025-0042"));
    }

    #[test]
    fn settlement_posting_id_extends_external_id() {
        let raw = json!({
            "settlement_id": "S-77",
            "posting_id": "P-3",
            "amount_cents": 50000,
            "posted_at": "2025-10-20",
            "payee": "Amazon Payment"
        });
        let tx = normalize(TransactionSource::MarketplaceSettlement, &raw).unwrap();
        assert_eq!(tx.external_id, "S-77/P-3");
        assert_eq!(tx.amount.to_cents(), 50_000);
    }

    #[test]
    fn processor_timestamp_truncates_to_date() {
        let raw = json!({
            "txn_id": "pp_9",
            "gross": 119.0,
            "created": "2025-10-15T09:30:00Z",
            "payer": "ACME GmbH"
        });
        let tx = normalize(TransactionSource::PaymentProcessor, &raw).unwrap();
        assert_eq!(tx.posted_date.to_string(), "2025-10-15");
        assert_eq!(tx.amount.to_cents(), 11_900);
    }

    #[test]
    fn missing_field_is_reported_not_panicked() {
        let raw = json!({ "booking_date": "2025-10-15", "amount": "5,00", "name": "X" });
        let err = normalize(TransactionSource::Bank, &raw).unwrap_err();
        assert!(matches!(err, FeedError::MissingField("reference")));
    }

    #[test]
    fn malformed_amount_is_reported() {
        let raw = json!({
            "reference": "B-1",
            "booking_date": "2025-10-15",
            "amount": "abc",
            "name": "X"
        });
        assert!(matches!(
            normalize(TransactionSource::Bank, &raw),
            Err(FeedError::InvalidAmount(_))
        ));
    }
}
