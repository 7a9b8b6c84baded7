use chrono::NaiveDate;
use fibu_core::{Money, VatBracket};
use std::io::Write;
use thiserror::Error;

/// Fixed column set of the downstream accounting import.
pub const EXPORT_HEADER: [&str; 10] = [
    "Konto",
    "Kontobezeichnung",
    "Datum",
    "Belegnummer",
    "Text",
    "Gegenkonto",
    "Soll",
    "Haben",
    "Steuer",
    "Steuerkonto",
];

/// UTF-8 byte-order marker so the consuming tool detects the encoding.
const BOM: &[u8] = b"\xef\xbb\xbf";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Which side of the business the booking sits on; decides between
/// input-tax and output-tax accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingSide {
    Sales,
    Purchase,
}

/// One matched, booked transaction ready for export.
#[derive(Debug, Clone)]
pub struct MatchedBooking {
    pub posted_date: NaiveDate,
    /// Signed transaction amount; sign picks the debit direction.
    pub amount: Money,
    pub document_number: String,
    pub memo: String,
    /// Target account (invoice account or mapped creditor account).
    pub account_code: String,
    pub account_label: String,
    /// The money account the payment moved over.
    pub bank_account: String,
    pub side: BookingSide,
    pub vat_rate: Option<f64>,
    pub tax: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub konto: String,
    pub kontobezeichnung: String,
    pub datum: String,
    pub belegnummer: String,
    pub text: String,
    pub gegenkonto: String,
    pub soll: String,
    pub haben: String,
    pub steuer: String,
    pub steuerkonto: String,
}

/// Input-tax (Vorsteuer) or output-tax (Umsatzsteuer) account for a VAT
/// bracket. Unknown rates get no tax account rather than an invented
/// number.
pub fn tax_account(side: BookingSide, bracket: Option<VatBracket>) -> Option<&'static str> {
    match (side, bracket?) {
        (_, VatBracket::Zero) => None,
        (BookingSide::Purchase, VatBracket::Reduced7) => Some("1571"),
        (BookingSide::Purchase, VatBracket::Standard19) => Some("1576"),
        (BookingSide::Sales, VatBracket::Reduced7) => Some("1771"),
        (BookingSide::Sales, VatBracket::Standard19) => Some("1776"),
    }
}

/// Decimal-comma amount string, fixed regardless of runtime locale.
pub fn format_amount_de(amount: Money) -> String {
    let cents = amount.to_cents().abs();
    format!("{},{:02}", cents / 100, cents % 100)
}

/// Day.month.year, the only date shape the downstream import accepts.
pub fn format_date_de(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

/// Expands one booking into its two mirrored rows, so the Soll and
/// Haben columns net to zero per transaction.
pub fn booking_rows(booking: &MatchedBooking) -> [BookingRow; 2] {
    let amount = format_amount_de(booking.amount);
    let datum = format_date_de(booking.posted_date);
    let bracket = booking.vat_rate.and_then(VatBracket::nearest);
    let steuerkonto = tax_account(booking.side, bracket).unwrap_or("").to_string();
    let steuer = booking
        .tax
        .filter(|t| !t.is_zero() && !steuerkonto.is_empty())
        .map(format_amount_de)
        .unwrap_or_default();

    let blank = |konto: &str, label: &str, gegen: &str| BookingRow {
        konto: konto.to_string(),
        kontobezeichnung: label.to_string(),
        datum: datum.clone(),
        belegnummer: booking.document_number.clone(),
        text: booking.memo.clone(),
        gegenkonto: gegen.to_string(),
        soll: String::new(),
        haben: String::new(),
        steuer: String::new(),
        steuerkonto: String::new(),
    };

    let mut target = blank(
        &booking.account_code,
        &booking.account_label,
        &booking.bank_account,
    );
    target.steuer = steuer;
    target.steuerkonto = steuerkonto;
    let mut bank = blank("", "", &booking.account_code);
    bank.konto = booking.bank_account.clone();

    if booking.amount.is_negative() {
        // Outgoing payment: expense/creditor in Soll, bank in Haben.
        target.soll = amount.clone();
        bank.haben = amount;
        [target, bank]
    } else {
        // Incoming payment: bank in Soll, revenue/debtor in Haben.
        bank.soll = amount.clone();
        target.haben = amount;
        [bank, target]
    }
}

/// Serializes rows as semicolon-delimited UTF-8 with a leading BOM and
/// the fixed header. Field escaping is the CSV writer's quoting.
pub fn write_csv<W: Write>(rows: &[BookingRow], mut writer: W) -> Result<(), ExportError> {
    writer.write_all(BOM)?;

    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(writer);

    csv_writer.write_record(EXPORT_HEADER)?;
    for row in rows {
        csv_writer.write_record([
            &row.konto,
            &row.kontobezeichnung,
            &row.datum,
            &row.belegnummer,
            &row.text,
            &row.gegenkonto,
            &row.soll,
            &row.haben,
            &row.steuer,
            &row.steuerkonto,
        ])?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn export_to_string(rows: &[BookingRow]) -> Result<String, ExportError> {
    let mut buffer = Vec::new();
    write_csv(rows, &mut buffer)?;
    Ok(String::from_utf8(buffer).expect("export is valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sales_booking() -> MatchedBooking {
        MatchedBooking {
            posted_date: date(2025, 10, 15),
            amount: Money::from_cents(11_900),
            document_number: "RE-2025-0042".to_string(),
            memo: "ACME GmbH".to_string(),
            account_code: "8400".to_string(),
            account_label: "Erlöse 19% USt".to_string(),
            bank_account: "1200".to_string(),
            side: BookingSide::Sales,
            vat_rate: Some(19.0),
            tax: Some(Money::from_cents(1_900)),
        }
    }

    fn parse_de_amount(s: &str) -> i64 {
        let (whole, frac) = s.split_once(',').unwrap();
        whole.parse::<i64>().unwrap() * 100 + frac.parse::<i64>().unwrap()
    }

    #[test]
    fn soll_and_haben_net_to_zero() {
        let [first, second] = booking_rows(&sales_booking());
        let soll = parse_de_amount(&first.soll);
        let haben = parse_de_amount(&second.haben);
        assert_eq!(soll, haben);
        assert!(first.haben.is_empty());
        assert!(second.soll.is_empty());
    }

    #[test]
    fn incoming_payment_debits_bank() {
        let [bank, revenue] = booking_rows(&sales_booking());
        assert_eq!(bank.konto, "1200");
        assert_eq!(bank.gegenkonto, "8400");
        assert_eq!(revenue.konto, "8400");
        assert_eq!(revenue.steuerkonto, "1776");
        assert_eq!(revenue.steuer, "19,00");
    }

    #[test]
    fn outgoing_payment_credits_bank() {
        let mut booking = sales_booking();
        booking.amount = Money::from_cents(-2_900);
        booking.account_code = "4980".to_string();
        booking.side = BookingSide::Purchase;
        booking.tax = Some(Money::from_cents(463));
        let [expense, bank] = booking_rows(&booking);
        assert_eq!(expense.konto, "4980");
        assert_eq!(expense.soll, "29,00");
        assert_eq!(expense.steuerkonto, "1576");
        assert_eq!(bank.konto, "1200");
        assert_eq!(bank.haben, "29,00");
    }

    #[test]
    fn unknown_vat_rate_gets_no_tax_account() {
        let mut booking = sales_booking();
        booking.vat_rate = Some(12.0);
        let [_, revenue] = booking_rows(&booking);
        assert!(revenue.steuerkonto.is_empty());
        assert!(revenue.steuer.is_empty());
    }

    #[test]
    fn near_bracket_rates_are_rounded() {
        assert_eq!(
            tax_account(BookingSide::Sales, VatBracket::nearest(18.7)),
            Some("1776")
        );
        assert_eq!(
            tax_account(BookingSide::Purchase, VatBracket::nearest(7.2)),
            Some("1571")
        );
        assert_eq!(tax_account(BookingSide::Sales, VatBracket::nearest(0.0)), None);
    }

    #[test]
    fn locale_fixed_formats() {
        assert_eq!(format_amount_de(Money::from_cents(123_456)), "1234,56");
        assert_eq!(format_amount_de(Money::from_cents(-50)), "0,50");
        assert_eq!(format_date_de(date(2025, 3, 7)), "07.03.2025");
    }

    #[test]
    fn csv_starts_with_bom_and_header() {
        let rows = booking_rows(&sales_booking());
        let out = export_to_string(&rows).unwrap();
        assert!(out.starts_with('\u{feff}'));
        let body = out.trim_start_matches('\u{feff}');
        assert!(body.starts_with("Konto;Kontobezeichnung;Datum;Belegnummer;Text;Gegenkonto;Soll;Haben;Steuer;Steuerkonto"));
    }

    #[test]
    fn text_with_separator_is_escaped() {
        let mut booking = sales_booking();
        booking.memo = "Zahlung; Teil 1".to_string();
        let rows = booking_rows(&booking);
        let out = export_to_string(&rows).unwrap();
        assert!(out.contains("\"Zahlung; Teil 1\""));
    }

    #[test]
    fn round_trip_recovers_amounts_and_dates() {
        let rows = booking_rows(&sales_booking());
        let out = export_to_string(&rows).unwrap();
        let body = out.trim_start_matches('\u{feff}');

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .from_reader(body.as_bytes());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);

        let bank_row = &records[0];
        assert_eq!(&bank_row[2], "15.10.2025");
        assert_eq!(parse_de_amount(&bank_row[6]), 11_900);

        let revenue_row = &records[1];
        assert_eq!(parse_de_amount(&revenue_row[7]), 11_900);
        assert_eq!(parse_de_amount(&revenue_row[8]), 1_900);
    }
}
