use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Bank,
    Expense,
    Revenue,
    Tax,
    Debtor,
    Creditor,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountType::Bank => write!(f, "Bank"),
            AccountType::Expense => write!(f, "Expense"),
            AccountType::Revenue => write!(f, "Revenue"),
            AccountType::Tax => write!(f, "Tax"),
            AccountType::Debtor => write!(f, "Debtor"),
            AccountType::Creditor => write!(f, "Creditor"),
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bank" => Ok(AccountType::Bank),
            "Expense" => Ok(AccountType::Expense),
            "Revenue" => Ok(AccountType::Revenue),
            "Tax" => Ok(AccountType::Tax),
            "Debtor" => Ok(AccountType::Debtor),
            "Creditor" => Ok(AccountType::Creditor),
            other => Err(format!("Unknown account type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<AccountId>,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    /// Bookings on this account must carry a document reference
    /// (Belegnummer) in the export.
    pub document_required: bool,
}

impl Account {
    pub fn new(code: &str, name: &str, account_type: AccountType) -> Self {
        Account {
            id: None,
            code: code.to_string(),
            name: name.to_string(),
            account_type,
            document_required: false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DomainError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(i64),
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(i64),
    #[error("Transaction {0} is already matched")]
    AlreadyMatched(i64),
    #[error("Transaction {0} has no match to reverse")]
    NotMatched(i64),
    #[error("Transaction {0} has no invoice or account to confirm")]
    NothingToConfirm(i64),
    #[error("Counterparty '{counterparty}' may only match invoices from the {permitted} population")]
    ExcludedPopulation {
        counterparty: String,
        permitted: String,
    },
}

/// SKR03-flavoured seed chart. Fourth column: document-required flag.
pub const DEFAULT_ACCOUNTS: &[(&str, &str, AccountType, bool)] = &[
    ("1200", "Bank", AccountType::Bank, false),
    ("1220", "Marktplatz Abrechnungskonto", AccountType::Bank, false),
    ("1360", "Geldtransit", AccountType::Bank, false),
    (
        "1400",
        "Forderungen aus Lieferungen und Leistungen",
        AccountType::Debtor,
        false,
    ),
    (
        "1600",
        "Verbindlichkeiten aus Lieferungen und Leistungen",
        AccountType::Creditor,
        false,
    ),
    ("1571", "Abziehbare Vorsteuer 7%", AccountType::Tax, false),
    ("1576", "Abziehbare Vorsteuer 19%", AccountType::Tax, false),
    ("1771", "Umsatzsteuer 7%", AccountType::Tax, false),
    ("1776", "Umsatzsteuer 19%", AccountType::Tax, false),
    ("3100", "Fremdleistungen", AccountType::Expense, true),
    ("4910", "Porto", AccountType::Expense, true),
    ("4930", "Bürobedarf", AccountType::Expense, true),
    (
        "4970",
        "Nebenkosten des Geldverkehrs",
        AccountType::Expense,
        true,
    ),
    ("4980", "Betriebsbedarf", AccountType::Expense, true),
    ("8120", "Steuerfreie Umsätze", AccountType::Revenue, true),
    ("8300", "Erlöse 7% USt", AccountType::Revenue, true),
    ("8400", "Erlöse 19% USt", AccountType::Revenue, true),
];
