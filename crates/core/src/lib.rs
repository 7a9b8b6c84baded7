pub mod account;
pub mod money;
pub mod period;
pub mod text;
pub mod types;

pub use account::{Account, AccountId, AccountType, DomainError, DEFAULT_ACCOUNTS};
pub use money::Money;
pub use period::{DateRange, DateWindow};
pub use text::normalize_counterparty;
pub use types::{
    Decision, InvoiceOrigin, MatchState, PaymentStatus, TransactionSource, VatBracket,
};
