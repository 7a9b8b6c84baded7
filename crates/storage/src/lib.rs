pub mod db;

pub use db::{
    apply_match, claim_transaction, create_db, create_memory_db, dedupe_invoices,
    exportable_transactions, get_account_by_code, get_all_accounts, get_creditor_mapping,
    get_invoice, get_rules, get_transaction, history_for_rule, history_for_transaction,
    insert_rule, insert_transaction, list_creditor_mappings, list_unresolved_invoices,
    manual_decisions, record_rule_application, reverse_match, search_invoices,
    seed_default_accounts, set_invoice_account, set_transaction_state, unmatched_transactions,
    update_rule_confidence, upsert_creditor_mapping, upsert_invoice, DbPool, HistoryRecord,
    InsertOutcome, InvoiceRecord, InvoiceSearch, ManualDecisionRow, MatchApplication,
    NewInvoiceRow, NewRuleRow, NewTransactionRow, RuleRecord, StorageError, TransactionRecord,
};
