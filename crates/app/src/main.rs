use anyhow::{bail, Context};
use chrono::NaiveDate;
use fibu::{AppConfig, ReconService};
use fibu_core::{DateRange, TransactionSource};
use fibu_recon::{CancelFlag, ExclusionPolicy, RawEvent};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    let config = load_config()?;
    let db_path = match &config.database {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let db = fibu_storage::create_db(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    fibu_storage::seed_default_accounts(&db).await?;

    let policy = match &config.exclusion_policy {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ExclusionPolicy::from_toml(&content).map_err(anyhow::Error::msg)?
        }
        None => ExclusionPolicy::default(),
    };
    let service = ReconService::new(db, config.matching.clone(), policy);
    match &config.rules {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let imported = service.import_rules(&content).await?;
            tracing::info!("Imported {imported} rules from {}", path.display());
        }
        None => {
            service.import_default_rules().await?;
        }
    }

    match command.as_str() {
        "init" => {
            println!("Database ready at {}", db_path.display());
        }
        "ingest" => {
            let source: TransactionSource = arg(&args, 1, "source")?
                .parse()
                .map_err(anyhow::Error::msg)?;
            let path = arg(&args, 2, "events file")?;
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {path}"))?;
            let events: Vec<RawEvent> = serde_json::from_str(&content)?;
            let report = service.ingest(source, &events).await?;
            println!(
                "Ingested {} transactions ({} duplicates, {} malformed)",
                report.inserted,
                report.skipped_duplicate,
                report.skipped_malformed.len()
            );
        }
        "match" => {
            let range = parse_optional_range(&args, 1)?;
            let cancel = CancelFlag::new();
            let report = service.run_matching_pass(range, 10_000, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "export" => {
            let range = parse_range(&args, 1)?;
            let csv = service.export_csv(range).await?;
            match args.get(3) {
                Some(out) => {
                    std::fs::write(out, csv)
                        .with_context(|| format!("Failed to write {out}"))?;
                    println!("Export written to {out}");
                }
                None => print!("{csv}"),
            }
        }
        "confirm" => {
            let tx_id: i64 = arg(&args, 1, "transaction id")?.parse()?;
            let invoice_id = args.get(2).map(|s| s.parse()).transpose()?;
            service.confirm_match(tx_id, invoice_id).await?;
            println!("Transaction {tx_id} confirmed");
        }
        "reverse" => {
            let tx_id: i64 = arg(&args, 1, "transaction id")?.parse()?;
            service.reverse_match(tx_id).await?;
            println!("Transaction {tx_id} reversed");
        }
        "unresolved" => {
            let invoices = service
                .list_unresolved_invoices(None, None, None, 100)
                .await?;
            for inv in &invoices {
                println!(
                    "#{} {} {} {} cents ({})",
                    inv.id, inv.issue_date, inv.counterparty, inv.gross_cents, inv.origin
                );
            }
            println!("{} unresolved invoices", invoices.len());
        }
        "map" => {
            let counterparty = arg(&args, 1, "counterparty")?;
            let account = arg(&args, 2, "account code")?;
            service.upsert_creditor_mapping(counterparty, account).await?;
            println!("Mapped '{counterparty}' to account {account}");
        }
        "promote" => {
            let promoted = service.promote_from_history().await?;
            println!("Promoted {promoted} rules from manual decisions");
        }
        "recompute" => {
            let rule_id: i64 = arg(&args, 1, "rule id")?.parse()?;
            match service.recompute_confidence(rule_id).await? {
                Some(confidence) => println!("Rule {rule_id} confidence now {confidence:.2}"),
                None => println!("Rule {rule_id} has no history yet"),
            }
        }
        other => {
            print_usage();
            bail!("Unknown command: {other}");
        }
    }
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Usage: fibu <command>\n\n\
         Commands:\n  \
         init                               Create and seed the database\n  \
         ingest <source> <events.json>      Ingest provider events (bank, marketplace_settlement, payment_processor)\n  \
         match [start end]                  Run a matching pass, optionally bounded by dates (Y-m-d)\n  \
         export <start> <end> [out.csv]     Export matched bookings as CSV\n  \
         confirm <tx_id> [invoice_id]       Confirm a match manually\n  \
         reverse <tx_id>                    Reverse a match\n  \
         unresolved                         List invoices needing manual attention\n  \
         map <counterparty> <account>       Map a counterparty directly to an account\n  \
         promote                            Synthesize rules from manual decisions\n  \
         recompute <rule_id>                Recompute a rule's confidence from its history"
    );
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .map(|s| s.as_str())
        .with_context(|| format!("Missing argument: {name}"))
}

fn parse_range(args: &[String], index: usize) -> anyhow::Result<DateRange> {
    let start = NaiveDate::parse_from_str(arg(args, index, "start date")?, "%Y-%m-%d")?;
    let end = NaiveDate::parse_from_str(arg(args, index + 1, "end date")?, "%Y-%m-%d")?;
    Ok(DateRange { start, end })
}

fn parse_optional_range(args: &[String], index: usize) -> anyhow::Result<Option<DateRange>> {
    if args.len() <= index {
        return Ok(None);
    }
    Ok(Some(parse_range(args, index)?))
}

fn load_config() -> anyhow::Result<AppConfig> {
    let path = config_path()?;
    if path.exists() {
        AppConfig::load(&path).map_err(anyhow::Error::msg)
    } else {
        Ok(AppConfig::default())
    }
}

fn config_path() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("fibu.toml"))
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("fibu.db"))
}

fn project_dirs() -> anyhow::Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "fibu", "Fibu")
        .context("Failed to resolve application directories")
}
