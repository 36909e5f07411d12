use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use coin_settlement::application::{Services, SettlementRequest, cancellable};
use coin_settlement::config::{DEFAULT_BONUS_LOOKBACK_DAYS, DEFAULT_MAX_WRITE_ATTEMPTS, Settings};
use coin_settlement::domain::ports::SystemTimeSource;
use coin_settlement::domain::settlement::Month;
use coin_settlement::error::{CoreError, Result as CoreResult};
use coin_settlement::infrastructure::StoreHandles;
use coin_settlement::interfaces::csv::record_reader::{
    OperationKind, OperationRow, PackageRow, PaymentRow, RecordReader, ReviewRow,
};
use coin_settlement::interfaces::csv::table_writer::TableWriter;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "COIN_SETTLEMENT_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "COIN_SETTLEMENT_LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Only ranks refreshed within this many days earn a bonus
    #[arg(
        long,
        env = "COIN_SETTLEMENT_BONUS_LOOKBACK_DAYS",
        default_value_t = DEFAULT_BONUS_LOOKBACK_DAYS,
        global = true
    )]
    bonus_lookback_days: u32,

    /// Attempts per optimistic store transaction before reporting a write conflict
    #[arg(
        long,
        env = "COIN_SETTLEMENT_MAX_WRITE_ATTEMPTS",
        default_value_t = DEFAULT_MAX_WRITE_ATTEMPTS,
        global = true
    )]
    max_write_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            bonus_lookback_days: self.bonus_lookback_days,
            max_write_attempts: self.max_write_attempts,
            ..Settings::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print a user's coin balance
    Balance { user: String },
    /// Print every balance as CSV
    Balances,
    /// Credit coins to a user
    Deposit {
        user: String,
        #[arg(allow_negative_numbers = true)]
        amount: i64,
    },
    /// Debit coins from a user
    Deduct {
        user: String,
        #[arg(allow_negative_numbers = true)]
        amount: i64,
    },
    /// Move coins between users
    Transfer {
        from: String,
        to: String,
        #[arg(allow_negative_numbers = true)]
        amount: i64,
        /// Commit both legs in one store transaction
        #[arg(long)]
        atomic: bool,
    },
    /// Buy a package with coins
    Buy { user: String, package: String },
    /// Print whether a user has any active entitlement
    Check { user: String },
    /// Print a user's entitlements as JSON lines
    Entitlements { user: String },
    /// Load source records or the package catalog from CSV
    Import {
        #[command(subcommand)]
        kind: ImportKind,
    },
    /// Apply ledger operations from CSV and print the final balances
    Replay {
        /// Operations CSV: op,user,target,amount
        ops: PathBuf,
        /// Package catalog to load before replaying
        #[arg(long)]
        packages: Option<PathBuf>,
    },
    /// Recompute settlement tables
    Settle {
        /// Reviews CSV to import before settling
        #[arg(long, global = true)]
        reviews: Option<PathBuf>,
        /// Payments CSV to import before settling
        #[arg(long, global = true)]
        payments: Option<PathBuf>,
        #[command(subcommand)]
        pass: SettlePass,
    },
    /// Print the published settlement tables
    Show {
        #[command(subcommand)]
        table: ShowTable,
    },
}

#[derive(Subcommand)]
enum ImportKind {
    Packages { csv: PathBuf },
    Reviews { csv: PathBuf },
    Payments { csv: PathBuf },
}

#[derive(Subcommand)]
enum SettlePass {
    Rankings {
        /// Rank reviews created at or after this RFC 3339 instant
        #[arg(long)]
        since: DateTime<Utc>,
    },
    Commission {
        /// YYYY-MM
        #[arg(long)]
        month: String,
        #[arg(long)]
        percent: f64,
    },
    Bonus {
        #[arg(long)]
        period: String,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        amount: Option<f64>,
    },
    All {
        #[arg(long)]
        since: DateTime<Utc>,
        #[arg(long)]
        percent: f64,
        #[arg(long)]
        period: String,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        amount: Option<f64>,
    },
}

#[derive(Subcommand)]
enum ShowTable {
    Rankings,
    Commissions {
        #[arg(long)]
        month: String,
    },
    Bonuses {
        #[arg(long)]
        period: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    let settings = cli.settings();
    let stores = open_stores(cli.db_path.as_deref(), &settings)?;
    let services = Services::new(&stores, Arc::new(SystemTimeSource), settings);

    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    cancellable(&token, run(cli.command, &services))
        .await
        .into_diagnostic()
}

#[cfg_attr(not(feature = "storage-rocksdb"), allow(unused_variables))]
fn open_stores(db_path: Option<&Path>, settings: &Settings) -> Result<StoreHandles> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            use coin_settlement::infrastructure::rocksdb::RocksDBStore;

            let store = RocksDBStore::open_with(path, settings).into_diagnostic()?;
            info!(path = %path.display(), "using RocksDB storage");
            Ok(StoreHandles::shared(Arc::new(store)))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(path) => {
            warn!(
                path = %path.display(),
                "persistent storage requested via --db-path, but the storage-rocksdb feature is not enabled; falling back to in-memory storage"
            );
            Ok(StoreHandles::in_memory())
        }
        None => {
            info!("using in-memory storage");
            Ok(StoreHandles::in_memory())
        }
    }
}

async fn run(command: Command, services: &Services) -> CoreResult<()> {
    match command {
        Command::Balance { user } => {
            println!("{}", services.ledger.balance(&user).await?);
        }
        Command::Balances => {
            let balances = services.ledger.balances().await?;
            TableWriter::new(io::stdout().lock()).write_balances(&balances)?;
        }
        Command::Deposit { user, amount } => {
            print_json(&services.ledger.deposit(&user, amount).await?)?;
        }
        Command::Deduct { user, amount } => {
            print_json(&services.ledger.deduct(&user, amount).await?)?;
        }
        Command::Transfer {
            from,
            to,
            amount,
            atomic,
        } => {
            let transfer = if atomic {
                services.ledger.transfer_atomic(&from, &to, amount).await?
            } else {
                services.ledger.transfer(&from, &to, amount).await?
            };
            print_json(&transfer)?;
        }
        Command::Buy { user, package } => {
            print_json(&services.subscriptions.buy_package(&user, &package).await?)?;
        }
        Command::Check { user } => {
            println!("{}", services.subscriptions.check_active(&user).await?);
        }
        Command::Entitlements { user } => {
            for entitlement in services.subscriptions.entitlements(&user).await? {
                print_json(&entitlement)?;
            }
        }
        Command::Import { kind } => {
            let imported = match kind {
                ImportKind::Packages { csv } => import_packages(services, &csv).await?,
                ImportKind::Reviews { csv } => import_reviews(services, &csv).await?,
                ImportKind::Payments { csv } => import_payments(services, &csv).await?,
            };
            println!("{imported}");
        }
        Command::Replay { ops, packages } => {
            if let Some(packages) = packages {
                import_packages(services, &packages).await?;
            }
            replay(services, &ops).await?;
            let balances = services.ledger.balances().await?;
            TableWriter::new(io::stdout().lock()).write_balances(&balances)?;
        }
        Command::Settle {
            reviews,
            payments,
            pass,
        } => {
            if let Some(reviews) = reviews {
                import_reviews(services, &reviews).await?;
            }
            if let Some(payments) = payments {
                import_payments(services, &payments).await?;
            }
            settle(services, pass).await?;
        }
        Command::Show { table } => show(services, table).await?,
    }
    Ok(())
}

async fn settle(services: &Services, pass: SettlePass) -> CoreResult<()> {
    let job = &services.settlement;
    match pass {
        SettlePass::Rankings { since } => {
            job.calculate_rankings(since).await?;
            show(services, ShowTable::Rankings).await
        }
        SettlePass::Commission { month, percent } => {
            job.calculate_commission(&month, percent).await?;
            show(services, ShowTable::Commissions { month }).await
        }
        SettlePass::Bonus {
            period,
            top_n,
            amount,
        } => {
            let settings = job.settings();
            job.calculate_bonus(
                &period,
                top_n.unwrap_or(settings.default_top_n),
                amount.unwrap_or(settings.default_bonus_amount),
            )
            .await?;
            show(services, ShowTable::Bonuses { period }).await
        }
        SettlePass::All {
            since,
            percent,
            period,
            top_n,
            amount,
        } => {
            let run = job
                .run_all(&SettlementRequest {
                    since,
                    percent,
                    period: period.clone(),
                    top_n,
                    bonus_amount: amount,
                })
                .await?;
            info!(
                rankings = run.rankings.rows,
                commissions = run.commissions.rows,
                bonuses = run.bonuses.rows,
                "settlement run finished"
            );
            let month = Month::of(since).to_string();
            show(services, ShowTable::Rankings).await?;
            show(services, ShowTable::Commissions { month }).await?;
            show(services, ShowTable::Bonuses { period }).await
        }
    }
}

async fn show(services: &Services, table: ShowTable) -> CoreResult<()> {
    let job = &services.settlement;
    match table {
        ShowTable::Rankings => {
            let rows = job.rankings().await?;
            TableWriter::new(io::stdout().lock()).write_rankings(&rows)
        }
        ShowTable::Commissions { month } => {
            let rows = job.commissions(&month).await?;
            TableWriter::new(io::stdout().lock()).write_commissions(&rows)
        }
        ShowTable::Bonuses { period } => {
            let rows = job.bonuses(&period).await?;
            TableWriter::new(io::stdout().lock()).write_bonuses(&rows)
        }
    }
}

async fn replay(services: &Services, path: &Path) -> CoreResult<()> {
    let reader = RecordReader::new(File::open(path)?);
    for row in reader.records::<OperationRow>() {
        match row {
            Ok(row) => {
                if let Err(e) = apply_operation(services, row).await {
                    warn!("Error processing operation: {e}");
                }
            }
            Err(e) => warn!("Error reading operation: {e}"),
        }
    }
    Ok(())
}

async fn apply_operation(services: &Services, row: OperationRow) -> CoreResult<()> {
    let amount = || {
        row.amount
            .ok_or_else(|| CoreError::InvalidAmount(format!("{:?} needs an amount", row.op)))
    };
    let target = || {
        row.target
            .as_deref()
            .ok_or_else(|| CoreError::InvalidAmount(format!("{:?} needs a target", row.op)))
    };
    match row.op {
        OperationKind::Deposit => {
            services.ledger.deposit(&row.user, amount()?).await?;
        }
        OperationKind::Deduct => {
            services.ledger.deduct(&row.user, amount()?).await?;
        }
        OperationKind::Transfer => {
            services.ledger.transfer(&row.user, target()?, amount()?).await?;
        }
        OperationKind::Buy => {
            services.subscriptions.buy_package(&row.user, target()?).await?;
        }
    }
    Ok(())
}

async fn import_packages(services: &Services, path: &Path) -> CoreResult<usize> {
    let mut imported = 0;
    for row in RecordReader::new(File::open(path)?).records::<PackageRow>() {
        let result = match row {
            Ok(row) => services
                .records
                .create_package(&row.package_id, &row.name, row.coin_cost, row.duration_days)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => imported += 1,
            Err(e) => warn!(path = %path.display(), "Error importing package: {e}"),
        }
    }
    info!(path = %path.display(), imported, "packages imported");
    Ok(imported)
}

async fn import_reviews(services: &Services, path: &Path) -> CoreResult<usize> {
    let mut imported = 0;
    for row in RecordReader::new(File::open(path)?).records::<ReviewRow>() {
        let result = match row.and_then(ReviewRow::into_record) {
            Ok(review) => services.records.import_review(review).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => imported += 1,
            Err(e) => warn!(path = %path.display(), "Error importing review: {e}"),
        }
    }
    info!(path = %path.display(), imported, "reviews imported");
    Ok(imported)
}

async fn import_payments(services: &Services, path: &Path) -> CoreResult<usize> {
    let mut imported = 0;
    for row in RecordReader::new(File::open(path)?).records::<PaymentRow>() {
        let result = match row.and_then(PaymentRow::into_record) {
            Ok(payment) => services.records.import_payment(payment).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => imported += 1,
            Err(e) => warn!(path = %path.display(), "Error importing payment: {e}"),
        }
    }
    info!(path = %path.display(), imported, "payments imported");
    Ok(imported)
}

fn print_json<T: Serialize>(value: &T) -> CoreResult<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
