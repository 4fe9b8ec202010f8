use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use repairkit_lib::backup::{self, BackupFlags, BackupOutcome, BackupSession, TableDesc};
use repairkit_lib::cipher::{self, CipherParams, KdfSalt};
use repairkit_lib::db::health::{self, DbHealthReport, DbHealthStatus};
use repairkit_lib::db::{swap, SqliteDatabase};
use repairkit_lib::repair::{CorruptionScanner, RepairFlags, RepairReport};
use repairkit_lib::snapshot::MasterSnapshotStore;
use repairkit_lib::CancelToken;

const EXIT_CANCELED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "repairkit", about = "Repair damaged SQLite files and take portable backups", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the SQLite health checks against a database file.
    Status {
        db: PathBuf,
        /// Emit the raw JSON health report instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Save or inspect master snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Write an encrypted copy of a plain database file.
    Seal {
        plain: PathBuf,
        out: PathBuf,
        #[arg(long)]
        key: String,
        #[command(flatten)]
        cipher: CipherArgs,
    },
    /// Copy every recoverable row of a damaged database into a new one.
    Repair(RepairArgs),
    /// Stream a database into a backup file.
    Backup(BackupArgs),
    /// Replay a backup file into a database.
    Restore {
        backup: PathBuf,
        dest: PathBuf,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    /// Record the schema of a healthy database.
    Save {
        db: PathBuf,
        out: PathBuf,
        /// Encrypt the snapshot file with this key.
        #[arg(long)]
        key: Option<String>,
        /// Record the cipher salt of this encrypted copy of the database.
        #[arg(long)]
        salt_from: Option<PathBuf>,
    },
    /// Print the entries of a snapshot file.
    Show {
        path: PathBuf,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
struct CipherArgs {
    #[arg(long, default_value_t = cipher::DEFAULT_PAGE_SIZE)]
    page_size: u32,
    #[arg(long, default_value_t = CipherParams::default().kdf_iterations)]
    kdf_iterations: u32,
}

impl CipherArgs {
    fn params(&self) -> CipherParams {
        CipherParams {
            page_size: self.page_size,
            kdf_iterations: self.kdf_iterations,
        }
    }
}

#[derive(Debug, Args)]
struct RepairArgs {
    src: PathBuf,
    /// Destination database; omitted with `--in-place`.
    #[arg(required_unless_present = "in_place")]
    dest: Option<PathBuf>,
    #[arg(long)]
    snapshot: Option<PathBuf>,
    #[arg(long)]
    snapshot_key: Option<String>,
    /// Key of an encrypted source file.
    #[arg(long)]
    key: Option<String>,
    #[command(flatten)]
    cipher: CipherArgs,
    /// Only repair these tables.
    #[arg(long = "table")]
    tables: Vec<String>,
    #[arg(long)]
    all_tables: bool,
    #[arg(long)]
    no_create_tables: bool,
    /// Repair into a sibling file and swap it in, archiving the original.
    #[arg(long, conflicts_with = "dest")]
    in_place: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct BackupArgs {
    db: PathBuf,
    out: PathBuf,
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    no_cipher: bool,
    #[arg(long)]
    no_compress: bool,
    #[arg(long)]
    fix_corruption: bool,
    #[arg(long)]
    no_create_table: bool,
    #[arg(long)]
    incremental: bool,
    /// `NAME` or `NAME=CONDITION`; repeatable.
    #[arg(long = "table")]
    tables: Vec<String>,
    #[arg(long)]
    json: bool,
}

impl BackupArgs {
    fn flags(&self) -> BackupFlags {
        let mut flags = BackupFlags::empty();
        flags.set(BackupFlags::NO_CIPHER, self.no_cipher);
        flags.set(BackupFlags::NO_COMPRESS, self.no_compress);
        flags.set(BackupFlags::FIX_CORRUPTION, self.fix_corruption);
        flags.set(BackupFlags::NO_CREATE_TABLE, self.no_create_table);
        flags.set(BackupFlags::INCREMENTAL, self.incremental);
        flags
    }
}

#[tokio::main]
async fn main() {
    let guard = repairkit_lib::init_logging();
    let cli = Cli::parse();
    let code = match handle_cli(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    drop(guard);
    process::exit(code);
}

async fn handle_cli(command: Commands) -> Result<i32> {
    match command {
        Commands::Status { db, json } => handle_status(&db, json).await,
        Commands::Snapshot(cmd) => handle_snapshot(cmd),
        Commands::Seal {
            plain,
            out,
            key,
            cipher,
        } => {
            let salt = cipher::seal_database(&plain, &out, key.as_bytes(), cipher.params())
                .context("seal database")?;
            println!("Sealed copy written to {} (salt {salt:?})", out.display());
            Ok(0)
        }
        Commands::Repair(args) => handle_repair(args).await,
        Commands::Backup(args) => handle_backup(args).await,
        Commands::Restore {
            backup,
            dest,
            key,
            json,
        } => handle_restore(backup, dest, key, json).await,
    }
}

async fn handle_status(db: &Path, emit_json: bool) -> Result<i32> {
    let pool = health::open_health_pool(db).await.context("open database")?;
    let report = health::run_health_checks(&pool, db)
        .await
        .context("run database health checks");
    pool.close().await;
    let report = report?;

    if emit_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize health report")?
        );
    } else {
        print_health_table(&report);
    }
    Ok(match report.status {
        DbHealthStatus::Ok => 0,
        DbHealthStatus::Error => 1,
    })
}

fn handle_snapshot(command: SnapshotCommand) -> Result<i32> {
    match command {
        SnapshotCommand::Save {
            db,
            out,
            key,
            salt_from,
        } => {
            let mut source = SqliteDatabase::open_existing(&db).context("open source database")?;
            if let Some(sealed) = salt_from {
                source = source.with_kdf_salt(KdfSalt::read_from_file(&sealed).context("read cipher salt")?);
            }
            let summary = MasterSnapshotStore::try_save(&source, &out, key.as_deref().map(str::as_bytes))
                .context("save master snapshot")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serialize snapshot summary")?
            );
            Ok(0)
        }
        SnapshotCommand::Show { path, key, json } => {
            let snapshot = MasterSnapshotStore::load(
                Some(&path),
                key.as_deref().map(str::as_bytes),
                std::iter::empty::<String>(),
            )
            .context("load master snapshot")?;
            if json {
                let payload = json!({
                    "createdAt": snapshot.created_at(),
                    "hasSalt": snapshot.salt().is_some(),
                    "entries": snapshot.entries(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload).context("serialize snapshot")?
                );
            } else {
                if let Some(created) = snapshot.created_at() {
                    println!("Created at : {created}");
                }
                println!("Cipher salt: {}", if snapshot.salt().is_some() { "yes" } else { "no" });
                println!("\n{:<6} {:<24} {:<24} {:>6}", "Kind", "Name", "Table", "Root");
                for entry in snapshot.entries() {
                    println!(
                        "{:<6} {:<24} {:<24} {:>6}",
                        format!("{:?}", entry.kind).to_lowercase(),
                        entry.name,
                        entry.table_name,
                        entry.root_page
                    );
                }
            }
            MasterSnapshotStore::release(snapshot);
            Ok(0)
        }
    }
}

/// Runs `work` on the blocking pool, canceling `token` on Ctrl-C.
async fn run_cancelable<T, F>(token: CancelToken, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let mut worker = tokio::task::spawn_blocking(work);
    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Canceling...");
            token.cancel();
            worker.await
        }
    };
    joined.context("worker thread panicked")
}

async fn handle_repair(args: RepairArgs) -> Result<i32> {
    let (dest_path, archive_path) = match (&args.dest, args.in_place) {
        (_, true) => {
            let (work, archive) = swap::in_place_paths(&args.src);
            (work, Some(archive))
        }
        (Some(dest), false) => (dest.clone(), None),
        (None, false) => bail!("a destination database is required unless --in-place is given"),
    };
    if dest_path.exists() && !args.no_create_tables {
        bail!("destination {} already exists", dest_path.display());
    }

    let snapshot = if args.snapshot.is_some() || !args.tables.is_empty() {
        Some(
            MasterSnapshotStore::load(
                args.snapshot.as_deref(),
                args.snapshot_key.as_deref().map(str::as_bytes),
                args.tables.iter().cloned(),
            )
            .context("load master snapshot")?,
        )
    } else {
        None
    };

    let mut flags = RepairFlags::empty();
    flags.set(RepairFlags::ALL_TABLES, args.all_tables);
    flags.set(RepairFlags::NO_CREATE_TABLES, args.no_create_tables);

    let mut scanner = CorruptionScanner::open(
        &args.src,
        args.key.as_deref().map(str::as_bytes),
        args.cipher.params(),
        snapshot,
    )
    .context("open damaged database")?;
    let dest = SqliteDatabase::open(&dest_path).context("open destination database")?;

    let token = scanner.cancel_token();
    let report: RepairReport = run_cancelable(token, move || {
        let report = scanner.output_with_report(&dest, flags);
        scanner.release();
        report
    })
    .await?
    .context("repair database")?;

    if let Some(archive) = &archive_path {
        if report.canceled {
            eprintln!("Repair canceled; {} left in place", args.src.display());
        } else {
            swap::swap_database(&args.src, &dest_path, archive).context("swap repaired database")?;
        }
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize repair report")?
        );
    } else {
        print_repair_summary(&report, &dest_path, archive_path.as_deref());
    }
    Ok(if report.canceled { EXIT_CANCELED } else { 0 })
}

async fn handle_backup(args: BackupArgs) -> Result<i32> {
    let tables = if args.tables.is_empty() {
        None
    } else {
        Some(
            args.tables
                .iter()
                .map(|spec| TableDesc::parse(spec))
                .collect::<Result<Vec<_>, _>>()
                .context("parse --table")?,
        )
    };
    let source = Arc::new(SqliteDatabase::open_existing(&args.db).context("open source database")?);
    let mut session = BackupSession::new(
        source,
        &args.out,
        args.key.as_deref().map(str::as_bytes),
        args.flags(),
        tables,
    )
    .context("create backup session")?;

    let token = session.cancel_token();
    let (outcome, session) = run_cancelable(token, move || {
        let outcome = session.run();
        (outcome, session)
    })
    .await?;

    let sha256 = match outcome {
        BackupOutcome::Failed => None,
        _ => backup::file_sha256(&args.out).ok(),
    };
    if args.json {
        let payload = json!({
            "outcome": outcome,
            "path": args.out.display().to_string(),
            "statements": session.statement_count(),
            "stats": session.stats(),
            "sha256": sha256,
            "error": session.last_error(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("serialize backup result")?
        );
    } else {
        match outcome {
            BackupOutcome::Ok => println!("Backup stored at {}", args.out.display()),
            BackupOutcome::Canceled => println!("Backup canceled; partial file at {}", args.out.display()),
            BackupOutcome::Failed => println!("Backup failed."),
        }
        println!("Statements : {}", session.statement_count());
        if let Some(sha) = &sha256 {
            println!("SHA-256    : {sha}");
        }
        if let Some(err) = session.last_error() {
            println!("Reason     : {} ({})", err.message(), err.code());
        }
    }

    Ok(match outcome {
        BackupOutcome::Ok => 0,
        BackupOutcome::Canceled => EXIT_CANCELED,
        BackupOutcome::Failed => 1,
    })
}

async fn handle_restore(backup_path: PathBuf, dest: PathBuf, key: Option<String>, emit_json: bool) -> Result<i32> {
    let report = tokio::task::spawn_blocking(move || {
        let dest = SqliteDatabase::open(&dest)?;
        backup::restore(&backup_path, key.as_deref().map(str::as_bytes), &dest)
    })
    .await
    .context("worker thread panicked")?
    .context("restore backup")?;

    if emit_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize restore report")?
        );
    } else {
        println!("Frames     : {}", report.frames);
        println!("Applied    : {}", report.statements_applied);
        println!("Failed     : {}", report.statements_failed);
        println!("Tables     : {}", report.tables.join(", "));
        if report.truncated {
            println!("Backup tail was incomplete; restored every intact frame.");
        }
    }
    Ok(if report.statements_failed == 0 { 0 } else { 1 })
}

fn print_repair_summary(report: &RepairReport, dest: &Path, archive: Option<&Path>) {
    println!("Repair {}", if report.canceled { "canceled" } else { "complete" });
    println!("Rows recovered : {}", report.rows_recovered);
    println!("Rows failed    : {}", report.rows_failed);
    println!("Damaged pages  : {}", report.damaged_pages);
    println!("Damaged cells  : {}", report.damaged_cells);
    println!(
        "Integrity      : header={:?} data={:?} kdf_salt={:?}",
        report.integrity.header, report.integrity.data, report.integrity.kdf_salt
    );
    match archive {
        Some(archive) => println!("Original archived as: {}", archive.display()),
        None => println!("Output: {}", dest.display()),
    }

    println!("\n{:<24} {:>9} {:>9} {:>9}", "Table", "Attempted", "Recovered", "Failed");
    for (name, stats) in &report.tables {
        println!(
            "{:<24} {:>9} {:>9} {:>9}",
            name, stats.attempted, stats.succeeded, stats.failed
        );
    }
    for skipped in &report.skipped_tables {
        println!("Skipped {}: {}", skipped.name, skipped.reason);
    }
}

fn print_health_table(report: &DbHealthReport) {
    println!("Database health report");
    println!(
        "Status       : {}",
        match report.status {
            DbHealthStatus::Ok => "ok",
            DbHealthStatus::Error => "error",
        }
    );
    println!("Schema hash  : {}", report.schema_hash);
    println!("App version  : {}", report.app_version);
    println!("Generated at : {}", report.generated_at);

    println!("\nChecks:");
    println!("{:<20} {:<7} {:>13}  Details", "Check", "Passed", "Duration (ms)");
    for check in &report.checks {
        let details = check
            .details
            .as_deref()
            .map(|value| value.replace('\n', " "))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<7} {:>13}  {}",
            check.name,
            if check.passed { "yes" } else { "no" },
            check.duration_ms,
            details
        );
    }

    if report.offenders.is_empty() {
        println!("\nOffenders: none");
    } else {
        println!("\nOffenders:");
        println!("{:<20} {:>10}  Message", "Table", "RowID");
        for offender in &report.offenders {
            println!("{:<20} {:>10}  {}", offender.table, offender.rowid, offender.message);
        }
    }
}
