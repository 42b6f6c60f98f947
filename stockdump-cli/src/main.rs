//! Stockdump CLI: build a request manifest, fetch dumps, consolidate them.
//!
//! Commands:
//! - `manifest`: append authenticated fetch requests for a set of symbols
//! - `fetch`: download one compressed dump per manifest entry
//! - `consolidate`: merge all dumps into one Parquet/Feather/CSV table
//! - `head`: preview a single dump, raw or parsed
//! - `store status`: list dumps with size and modification time
//!
//! Exit status: 0 on success, 2 when a run finished with per-symbol
//! failures, 1 on a fatal setup error.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use stockdump_core::data::{
    Credentials, DumpFormat, DumpStore, FetchWindow, Interval, Manifest, TableFormat,
    YahooProvider,
};
use stockdump_runner::{
    preview_parsed, preview_raw, render_records, run_consolidate, run_fetch, write_report,
    ConsolidateOptions, ExitStatus, FetchOptions, PipelineConfig, StdoutProgress,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stockdump",
    version,
    about = "Fetch Yahoo Finance quote dumps and consolidate them into one table"
)]
struct Cli {
    /// Pipeline config (TOML). Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one fetch request per symbol to the manifest.
    Manifest {
        /// Symbols to request (e.g., AAPL MSFT ^GSPC).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Yahoo crumb. Falls back to $YAHOO_CRUMB.
        #[arg(long)]
        crumb: Option<String>,

        /// Yahoo cookie header value. Falls back to $YAHOO_COOKIE.
        #[arg(long)]
        cookie: Option<String>,

        /// Manifest path.
        #[arg(long)]
        out: Option<PathBuf>,

        /// First day (YYYY-MM-DD). Defaults to one year before today.
        #[arg(long)]
        start: Option<String>,

        /// Last day (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Bar size: 1d, 1wk or 1mo.
        #[arg(long, default_value = "1d")]
        interval: Interval,
    },
    /// Fetch one compressed dump per manifest entry.
    Fetch {
        /// Manifest path.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Dump directory.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Concurrent requests.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Retries per symbol for transient failures.
        #[arg(long)]
        retries: Option<u32>,

        /// Per-request timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// zstd level (-7..=22).
        #[arg(long, allow_hyphen_values = true)]
        level: Option<i32>,

        /// Minimum milliseconds between request starts.
        #[arg(long)]
        min_interval_ms: Option<u64>,

        /// Stop issuing requests after this many seconds.
        #[arg(long)]
        run_timeout: Option<u64>,

        /// Write the run summary as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Merge all dumps into one table.
    Consolidate {
        /// Dump directory.
        #[arg(long)]
        dumps: Option<PathBuf>,

        /// Output table path.
        #[arg(long)]
        out: Option<PathBuf>,

        /// parquet, feather or csv. Defaults to the output extension, then config.
        #[arg(long)]
        format: Option<TableFormat>,

        /// Force payload format (json or csv) instead of autodetecting.
        #[arg(long)]
        hint: Option<DumpFormat>,

        /// Exit with status 2 if any dump was skipped.
        #[arg(long, default_value_t = false)]
        strict: bool,

        /// Write the run summary as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Preview a single dump.
    Head {
        /// Path to a .zst dump.
        dump: PathBuf,

        /// Rows (lines in raw mode, records with --parsed).
        #[arg(short = 'n', long, default_value_t = stockdump_runner::preview::DEFAULT_ROWS)]
        rows: usize,

        /// Stop raw output after this many decompressed bytes.
        #[arg(long)]
        bytes: Option<u64>,

        /// Parse the payload and print records as a table.
        #[arg(long, default_value_t = false)]
        parsed: bool,

        /// Force payload format (json or csv) with --parsed.
        #[arg(long)]
        hint: Option<DumpFormat>,
    },
    /// Dump store commands.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List dumps with compressed size and modification time.
    Status {
        /// Dump directory.
        #[arg(long)]
        dumps: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = PipelineConfig::load(cli.config.as_deref())
        .with_context(|| "loading pipeline config")?;

    let status = match cli.command {
        Commands::Manifest {
            symbols,
            crumb,
            cookie,
            out,
            start,
            end,
            interval,
        } => run_manifest(&config, symbols, crumb, cookie, out, start, end, interval)?,
        Commands::Fetch {
            manifest,
            out,
            concurrency,
            retries,
            timeout,
            level,
            min_interval_ms,
            run_timeout,
            report,
        } => {
            let mut config = config;
            let f = &mut config.fetch;
            f.concurrency = concurrency.unwrap_or(f.concurrency);
            f.retries = retries.unwrap_or(f.retries);
            f.timeout_secs = timeout.unwrap_or(f.timeout_secs);
            f.level = level.unwrap_or(f.level);
            f.min_request_interval_ms = min_interval_ms.unwrap_or(f.min_request_interval_ms);
            f.run_timeout_secs = run_timeout.or(f.run_timeout_secs);
            if let Some(m) = manifest {
                config.paths.manifest = m;
            }
            if let Some(o) = out {
                config.paths.dumps = o;
            }
            config.validate()?;
            run_fetch_cmd(&config, report.as_deref())?
        }
        Commands::Consolidate {
            dumps,
            out,
            format,
            hint,
            strict,
            report,
        } => {
            let dumps = dumps.unwrap_or_else(|| config.paths.dumps.clone());
            let out = out.unwrap_or_else(|| config.paths.table.clone());
            let format = format
                .or_else(|| TableFormat::from_path(&out))
                .unwrap_or(config.consolidate.format);
            run_consolidate_cmd(&dumps, &out, format, hint, strict, report.as_deref())?
        }
        Commands::Head {
            dump,
            rows,
            bytes,
            parsed,
            hint,
        } => run_head(&dump, rows, bytes, parsed, hint)?,
        Commands::Store { action } => match action {
            StoreAction::Status { dumps } => {
                run_store_status(&dumps.unwrap_or_else(|| config.paths.dumps.clone()))?
            }
        },
    };

    if !status.is_success() {
        std::process::exit(i32::from(status.code()));
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Set the returned flag on Ctrl-C. A second Ctrl-C exits immediately.
fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);

    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "Ctrl-C handler unavailable");
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("\nInterrupted: finishing in-flight requests (Ctrl-C again to abort)");
            info!("received Ctrl-C, no new fetches will start");
            handler_flag.store(true, Ordering::SeqCst);

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });

    flag
}

fn parse_date(raw: &str, flag: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("{flag} must be YYYY-MM-DD, got '{raw}'"))
}

#[allow(clippy::too_many_arguments)]
fn run_manifest(
    config: &PipelineConfig,
    symbols: Vec<String>,
    crumb: Option<String>,
    cookie: Option<String>,
    out: Option<PathBuf>,
    start: Option<String>,
    end: Option<String>,
    interval: Interval,
) -> Result<ExitStatus> {
    // Credentials are checked before anything touches the filesystem.
    let credentials = Credentials::resolve(crumb, cookie)?;

    let today = Utc::now().date_naive();
    let default = FetchWindow::trailing_year(today);
    let start = start
        .as_deref()
        .map(|s| parse_date(s, "--start"))
        .transpose()?
        .unwrap_or(default.start);
    let end = end
        .as_deref()
        .map(|s| parse_date(s, "--end"))
        .transpose()?
        .unwrap_or(default.end);
    let window = FetchWindow::new(start, end, interval)?;

    let manifest = Manifest::new(out.unwrap_or_else(|| config.paths.manifest.clone()));
    let report = manifest.append(&symbols, &credentials, window, Utc::now())?;

    println!(
        "Manifest {}: {} added, {} already requested today",
        report.path.display(),
        report.written.len(),
        report.already_present.len()
    );
    if !report.already_present.is_empty() {
        let names: Vec<&str> = report.already_present.iter().map(|s| s.as_str()).collect();
        println!("  unchanged: {}", names.join(", "));
    }
    Ok(ExitStatus::Success)
}

fn run_fetch_cmd(config: &PipelineConfig, report: Option<&Path>) -> Result<ExitStatus> {
    let manifest = Manifest::new(&config.paths.manifest);
    let store = DumpStore::new(&config.paths.dumps);
    let options = FetchOptions::from_config(&config.fetch);
    let provider = YahooProvider::new(config.fetch.timeout())?;
    let cancel = install_interrupt_flag();

    let summary = run_fetch(
        &manifest,
        &store,
        &provider,
        &options,
        &StdoutProgress,
        Some(&cancel),
    )?;

    if let Some(path) = report {
        write_report(path, &summary)?;
        println!("Report written to: {}", path.display());
    }
    Ok(summary.exit_status())
}

fn run_consolidate_cmd(
    dumps: &Path,
    out: &Path,
    format: TableFormat,
    hint: Option<DumpFormat>,
    strict: bool,
    report: Option<&Path>,
) -> Result<ExitStatus> {
    let store = DumpStore::new(dumps);
    let options = ConsolidateOptions {
        format,
        hint,
        max_payload_bytes: None,
    };
    let summary = run_consolidate(&store, out, &options)?;

    println!(
        "{} file written: {} ({} rows, {} symbols, {})",
        summary.format,
        summary.output.display(),
        summary.rows,
        summary.included.len(),
        format_size(summary.bytes)
    );
    for skipped in &summary.skipped {
        eprintln!("  skipped {}: {}", skipped.symbol, skipped.reason);
    }

    if let Some(path) = report {
        write_report(path, &summary)?;
    }
    Ok(summary.exit_status(strict))
}

fn run_head(
    dump: &Path,
    rows: usize,
    bytes: Option<u64>,
    parsed: bool,
    hint: Option<DumpFormat>,
) -> Result<ExitStatus> {
    if !parsed && hint.is_some() {
        bail!("--hint only applies with --parsed");
    }

    if parsed {
        let preview = preview_parsed(dump, rows, hint)?;
        print!("{}", render_records(&preview.records));
        if preview.total_rows > preview.records.len() {
            println!("... {} of {} rows", preview.records.len(), preview.total_rows);
        }
    } else {
        let preview = preview_raw(dump, rows, bytes)?;
        print!("{}", preview.text);
        if !preview.text.ends_with('\n') {
            println!();
        }
        if preview.truncated {
            eprintln!("... (truncated after {} bytes)", preview.bytes);
        }
    }
    Ok(ExitStatus::Success)
}

fn run_store_status(dumps: &Path) -> Result<ExitStatus> {
    if !dumps.exists() {
        println!("Dump directory does not exist: {}", dumps.display());
        return Ok(ExitStatus::Success);
    }

    let store = DumpStore::new(dumps);
    let mut files = store.list()?;
    if files.is_empty() {
        println!("Dump store is empty: {}", dumps.display());
        return Ok(ExitStatus::Success);
    }
    files.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let total: u64 = files.iter().map(|f| f.compressed_bytes).sum();
    println!("Store: {}", dumps.display());
    println!("Dumps: {}", files.len());
    println!("Total size: {}", format_size(total));
    println!();
    println!("{:<12} {:>10}  {:<20}", "Symbol", "Size", "Modified (UTC)");
    println!("{}", "-".repeat(44));
    for f in &files {
        let modified = f
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<12} {:>10}  {:<20}",
            f.symbol.as_str(),
            format_size(f.compressed_bytes),
            modified
        );
    }
    Ok(ExitStatus::Success)
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
