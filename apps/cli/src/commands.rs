//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use pricewatch_core::{
    CrawlPhaseReport, DetectionReport, ProgressReporter, RunOrchestrator, RunReport,
    SilentProgress, TargetOutcome, format_amount,
};
use pricewatch_crawler::HttpPageSource;
use pricewatch_notify::{ConfiguredChannel, LogChannel, NotificationChannel};
use pricewatch_shared::{
    AppConfig, CrawlConfig, DetectionConfig, config_file_path, init_config, load_config,
    load_config_from, validate_targets,
};
use pricewatch_storage::{PriceStore, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PriceWatch: track catalog prices and flag unusual movements.
#[derive(Parser)]
#[command(
    name = "pricewatch",
    version,
    about = "Crawl catalog listings, keep price history, and notify on price movements.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.pricewatch/pricewatch.toml.
    #[arg(long, global = true, env = "PRICEWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl every configured target and record prices.
    Crawl,

    /// Evaluate tracked items and notify on price movements.
    Detect,

    /// Crawl, then detect (detection is skipped if any target failed).
    Run,

    /// Run immediately and then on the configured interval until Ctrl+C.
    Watch {
        /// Override `[schedule] interval_secs`.
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Print recorded observations, newest first.
    Report {
        /// Show at most this many rows.
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Delete all price history (items and brands are kept).
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Insert a backdated observation to exercise detection.
    SeedPrice {
        /// Item detail URL (defaults to the first tracked item).
        #[arg(long)]
        url: Option<String>,

        /// Price to record.
        #[arg(long)]
        amount: f64,

        /// How many days in the past to date the observation.
        #[arg(long, default_value = "1")]
        days_ago: u32,
    },

    /// Database management.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Database subcommands.
#[derive(Subcommand)]
pub(crate) enum DbAction {
    /// Create the database and apply migrations.
    Init,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "pricewatch=info",
        1 => "pricewatch=debug",
        _ => "pricewatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Crawl => cmd_crawl(&resolve_config(config_path)?).await,
        Command::Detect => cmd_detect(&resolve_config(config_path)?).await,
        Command::Run => cmd_run(&resolve_config(config_path)?).await,
        Command::Watch { interval_secs } => {
            cmd_watch(&resolve_config(config_path)?, interval_secs).await
        }
        Command::Report { limit } => cmd_report(&resolve_config(config_path)?, limit).await,
        Command::Reset { yes } => cmd_reset(&resolve_config(config_path)?, yes).await,
        Command::SeedPrice {
            url,
            amount,
            days_ago,
        } => cmd_seed_price(&resolve_config(config_path)?, url.as_deref(), amount, days_ago).await,
        Command::Db { action } => match action {
            DbAction::Init => cmd_db_init(&resolve_config(config_path)?).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(force),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<Storage> {
    let path = config.database_path()?;
    info!(path = %path.display(), "opening database");
    Ok(Storage::open(&path).await?)
}

fn build_orchestrator<'a, C: NotificationChannel>(
    config: &AppConfig,
    store: &'a Storage,
    channel: &'a C,
) -> Result<RunOrchestrator<'a, Storage, HttpPageSource, C>> {
    let crawl = CrawlConfig::from(config);
    let source = HttpPageSource::new(&crawl)?;
    Ok(RunOrchestrator::new(
        store,
        source,
        channel,
        config.targets.clone(),
        crawl,
        DetectionConfig::from(config),
    ))
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn cmd_crawl(config: &AppConfig) -> Result<()> {
    validate_targets(config)?;
    let store = open_store(config).await?;
    let mut orchestrator = build_orchestrator(config, &store, &LogChannel)?;

    let reporter = CliProgress::new();
    let report = orchestrator.crawl_phase(&reporter).await;
    reporter.finish();

    print_crawl_report(&report);
    if !report.is_success() {
        return Err(eyre!(
            "crawl failed for: {}",
            report.failed_targets().join(", ")
        ));
    }
    Ok(())
}

async fn cmd_detect(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    let channel = ConfiguredChannel::from_config(&config.notify)?;
    let orchestrator = build_orchestrator(config, &store, &channel)?;
    info!(channel = channel.name(), "starting detection pass");

    let reporter = CliProgress::new();
    let result = orchestrator.detection_phase(&reporter).await;
    reporter.finish();

    print_detection_report(&result?);
    Ok(())
}

async fn cmd_run(config: &AppConfig) -> Result<()> {
    validate_targets(config)?;
    let store = open_store(config).await?;
    let channel = ConfiguredChannel::from_config(&config.notify)?;
    let mut orchestrator = build_orchestrator(config, &store, &channel)?;

    let reporter = CliProgress::new();
    let result = orchestrator.run_once(&reporter).await;
    reporter.finish();

    let report = result?;
    print_run_report(&report);
    if !report.crawl.is_success() {
        return Err(eyre!(
            "crawl failed for: {}; detection skipped",
            report.crawl.failed_targets().join(", ")
        ));
    }
    Ok(())
}

async fn cmd_watch(config: &AppConfig, interval_override: Option<u64>) -> Result<()> {
    validate_targets(config)?;
    let store = open_store(config).await?;
    let channel = ConfiguredChannel::from_config(&config.notify)?;
    let mut orchestrator = build_orchestrator(config, &store, &channel)?;

    let interval_secs = interval_override
        .unwrap_or(config.schedule.interval_secs)
        .max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs,
        channel = channel.name(),
        targets = config.targets.len(),
        "watching. Press Ctrl+C to stop."
    );

    let mut runs = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                runs += 1;
                match orchestrator.run_once(&SilentProgress).await {
                    Ok(report) => log_run_report(&report),
                    Err(e) => error!(error = %e, "run failed; continuing on schedule"),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!(runs, "watch stopped");
    Ok(())
}

fn log_run_report(report: &RunReport) {
    match &report.detection {
        Some(detection) => info!(
            run_id = %report.run_id,
            ingested = report.crawl.total_ingested(),
            notified = detection.notified,
            delivery_failures = detection.delivery_failures,
            elapsed_secs = report.elapsed.as_secs(),
            "run complete"
        ),
        None => warn!(
            run_id = %report.run_id,
            failed = ?report.crawl.failed_targets(),
            "run complete without detection"
        ),
    }
}

// ---------------------------------------------------------------------------
// Administrative commands
// ---------------------------------------------------------------------------

async fn cmd_report(config: &AppConfig, limit: Option<u32>) -> Result<()> {
    let store = open_store(config).await?;
    let rows = store.observation_report(limit).await?;
    let counts = store.counts().await?;

    println!();
    println!("  Total records: {}", counts.observations);
    println!("  {}", "-".repeat(95));
    println!(
        "  {:<20} | {:<40} | {:>15} | OBSERVED",
        "BRAND", "ITEM", "PRICE"
    );
    println!("  {}", "-".repeat(95));
    for row in &rows {
        println!(
            "  {:<20} | {:<40} | {:>15} | {}",
            row.brand_name,
            truncate_name(&row.item_name, 40),
            format_amount(row.amount, 2),
            row.observed_at.format("%Y-%m-%d %H:%M")
        );
    }
    if limit.is_some_and(|limit| u64::from(limit) < counts.observations) {
        println!("  ... showing {} of {}", rows.len(), counts.observations);
    }

    println!();
    for target in &config.targets {
        match store.last_crawl_run(&target.label).await? {
            Some(run) => {
                let summary = run
                    .stats_json
                    .as_deref()
                    .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
                    .map(|stats| {
                        format!(
                            "{} items, ended {}",
                            stats["ingested"],
                            stats["stats"]["end"].as_str().unwrap_or("abnormally")
                        )
                    })
                    .unwrap_or_else(|| "unfinished".into());
                println!("  Last crawl {:<20} {}  ({summary})", target.label, run.started_at);
            }
            None => println!("  Last crawl {:<20} never", target.label),
        }
    }
    println!();
    Ok(())
}

async fn cmd_reset(config: &AppConfig, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!(
            "this deletes all price history; re-run with --yes to confirm"
        ));
    }
    let store = open_store(config).await?;
    let removed = store.reset_all_observations().await?;
    println!("Removed {removed} observations. Items and brands are kept.");
    Ok(())
}

async fn cmd_seed_price(
    config: &AppConfig,
    url: Option<&str>,
    amount: f64,
    days_ago: u32,
) -> Result<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(eyre!("amount must be a non-negative number, got {amount}"));
    }

    let store = open_store(config).await?;
    let (item_id, name) = match url {
        Some(url) => store
            .item_by_url(url)
            .await?
            .ok_or_else(|| eyre!("no tracked item with url '{url}'"))?,
        None => store
            .first_item()
            .await?
            .ok_or_else(|| eyre!("no tracked items yet; run `pricewatch crawl` first"))?,
    };

    let observed_at = Utc::now() - chrono::Duration::days(i64::from(days_ago));
    store
        .append_price_observation_at(item_id, amount, observed_at)
        .await?;

    println!(
        "Recorded {} for '{name}' at {}",
        format_amount(amount, 2),
        observed_at.format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

async fn cmd_db_init(config: &AppConfig) -> Result<()> {
    let path = config.database_path()?;
    let store = Storage::open(&path).await?;
    println!(
        "Database ready at {} (schema version {})",
        path.display(),
        store.schema_version().await
    );
    Ok(())
}

fn cmd_config_init(force: bool) -> Result<()> {
    let path = config_file_path()?;
    if path.exists() && !force {
        return Err(eyre!(
            "config already exists at {}; use --force to overwrite",
            path.display()
        ));
    }
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_crawl_report(report: &CrawlPhaseReport) {
    println!();
    for target in &report.targets {
        print_target_line(target);
    }
    println!("  Total ingested: {}", report.total_ingested());
    println!();
}

fn print_target_line(target: &TargetOutcome) {
    let end = target
        .stats
        .end
        .map(|end| end.to_string())
        .unwrap_or_else(|| "aborted".into());
    match &target.error {
        None => println!(
            "  {:<20} {:>4} items ({} new, {} duplicates, {} unreadable), {} pages, {end}",
            target.label,
            target.ingested,
            target.created,
            target.stats.duplicates_skipped,
            target.stats.extraction_failures,
            target.stats.pages_loaded,
        ),
        Some(e) => println!("  {:<20} FAILED after {} items: {e}", target.label, target.ingested),
    }
}

fn print_detection_report(report: &DetectionReport) {
    println!();
    println!("  Evaluated:   {}", report.evaluated);
    println!("  Notified:    {}", report.notified);
    println!("  Unchanged:   {}", report.unchanged);
    println!("  Too new:     {}", report.skipped);
    if report.delivery_failures > 0 {
        println!("  Undelivered: {}", report.delivery_failures);
    }
    println!();
}

fn print_run_report(report: &RunReport) {
    println!();
    println!("  Run {}", report.run_id);
    print_crawl_report(&report.crawl);
    match &report.detection {
        Some(detection) => print_detection_report(detection),
        None => println!("  Detection skipped: crawl phase failed.\n"),
    }
    println!("  Time: {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

/// Shorten `name` to at most `max` characters, marking the cut with `...`.
fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let kept: String = name.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn target_started(&self, label: &str, index: usize, total: usize) {
        self.spinner
            .set_message(format!("Crawling [{index}/{total}] {label}"));
    }

    fn item_ingested(&self, label: &str, count: usize) {
        self.spinner
            .set_message(format!("Crawling {label}: {count} items"));
    }

    fn target_finished(&self, outcome: &TargetOutcome) {
        let status = if outcome.is_success() { "done" } else { "failed" };
        self.spinner
            .println(format!("  {} {status} ({} items)", outcome.label, outcome.ingested));
    }

    fn item_evaluated(&self, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Evaluating [{current}/{total}]"));
    }
}
