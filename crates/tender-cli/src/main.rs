use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tender_core::{TenderStatus, TenderType};
use tender_storage::JsonMetadataStore;
use tender_sync::{render_run_list, render_run_summary, OutputFormat, PgStore, SyncConfig};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tender-cli")]
#[command(about = "Tender notice extraction pipeline")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    scrape: ScrapeArgs,
}

impl Cli {
    /// Bare flags mean `scrape`; they cannot be combined with another subcommand.
    fn into_command(self) -> Result<Commands> {
        match self.command {
            None => Ok(Commands::Scrape(self.scrape)),
            Some(command) if self.scrape == ScrapeArgs::default() => Ok(command),
            Some(_) => bail!("scrape flags must follow `scrape` or be given without a subcommand"),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the listing, extract detail pages and persist records (default).
    Scrape(ScrapeArgs),
    /// Apply PostgreSQL migrations.
    Migrate,
    /// List stored runs with their counters.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Args)]
struct ScrapeArgs {
    /// Stop dispatching after this many tenders.
    #[arg(long)]
    limit: Option<usize>,
    /// Keyword search.
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    tender_type: Option<String>,
    #[arg(long)]
    organization: Option<String>,
    #[arg(long)]
    min_value: Option<f64>,
    #[arg(long)]
    max_value: Option<f64>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Seconds between navigations per worker.
    #[arg(long)]
    rate_limit: Option<f64>,
    #[arg(long)]
    max_retries: Option<usize>,
    /// json, ndjson, parquet or postgres.
    #[arg(long)]
    format: Option<OutputFormat>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Run everything but persist no records.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    save_raw_pages: bool,
    #[arg(long)]
    keep_raw_snippet: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_tender_type(value: &str) -> Result<TenderType> {
    match TenderType::parse(value) {
        TenderType::Unknown => bail!("unrecognized --tender-type {value:?} (goods, works or services)"),
        kind => Ok(kind),
    }
}

fn parse_status(value: &str) -> Result<TenderStatus> {
    match TenderStatus::parse(value) {
        TenderStatus::Unknown => {
            bail!("unrecognized --status {value:?} (in_progress, awarded, closed or cancelled)")
        }
        status => Ok(status),
    }
}

/// CLI flags are the last configuration layer.
fn apply_scrape_args(config: &mut SyncConfig, args: ScrapeArgs) -> Result<()> {
    if let Some(limit) = args.limit {
        config.limit = Some(limit);
    }
    if let Some(keyword) = args.search {
        config.filters.keyword = Some(keyword);
    }
    if let Some(status) = args.status {
        config.filters.tender_status = Some(parse_status(&status)?);
    }
    if let Some(kind) = args.tender_type {
        config.filters.tender_type = Some(parse_tender_type(&kind)?);
    }
    if let Some(organization) = args.organization {
        config.filters.organization = Some(organization);
    }
    if args.min_value.is_some() {
        config.filters.min_value = args.min_value;
    }
    if args.max_value.is_some() {
        config.filters.max_value = args.max_value;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.rate_limit_secs = rate_limit;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    config.dry_run |= args.dry_run;
    config.save_raw_pages |= args.save_raw_pages;
    config.keep_raw_snippet |= args.keep_raw_snippet;
    Ok(())
}

async fn scrape(mut config: SyncConfig, args: ScrapeArgs) -> Result<()> {
    apply_scrape_args(&mut config, args)?;
    config.validate().context("invalid configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight tenders");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = tender_sync::run_from_config(config, shutdown_rx).await?;
    print!(
        "{}",
        render_run_summary(&report.metadata, &report.metadata_locations)
    );
    Ok(())
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgStore::connect(url).await?.migrate().await?;
    println!("migrations applied");
    Ok(())
}

async fn runs(config: &SyncConfig, limit: usize) -> Result<()> {
    let mut runs = match (config.output_format, config.database_url.as_deref()) {
        (OutputFormat::Postgres, Some(url)) => {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            PgStore::connect(url).await?.recent_runs(limit).await?
        }
        _ => JsonMetadataStore::new(config.metadata_dir.clone())
            .recent_runs()
            .await
            .with_context(|| format!("reading runs from {}", config.metadata_dir.display()))?,
    };
    runs.truncate(limit);
    print!("{}", render_run_list(&runs));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let command = cli.into_command()?;
    let config = SyncConfig::from_env().context("loading configuration")?;
    match command {
        Commands::Scrape(args) => scrape(config, args).await,
        Commands::Migrate => migrate(&config).await,
        Commands::Runs { limit } => runs(&config, limit).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_flags_mean_scrape() {
        let cli = Cli::try_parse_from([
            "tender-cli",
            "--limit",
            "5",
            "--search",
            "road",
            "--tender-type",
            "works",
            "--format",
            "ndjson",
            "--dry-run",
        ])
        .expect("parse");
        assert!(cli.command.is_none());

        let mut config = SyncConfig::default();
        apply_scrape_args(&mut config, cli.scrape).expect("apply");
        assert_eq!(config.limit, Some(5));
        assert_eq!(config.filters.keyword.as_deref(), Some("road"));
        assert_eq!(config.filters.tender_type, Some(TenderType::Works));
        assert_eq!(config.output_format, OutputFormat::Ndjson);
        assert!(config.dry_run);
    }

    #[test]
    fn scrape_subcommand_accepts_the_same_flags() {
        let cli = Cli::try_parse_from([
            "tender-cli",
            "--log-level",
            "debug",
            "scrape",
            "--status",
            "In Progress",
            "--min-value",
            "1000",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, "debug");
        let Some(Commands::Scrape(args)) = cli.command else {
            panic!("expected scrape subcommand");
        };
        let mut config = SyncConfig::default();
        apply_scrape_args(&mut config, args).expect("apply");
        assert_eq!(config.filters.tender_status, Some(TenderStatus::InProgress));
        assert_eq!(config.filters.min_value, Some(1000.0));
    }

    #[test]
    fn log_level_is_accepted_before_any_subcommand() {
        for subcommand in ["runs", "migrate", "scrape"] {
            let cli = Cli::try_parse_from(["tender-cli", "--log-level", "debug", subcommand])
                .unwrap_or_else(|err| panic!("{subcommand}: {err}"));
            assert_eq!(cli.log_level, "debug");
            assert!(cli.into_command().is_ok());
        }
        let cli = Cli::try_parse_from(["tender-cli", "runs", "--log-level", "warn"]).expect("parse");
        assert_eq!(cli.log_level, "warn");
        assert!(matches!(
            cli.into_command().expect("command"),
            Commands::Runs { limit: 20 }
        ));
    }

    #[test]
    fn bare_scrape_flags_do_not_mix_with_other_subcommands() {
        let cli = Cli::try_parse_from(["tender-cli", "--limit", "5", "runs"]).expect("parse");
        assert!(cli.into_command().is_err());

        let cli = Cli::try_parse_from(["tender-cli", "--dry-run"]).expect("parse");
        let Commands::Scrape(args) = cli.into_command().expect("command") else {
            panic!("expected scrape");
        };
        assert!(args.dry_run);
    }

    #[test]
    fn unknown_filter_values_are_rejected() {
        let mut config = SyncConfig::default();
        let args = ScrapeArgs {
            tender_type: Some("consulting".into()),
            ..ScrapeArgs::default()
        };
        assert!(apply_scrape_args(&mut config, args).is_err());
        assert!(Cli::try_parse_from(["tender-cli", "--format", "csv"]).is_err());
    }

    #[test]
    fn out_of_range_flags_fail_validation() {
        let mut config = SyncConfig::default();
        let args = ScrapeArgs {
            concurrency: Some(50),
            ..ScrapeArgs::default()
        };
        apply_scrape_args(&mut config, args).expect("apply");
        assert!(config.validate().is_err());
    }
}
