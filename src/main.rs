use anyhow::{Context, Result};
use brfss_pipeline::{
    config::{ConfigError, Dataset, PipelineConfig},
    fetch::HttpSource,
    history::TableHistory,
    pipeline::{Pipeline, RunSummary},
    schema::index::{
        build_var_index, load_seed, read_var_index, suggest_map, write_suggestions, INDEX_FILE,
    },
};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "brfss-pipeline",
    version,
    about = "BRFSS transport archives joined with LAUS labor statistics at state-year grain"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct Common {
    /// Pipeline configuration (YAML)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, normalize, aggregate and merge
    Run {
        #[command(flatten)]
        common: Common,
        /// Explicit years, comma separated
        #[arg(long, value_delimiter = ',')]
        years: Vec<u16>,
        #[arg(long)]
        from: Option<u16>,
        #[arg(long)]
        to: Option<u16>,
        #[arg(long, value_enum, default_value_t = Dataset::All)]
        dataset: Dataset,
        #[arg(long)]
        canonical_map: Option<PathBuf>,
        /// Labor series: local path or http(s) URL
        #[arg(long)]
        labor_source: Option<String>,
        /// Target states, comma separated postal codes
        #[arg(long, value_delimiter = ',')]
        states: Vec<String>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Latest recorded outcome per dataset and year
    Status {
        #[command(flatten)]
        common: Common,
    },
    /// Combine per-year variable metadata into the variable index
    IndexVars {
        #[command(flatten)]
        common: Common,
    },
    /// Propose a canonical map from the variable index
    SuggestMap {
        #[command(flatten)]
        common: Common,
        /// Seed concepts (YAML)
        #[arg(long)]
        seed: PathBuf,
        #[arg(long, default_value = "canonical_map.suggested.yaml")]
        out: PathBuf,
        #[arg(long, default_value = "canonical_map.coverage.csv")]
        coverage: PathBuf,
    },
}

fn load_config(common: &Common) -> Result<PipelineConfig, ConfigError> {
    let mut cfg = PipelineConfig::load(common.config.as_deref())?;
    if let Some(dir) = &common.data_dir {
        cfg.data_dir = dir.clone();
    }
    Ok(cfg)
}

/// Explicit `--years` win; otherwise `--from`/`--to` bound the configured range.
fn requested_years(cfg: &PipelineConfig, years: Vec<u16>, from: Option<u16>, to: Option<u16>) -> Vec<u16> {
    if !years.is_empty() {
        return years;
    }
    if from.is_none() && to.is_none() {
        return cfg.years.clone();
    }
    let configured = cfg.sorted_years();
    let lo = from.or(configured.first().copied()).unwrap_or(1990);
    let hi = to.or(configured.last().copied()).unwrap_or(lo);
    (lo..=hi).collect()
}

fn print_summary(summary: &RunSummary) {
    println!("run {} ({:?})", summary.run_id, summary.dataset);
    for r in &summary.years {
        println!(
            "  {:<6} {} {:<9} rows={:<8} {}",
            r.dataset,
            r.year,
            r.status.as_str(),
            r.rows,
            r.detail
        );
    }
    for n in &summary.notices {
        println!("  notice: {n}");
    }
    for o in &summary.outputs {
        println!("  wrote {o}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,brfss_pipeline=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<ConfigError>() {
            Some(cfg) => {
                error!(error = %cfg, "configuration fault");
                ExitCode::from(2)
            }
            None => {
                error!(error = format!("{e:#}"), "run aborted");
                ExitCode::from(1)
            }
        },
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run {
            common,
            years,
            from,
            to,
            dataset,
            canonical_map,
            labor_source,
            states,
            concurrency,
        } => {
            // ─── 2) layer CLI flags over the file config ─────────────
            let mut cfg = load_config(&common)?;
            cfg.years = requested_years(&cfg, years, from, to);
            if canonical_map.is_some() {
                cfg.canonical_map = canonical_map;
            }
            if labor_source.is_some() {
                cfg.labor.source = labor_source;
            }
            if !states.is_empty() {
                cfg.states = states;
            }
            if let Some(n) = concurrency {
                cfg.concurrency = n;
            }

            let remote = Arc::new(HttpSource::new(Duration::from_secs(cfg.fetch_timeout_secs))?);
            let pipeline = Pipeline::new(cfg, dataset, remote)?;
            info!(?dataset, "startup");

            // ─── 3) run until done or interrupted ────────────────────
            let summary = tokio::select! {
                summary = pipeline.run() => summary?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted; partial files are discarded on the next start");
                    return Ok(ExitCode::from(130));
                }
            };
            print_summary(&summary);
            Ok(ExitCode::from(summary.exit_code()))
        }

        Command::Status { common } => {
            let cfg = load_config(&common)?;
            let ledger = TableHistory::new_outcomes(cfg.layout().history())?;
            let latest = ledger.latest()?;
            if latest.is_empty() {
                println!("no runs recorded under {}", cfg.data_dir.display());
            }
            for ((dataset, year), row) in latest {
                println!(
                    "{:<6} {} {:<9} rows={:<8} {} ({})",
                    dataset,
                    year,
                    row.status.as_str(),
                    row.rows,
                    row.detail,
                    row.recorded_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::IndexVars { common } => {
            let cfg = load_config(&common)?;
            let summary = build_var_index(&cfg.layout().metadata())?;
            println!(
                "indexed {} files, {} unique variables",
                summary.files_indexed, summary.unique_vars
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::SuggestMap {
            common,
            seed,
            out,
            coverage,
        } => {
            let cfg = load_config(&common)?;
            let index = cfg.layout().metadata().join(INDEX_FILE);
            let entries = read_var_index(&index)
                .with_context(|| format!("{} missing; run index-vars first", index.display()))?;
            let suggestions = suggest_map(&entries, &load_seed(&seed)?);
            write_suggestions(&suggestions, &out, &coverage)?;
            println!(
                "{} suggestions written to {} and {}",
                suggestions.len(),
                out.display(),
                coverage.display()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
