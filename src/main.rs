use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod aggregate;
mod config;
mod correlate;
mod db;
mod drought;
mod export;
mod geotiff;
mod models;
mod pipeline;
mod raster;
mod region;
mod report;
mod source;
mod stats;
mod trend;

use config::{Config, Overrides};
use export::{ExportContext, ExportOutcome};
use geotiff::GeoTiffOptions;
use models::RunInfo;
use source::{ManifestSource, RasterSource};

#[derive(Parser)]
#[command(name = "sudan-et-drought")]
#[command(about = "Monthly evapotranspiration, SETI drought index and trend analysis", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and write every export
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        start_year: Option<i32>,
        #[arg(long)]
        end_year: Option<i32>,
        #[arg(long)]
        resolution: Option<f64>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Also store the run's tables in Postgres (DATABASE_URL)
        #[arg(long)]
        publish: bool,
    },
    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Create or upgrade the results schema
    InitDb,
    /// List recently published runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn load_inputs(config: &Config) -> anyhow::Result<pipeline::Inputs> {
    let sources = &config.sources;
    let national = region::load_national(&sources.national_boundary, &sources.country)?;
    let admin = region::load_admin(&sources.admin_boundaries, &sources.region_name_property)?;
    info!(country = %national.name, regions = admin.len(), "boundaries loaded");

    let et = ManifestSource::from_manifest("et", &sources.et.manifest, sources.et.valid_range)?;
    let precipitation = match &sources.precipitation {
        Some(p) => Some(Box::new(ManifestSource::from_manifest(
            "precipitation",
            &p.manifest,
            p.valid_range,
        )?) as Box<dyn RasterSource>),
        None => None,
    };

    Ok(pipeline::Inputs {
        national,
        admin,
        et: Box::new(et),
        precipitation,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            start_year,
            end_year,
            resolution,
            out_dir,
            publish,
        } => {
            let mut settings = Config::load(config.as_deref())?;
            settings.apply(Overrides {
                start_year,
                end_year,
                resolution,
                out_dir,
            });
            settings.validate()?;

            let run_info = RunInfo {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
            };
            info!(run = %run_info.id, "starting run");

            let inputs = load_inputs(&settings)?;
            let pipeline_config = settings.clone();
            let products = tokio::task::spawn_blocking(move || {
                pipeline::run(&pipeline_config, &inputs)
            })
            .await??;
            let products = Arc::new(products);

            let context = Arc::new(ExportContext {
                out_dir: settings.export.out_dir.clone(),
                geotiff: GeoTiffOptions {
                    epsg: settings.grid.epsg,
                    nodata: settings.grid.nodata,
                },
                start_year: settings.period.start_year,
                end_year: settings.period.end_year,
            });
            let mut report = export::export_all(Arc::clone(&products), Arc::clone(&context)).await;

            if publish {
                let published = match connect().await {
                    Ok(pool) => db::publish_run(&pool, &run_info, &settings, &products).await,
                    Err(err) => Err(err),
                };
                report.record(match published {
                    Ok(()) => ExportOutcome::written("database", None),
                    Err(err) => ExportOutcome::failed("database", &err),
                });
            }

            let summary_path = context.out_dir.join("run_summary.json");
            if let Err(err) = export::write_summary(&summary_path, &run_info, &products, &report) {
                warn!(error = %format!("{err:#}"), "run summary not written");
            }

            let failed = report.failed_count();
            if failed > 0 {
                anyhow::bail!(
                    "{failed} of {} exports failed, see log for details",
                    report.outcomes.len()
                );
            }
            println!(
                "Run {} complete: {} months, outputs in {}.",
                run_info.id,
                products.month_count,
                context.out_dir.display()
            );
        }
        Commands::CheckConfig { config } => {
            let settings = Config::load(config.as_deref())?;
            settings.validate()?;
            println!("{}", toml::to_string_pretty(&settings)?);
        }
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Runs { limit } => {
            let pool = connect().await?;
            let runs = db::fetch_runs(&pool, limit).await?;

            if runs.is_empty() {
                println!("No published runs.");
                return Ok(());
            }

            println!("Recent runs:");
            for run in runs {
                println!(
                    "- {} started {} covering {} to {} ({} months, {} regions)",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M UTC"),
                    run.first_month.format("%Y-%m"),
                    run.last_month.format("%Y-%m"),
                    run.month_count,
                    run.region_count
                );
            }
        }
    }

    Ok(())
}
