use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relml_core::{Domain, ImageSource};
use relml_pipeline::{
    fetch_plan, status_markdown, write_image_reports, write_import_reports, CsvImportPipeline,
    FileOutcome, ImageIndexer, PipelineConfig,
};
use relml_storage::{ImageBlobStore, MemoryStore, PgStore, Store};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "relml")]
#[command(about = "Real-estate listing ingestion ledger and staging pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every CSV under a directory through the ingestion ledger.
    ImportCsv {
        root: PathBuf,
        /// YAML schema overriding RELML_SCHEMA_PATH.
        #[arg(long)]
        schema: Option<PathBuf>,
        /// Validate and count rows without writing anything.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_reports: bool,
    },
    /// Index image directories or zip archives into the blob store.
    IndexImages {
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
        /// Defaults to the SALE/RENTAL name found in each bundle path.
        #[arg(long, value_enum)]
        domain: Option<DomainArg>,
        #[arg(long, value_enum, default_value_t = SourceArg::Manual)]
        source: SourceArg,
        #[arg(long)]
        no_reports: bool,
    },
    /// Print ledger, staging and image status as markdown.
    Status,
    /// Print re-fetch advice for listings with a known lifecycle as JSON lines.
    FetchPlan,
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DomainArg {
    Sale,
    Rental,
}

impl From<DomainArg> for Domain {
    fn from(arg: DomainArg) -> Self {
        match arg {
            DomainArg::Sale => Domain::Sale,
            DomainArg::Rental => Domain::Rental,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Manual,
    Automation,
}

impl From<SourceArg> for ImageSource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Manual => ImageSource::Manual,
            SourceArg::Automation => ImageSource::Automation,
        }
    }
}

async fn open_store(config: &PipelineConfig) -> Result<Box<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.max_connections)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Box::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store for this run");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

/// Read-only commands over an in-memory store would only ever report an empty ledger.
fn require_database(config: &PipelineConfig, command: &str) -> Result<()> {
    if !config.is_persistent() {
        bail!("DATABASE_URL must be set to run {command}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command {
        Commands::ImportCsv {
            root,
            schema,
            dry_run,
            no_reports,
        } => {
            if schema.is_some() {
                config.schema_path = schema;
            }
            let schema = config.load_schema()?;
            let store = open_store(&config).await?;
            let summary = CsvImportPipeline::new(store.as_ref(), schema)
                .dry_run(dry_run)
                .run(&root)
                .await?;

            for file in &summary.files {
                let error = file
                    .error
                    .as_ref()
                    .map(|e| format!(" error={}: {}", e.kind, e.message))
                    .unwrap_or_default();
                println!(
                    "{} {}: total={} clean={} quarantined={} conflicting={}{}",
                    file.outcome.as_str(),
                    file.origin_path,
                    file.counts.total,
                    file.counts.clean,
                    file.counts.quarantined,
                    file.counts.conflicting,
                    error
                );
            }
            println!(
                "import complete: run_id={} files={} ingested={} skipped={} failed={} already_ingested={} clean={} quarantined={} conflicting={}",
                summary.run_id,
                summary.files.len(),
                summary.count(FileOutcome::Ingested),
                summary.count(FileOutcome::Skipped),
                summary.count(FileOutcome::Failed),
                summary.count(FileOutcome::AlreadyIngested),
                summary.totals.clean,
                summary.totals.quarantined,
                summary.totals.conflicting
            );
            if config.reports_enabled && !no_reports && !dry_run {
                let dir = write_import_reports(&config.reports_root(), &summary, store.as_ref())
                    .await?;
                println!("reports: {}", dir.display());
            }
        }
        Commands::IndexImages {
            bundles,
            domain,
            source,
            no_reports,
        } => {
            let store = open_store(&config).await?;
            let indexer = ImageIndexer::new(
                store.as_ref(),
                ImageBlobStore::new(config.images_root()),
                source.into(),
            );
            if !config.is_persistent() {
                warn!("no listings are staged in an in-memory store; orphan marking is skipped");
            }
            for bundle in &bundles {
                let mut report = indexer.index_bundle(bundle, domain.map(Domain::from)).await?;
                if config.is_persistent() {
                    report.orphans_marked = indexer.mark_orphans().await?;
                }
                println!(
                    "indexed {}: domain={} entries={} indexed={} duplicates={} unparseable={} read_errors={} orphans_marked={}",
                    report.bundle,
                    report.domain,
                    report.entries_seen,
                    report.indexed,
                    report.duplicates,
                    report.unparseable,
                    report.read_errors,
                    report.orphans_marked
                );
                if config.reports_enabled && !no_reports {
                    let dir =
                        write_image_reports(&config.reports_root(), &report, store.as_ref())
                            .await?;
                    println!("reports: {}", dir.display());
                }
            }
        }
        Commands::Status => {
            require_database(&config, "status")?;
            let store = open_store(&config).await?;
            print!("{}", status_markdown(store.as_ref()).await?);
        }
        Commands::FetchPlan => {
            require_database(&config, "fetch-plan")?;
            let store = open_store(&config).await?;
            for entry in fetch_plan(store.as_ref()).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url, config.max_connections)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}
