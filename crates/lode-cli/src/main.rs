use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lode_engine::{run_dedupe, run_resolve, DedupeOptions, ResolutionProfile, ResolveOptions};
use lode_registry::{CompanyRegistry, HttpRegistry, HttpRegistryConfig, SnapshotRegistry};
use lode_store::{BaselineValidator, FacilityStore, RelationshipStore, StoreError};

#[derive(Debug, Parser)]
#[command(name = "lode")]
#[command(about = "Facility corpus curation: deduplication and company mention resolution")]
struct Cli {
    /// Facility record store root.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Run reports land under this directory.
    #[arg(long, default_value = "reports")]
    reports_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge duplicate facility records within a scope.
    Dedupe {
        /// Restrict the run to one country code.
        #[arg(long)]
        country: Option<String>,
        /// Plan and report without mutating the store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Resolve company mentions against the canonical registry.
    Resolve {
        /// Restrict the run to one country code.
        #[arg(long)]
        country: Option<String>,
        /// Named threshold profile: strict, moderate, permissive, or one
        /// defined in the profiles file.
        #[arg(long, default_value = "moderate")]
        profile: String,
        /// YAML file of operator-tuned profiles. Defaults to a
        /// `profiles.yaml` in the working directory when one exists.
        #[arg(long)]
        profiles_file: Option<PathBuf>,
        /// Score and report without touching the relationship store.
        #[arg(long)]
        dry_run: bool,
        /// Raise the review floor for this invocation.
        #[arg(long)]
        min_confidence: Option<f64>,
        /// Base URL of a live registry service; overrides the snapshot.
        #[arg(long)]
        registry_url: Option<String>,
        /// Local company snapshot (JSON array of canonical companies).
        #[arg(long, default_value = "companies.json")]
        registry_snapshot: PathBuf,
        /// Relationship table path.
        #[arg(long, default_value = "relationships.json")]
        relationships: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 0 = success, 1 = input/validation failure, 2 = storage I/O failure.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return match store_err {
                StoreError::Io(_) => 2,
                StoreError::Malformed { .. }
                | StoreError::Validation { .. }
                | StoreError::Encode { .. } => 1,
            };
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return 2;
        }
    }
    1
}

async fn run(cli: Cli) -> Result<()> {
    let store = FacilityStore::new(&cli.data_dir);

    match cli.command {
        Commands::Dedupe { country, dry_run } => {
            let options = DedupeOptions {
                scope: country,
                dry_run,
                reports_root: cli.reports_dir.clone(),
            };
            let summary = run_dedupe(&store, &BaselineValidator, &options).await?;
            println!(
                "dedupe complete: run_id={} scanned={} groups={} merged={} skipped={} reports={}",
                summary.run_id,
                summary.scanned,
                summary.group_count,
                summary.merged_records,
                summary.skipped_records,
                summary.reports_dir
            );
        }
        Commands::Resolve {
            country,
            profile,
            profiles_file,
            dry_run,
            min_confidence,
            registry_url,
            registry_snapshot,
            relationships,
        } => {
            let profiles_file = profiles_file.or_else(|| {
                let default = PathBuf::from("profiles.yaml");
                default.exists().then_some(default)
            });
            let profile = ResolutionProfile::load_named(&profile, profiles_file.as_deref())?;
            let registry: Arc<dyn CompanyRegistry> = match registry_url {
                Some(url) => Arc::new(HttpRegistry::new(HttpRegistryConfig::new(url))?),
                None => Arc::new(SnapshotRegistry::from_path(&registry_snapshot)?),
            };

            let mut options = ResolveOptions::new(profile);
            options.scope = country;
            options.dry_run = dry_run;
            options.min_confidence = min_confidence;
            options.reports_root = cli.reports_dir.clone();

            let relationship_store = RelationshipStore::new(relationships);
            let summary = run_resolve(&store, &relationship_store, registry, &options).await?;
            println!(
                "resolve complete: run_id={} mentions={} auto={} review={} pending={} reports={}",
                summary.run_id,
                summary.mentions,
                summary.auto_accepted,
                summary.review,
                summary.pending,
                summary.reports_dir
            );
        }
    }

    Ok(())
}
