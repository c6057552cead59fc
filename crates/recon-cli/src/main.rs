use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use recon_core::{EntityType, SyncMode, SyncSummary};
use recon_entities::EntityCatalogue;
use recon_storage::BackoffPolicy;
use recon_sync::{Orchestrator, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "recon-cli")]
#[command(about = "Upstream reconciliation engine")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG applies otherwise
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one entity, or every enabled entity in dependency order
    Sync(SyncArgs),
    /// Recompute applicant statistics for live vacancies
    Aggregate {
        #[arg(long)]
        bucket_size: Option<i64>,
        #[arg(long)]
        initial_key: Option<i64>,
    },
    /// Print the buckets a sync of one entity would visit
    Plan {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        bucket_size: Option<i64>,
    },
    /// List entity types in sync order
    Entities,
    /// Apply downstream schema migrations
    Migrate,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    entity: Option<String>,
    #[arg(long)]
    bucket_size: Option<i64>,
    /// First key of the first bucket; overrides any stored checkpoint
    #[arg(long, requires = "entity")]
    resume_from: Option<i64>,
    #[arg(long)]
    create_only: bool,
    /// Retries after a transient store failure; each retry resumes from the checkpoint
    #[arg(long, default_value_t = 0)]
    retries: usize,
}

/// Cancels the run between buckets on Ctrl-C.
fn watch_interrupt(orchestrator: &Orchestrator) {
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current bucket");
            cancel.cancel();
        }
    });
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,sqlx=warn".into()),
        1 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(config, args).await?,
        Commands::Aggregate {
            bucket_size,
            initial_key,
        } => {
            let aggregator = recon_sync::aggregator_from_config(&config).await?;
            let summary = aggregator
                .aggregate(bucket_size.unwrap_or(config.bucket_size), initial_key)
                .await
                .context("aggregating statistics")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Plan {
            entity,
            bucket_size,
        } => {
            let orchestrator = recon_sync::orchestrator_from_config(&config).await?;
            let entity = orchestrator.resolve(&entity)?;
            let size = bucket_size.unwrap_or(config.bucket_size);
            let plan = orchestrator.plan(entity, size, None).await?;
            println!("{entity}: {} bucket(s) of {size}", plan.len());
            for bucket in plan {
                println!(
                    "  {}..={} (keys {:?}..={:?})",
                    bucket.start, bucket.end, bucket.actual_min, bucket.actual_max
                );
            }
        }
        Commands::Entities => {
            let catalogue = EntityCatalogue::standard().context("building entity catalogue")?;
            for (position, definition) in catalogue.definitions().iter().enumerate() {
                println!(
                    "{:>2} {:<20} {:<14} {:<9} {}",
                    position + 1,
                    definition.entity_type().as_str(),
                    format!("{:?}", definition.tier()),
                    format!("{:?}", definition.mode()),
                    definition.source_name()
                );
            }
        }
        Commands::Migrate => {
            let pool = recon_storage::connect_pool(&config.database_url, config.max_connections)
                .await
                .context("connecting to the downstream database")?;
            recon_storage::postgres::run_migrations(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn sync_once(
    orchestrator: &mut Orchestrator,
    args: &SyncArgs,
    bucket_size: i64,
    resume_from: Option<i64>,
) -> std::result::Result<Vec<(EntityType, SyncSummary)>, (bool, anyhow::Error)> {
    let Some(name) = &args.entity else {
        return orchestrator
            .sync_all(bucket_size)
            .await
            .map_err(|err| (err.is_retryable(), err.into()));
    };
    let entity = orchestrator
        .resolve(name)
        .map_err(|err| (false, err.into()))?;
    let direct = args.bucket_size.is_none()
        && resume_from.is_none()
        && orchestrator
            .catalogue()
            .get_type(entity)
            .is_some_and(|definition| definition.mode() == SyncMode::Direct);
    let result = if direct {
        orchestrator.sync_entity_direct(entity).await
    } else {
        orchestrator.sync_entity(entity, bucket_size, resume_from).await
    };
    result
        .map(|summary| vec![(entity, summary)])
        .map_err(|err| (err.is_retryable(), err.into()))
}

async fn run_sync(mut config: SyncConfig, args: SyncArgs) -> Result<()> {
    config.create_only |= args.create_only;
    let bucket_size = args.bucket_size.unwrap_or(config.bucket_size);
    let mut orchestrator = recon_sync::orchestrator_from_config(&config).await?;
    watch_interrupt(&orchestrator);
    info!(run_id = %orchestrator.run_id(), create_only = config.create_only, "sync starting");

    let policy = BackoffPolicy {
        max_retries: args.retries,
        ..BackoffPolicy::default()
    };
    let mut attempt = 0;
    let completed = loop {
        let resume_from = if attempt == 0 { args.resume_from } else { None };
        match sync_once(&mut orchestrator, &args, bucket_size, resume_from).await {
            Ok(completed) => break completed,
            Err((true, err)) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt = attempt + 1, ?delay, error = %err, "transient failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err((_, err)) => return Err(err.context("sync failed")),
        }
    };

    for (entity, summary) in completed {
        println!("{entity}: {summary}");
    }
    Ok(())
}
