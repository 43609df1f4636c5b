use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use product_backfill::{
    BackfillOrchestrator, BatchProgress, Config, EligibilityScanner, OwnerCache, RunPhase, RunSummary,
    TracingEventSink,
};
use product_backfill::store::{DocumentStore, MongoStore};

mod cli;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Scan { sample_limit: None });

    let cfg = Config::from_env();
    let mut options = cfg.backfill_options()?;
    command.apply(&mut options);
    options.validate()?;
    tracing::info!(
        database = %cfg.database_name,
        products = %options.collections.products,
        owners = %options.collections.owners,
        batch_size = options.batch_size,
        policy = %options.policy,
        "Loaded configuration"
    );

    let mongo = MongoStore::connect(&cfg).await?;
    let store: Arc<dyn DocumentStore> = Arc::new(mongo.clone());

    match command {
        Command::Indexes => {
            mongo.ensure_indexes(&options.collections.products).await?;
        }
        Command::Scan { .. } => {
            let cache = Arc::new(OwnerCache::new(
                store.clone(),
                options.collections.owners.clone(),
                options.cache_ttl,
            ));
            let scanner = EligibilityScanner::new(store, cache, options.collections.products.clone());
            let report = scanner.scan(options.sample_limit).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "has_eligible_work": report.has_eligible_work,
                    "stats": report.stats,
                    "candidate_sellers": report
                        .candidates
                        .iter()
                        .map(|c| c.owner_id.as_str())
                        .collect::<std::collections::BTreeSet<_>>(),
                }))?
            );
        }
        Command::Run { skip_indexes, .. } => {
            if !skip_indexes {
                mongo.ensure_indexes(&options.collections.products).await?;
            }
            let mut orchestrator = BackfillOrchestrator::builder()
                .store(store)
                .options(options)
                .events(Arc::new(TracingEventSink))
                .build()?;

            let phase = orchestrator.initialize().await?.phase;
            let summary = if phase == RunPhase::NoEligibleWork {
                RunSummary::from_run(orchestrator.run_state())
            } else {
                let mut report_progress = |progress: &BatchProgress| {
                    tracing::info!(
                        owner_id = %progress.owner_id,
                        batch_index = progress.batch.batch_index,
                        updated = progress.totals.updated,
                        skipped = progress.totals.skipped,
                        errors = progress.totals.errors,
                        has_more = progress.has_more_batches,
                        owners_completed = progress.owners_completed,
                        "Backfill progress"
                    );
                };
                orchestrator.process_all_batches(Some(&mut report_progress)).await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
