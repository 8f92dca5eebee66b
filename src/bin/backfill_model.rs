use std::sync::Arc;

use anyhow::{Context, Result};

use goalwatch::backfill::run_backfill;
use goalwatch::cli;
use goalwatch::config::EngineConfig;
use goalwatch::counter_model::CounterModel;
use goalwatch::store::Store;

fn main() -> Result<()> {
    cli::init_tracing("goalwatch=info");

    let mut cfg = EngineConfig::from_env();
    if let Some(db) = cli::db_path_arg() {
        cfg.storage.db_path = db;
    }
    let reset = cli::has_flag("--reset");

    let store = Arc::new(
        Store::open(&cfg.storage.db_path)
            .with_context(|| format!("open event store {}", cfg.storage.db_path.display()))?,
    );
    let model = CounterModel::with_store(cfg.model.clone(), store.clone());
    model.load_from_store()?;
    let summary = run_backfill(&store, &model, &cfg, reset)?;

    println!("Counter backfill complete");
    println!("DB: {}", cfg.storage.db_path.display());
    println!("Reset: {reset}");
    println!("Matches: {}", summary.matches);
    println!("Samples: {} (positives {})", summary.samples, summary.positives);
    println!("Base rate: {:.4}", summary.base_rate());
    println!("Cells touched: {}", summary.cells);
    Ok(())
}
