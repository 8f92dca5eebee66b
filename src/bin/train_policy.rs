use std::sync::Arc;

use anyhow::{Context, Result};

use goalwatch::cli;
use goalwatch::config::EngineConfig;
use goalwatch::counter_model::CounterModel;
use goalwatch::store::Store;
use goalwatch::trainer::train_all;

fn main() -> Result<()> {
    cli::init_tracing("goalwatch=info");

    let mut cfg = EngineConfig::from_env();
    if let Some(db) = cli::db_path_arg() {
        cfg.storage.db_path = db;
    }

    let store = Arc::new(
        Store::open(&cfg.storage.db_path)
            .with_context(|| format!("open event store {}", cfg.storage.db_path.display()))?,
    );
    let model = Arc::new(CounterModel::with_store(cfg.model.clone(), store.clone()));
    model.load_from_store()?;
    let report = train_all(&store, model, &cfg)?;

    println!("Policy training complete");
    println!("Matches replayed: {}", report.matches);
    println!(
        "Scopes: {} evaluated, {} saved",
        report.scopes.len(),
        report.saved.len()
    );
    for policy in &report.saved {
        let p = &policy.params;
        println!(
            "{:<28} signals={:<4} pnl={:>8.2}  min_p={:.2} uplift={:.2} dom={:.1} slope={:.2} cooldown={}",
            policy.scope.to_string(),
            policy.samples,
            policy.pnl,
            p.min_probability,
            p.min_uplift,
            p.min_dominance,
            p.min_ramp,
            p.cooldown_minutes
        );
    }
    Ok(())
}
