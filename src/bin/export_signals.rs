use std::path::PathBuf;

use anyhow::{Context, Result};

use goalwatch::cli;
use goalwatch::config::EngineConfig;
use goalwatch::signals_export::export_signals;
use goalwatch::store::Store;

fn main() -> Result<()> {
    cli::init_tracing("goalwatch=warn");

    let mut cfg = EngineConfig::from_env();
    if let Some(db) = cli::db_path_arg() {
        cfg.storage.db_path = db;
    }
    let out = cli::arg_value("--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.storage.data_dir.join("signals.xlsx"));

    let store = Store::open(&cfg.storage.db_path)
        .with_context(|| format!("open event store {}", cfg.storage.db_path.display()))?;
    let report = export_signals(&store, &out)?;

    println!("Signal export complete");
    println!("File: {}", out.display());
    println!("Signals: {} (settled {})", report.signals, report.settled);
    Ok(())
}
