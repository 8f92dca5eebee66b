use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use goalwatch::cli;
use goalwatch::config::EngineConfig;
use goalwatch::dashboard;
use goalwatch::engine::{EngineHandle, build_services};
use goalwatch::ingest::{read_feed, read_feed_file};
use goalwatch::sim_feed::{self, SimOptions};

fn main() -> Result<()> {
    cli::init_tracing("goalwatch=info");

    let mut cfg = EngineConfig::from_env();
    if let Some(db) = cli::db_path_arg() {
        cfg.storage.db_path = db;
    }
    if let Some(shards) = cli::arg_value("--shards").and_then(|v| v.parse::<usize>().ok()) {
        cfg.shards = shards.clamp(1, 64);
    }
    let shards = cfg.shards;

    let services = build_services(cfg)?;
    let engine = EngineHandle::start(services.clone(), shards);

    if let Some(raw) = cli::arg_value("--simulate") {
        let matches = raw
            .parse::<usize>()
            .with_context(|| format!("invalid --simulate value {raw:?}"))?;
        let opts = SimOptions {
            seed: cli::arg_value("--seed")
                .and_then(|v| v.parse().ok())
                .unwrap_or(SimOptions::default().seed),
            with_quotes: cli::has_flag("--quotes"),
            ..SimOptions::default()
        };
        let events = sim_feed::generate(matches, &opts);
        info!(matches, events = events.len(), "replaying simulated feed");
        for event in events {
            engine.submit(event.into())?;
        }
    } else {
        let feed = cli::arg_value("--feed").unwrap_or_else(|| "-".to_string());
        let submit = |event: goalwatch::ingest::FeedEvent| engine.submit(event.into());
        let stats = if feed == "-" {
            read_feed(BufReader::new(io::stdin().lock()), submit)?
        } else {
            read_feed_file(&PathBuf::from(&feed), submit)?
        };
        info!(
            lines = stats.lines,
            events = stats.events,
            skipped = stats.skipped,
            "feed drained"
        );
    }

    let stats = engine.shutdown()?;
    println!(
        "ticks={} duplicates={} errors={} windows_opened={} windows_settled={} signals_opened={} signals_settled={}",
        stats.ticks,
        stats.duplicates,
        stats.errors,
        stats.windows_opened,
        stats.windows_settled,
        stats.signals_opened,
        stats.signals_settled
    );

    if cli::has_flag("--snapshot") {
        let snap = dashboard::snapshot(
            &services.store,
            &services.book,
            &services.tracker,
            dashboard::DEFAULT_RECENT,
        )?;
        println!(
            "{}",
            serde_json::to_string_pretty(&snap).context("encode dashboard snapshot")?
        );
    }
    Ok(())
}
