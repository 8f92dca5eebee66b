use std::path::PathBuf;
use std::sync::Arc;

use goalwatch::config::EngineConfig;
use goalwatch::dashboard;
use goalwatch::engine::{EngineHandle, IngestEvent, build_services_with_store, shard_for};
use goalwatch::ingest::read_feed_file;
use goalwatch::lifecycle::WindowState;
use goalwatch::signals_export::export_signals;
use goalwatch::sim_feed::{SimOptions, generate};
use goalwatch::store::Store;

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

fn in_memory_engine(cfg: EngineConfig, shards: usize) -> EngineHandle {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let services = build_services_with_store(cfg, store).expect("services");
    EngineHandle::start(services, shards)
}

#[test]
fn fixture_feed_runs_to_full_time() {
    let engine = in_memory_engine(EngineConfig::default(), 2);
    let svc = engine.services().clone();

    let feed = read_feed_file(&fixture("feed_small.ndjson"), |e| engine.submit(e.into()))
        .expect("fixture feed should be readable");
    assert_eq!(feed.lines, 11);
    assert_eq!(feed.events, 9);
    assert_eq!(feed.skipped, 1);

    let stats = engine.shutdown().unwrap();
    assert_eq!(stats.ticks, 8);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.matches_concluded, 1);
    assert_eq!(stats.windows_opened, 84);
    assert_eq!(stats.windows_settled, 84);

    assert_eq!(svc.store.load_ticks("fx1").unwrap().len(), 7);
    assert!(svc.store.open_windows("fx1").unwrap().is_empty());
    assert!(svc.store.open_signals(None).unwrap().is_empty());
    assert_eq!(svc.store.load_context("fx1").unwrap().unwrap().home, "Arsenal");
}

#[test]
fn simulated_matches_settle_everything() {
    let mut cfg = EngineConfig::default();
    cfg.default_policy.min_probability = 0.5;
    cfg.default_policy.min_ramp = -5.0;
    cfg.default_policy.min_dominance = 2.0;
    let engine = in_memory_engine(cfg, 3);
    let svc = engine.services().clone();

    let opts = SimOptions {
        seed: 5,
        with_quotes: false,
        with_xg: true,
    };
    for event in generate(6, &opts) {
        engine.submit(event.into()).unwrap();
    }
    let stats = engine.shutdown().unwrap();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.matches_concluded, 6);
    assert_eq!(stats.windows_opened, stats.windows_settled);
    assert_eq!(stats.signals_opened, stats.signals_settled);

    let ledger = svc.store.all_signals().unwrap();
    assert_eq!(ledger.len() as u64, stats.signals_opened);
    assert!(ledger.iter().all(|s| s.state != WindowState::Open));
    for s in &ledger {
        assert!(
            !ledger
                .iter()
                .any(|o| o.id != s.id
                    && o.match_id == s.match_id
                    && o.market == s.market
                    && o.created_minute == s.created_minute)
        );
    }

    let snap = dashboard::snapshot(&svc.store, &svc.book, &svc.tracker, 5).unwrap();
    assert!(snap.open.is_empty());
    assert!(snap.recent.len() <= 5);
    assert_eq!(snap.ledger.won + snap.ledger.lost, ledger.len());
    assert_eq!(snap.tracker.settled() as usize, ledger.len());
    let pnl: f64 = ledger.iter().filter_map(|s| s.pnl).sum();
    assert!((snap.ledger.pnl - pnl).abs() < 1e-9);
    serde_json::to_string(&snap).expect("snapshot serializes");

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("exports").join("signals.xlsx");
    let report = export_signals(&svc.store, &out).unwrap();
    assert_eq!(report.signals, ledger.len());
    assert_eq!(report.settled, ledger.len());
    assert!(out.exists());
}

#[test]
fn conclude_event_force_settles_an_abandoned_match() {
    let engine = in_memory_engine(EngineConfig::default(), 1);
    let svc = engine.services().clone();
    let mut events: Vec<IngestEvent> = generate(1, &SimOptions::default())
        .into_iter()
        .take(30)
        .map(IngestEvent::from)
        .collect();
    events.push(IngestEvent::Conclude {
        match_id: "sim-7-0".to_string(),
        minute: 30,
    });
    for event in events {
        engine.submit(event).unwrap();
    }
    let stats = engine.shutdown().unwrap();
    assert_eq!(stats.matches_concluded, 1);
    assert!(svc.store.open_windows("sim-7-0").unwrap().is_empty());
}

#[test]
fn shards_are_stable_per_match() {
    assert_eq!(shard_for("abc", 1), 0);
    let first = shard_for("match-42", 8);
    assert!(first < 8);
    assert_eq!(first, shard_for("match-42", 8));
}
