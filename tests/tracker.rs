use std::fs;

use goalwatch::config::PayoutTable;
use goalwatch::lifecycle::{Signal, WindowState};
use goalwatch::tick::Market;
use goalwatch::tracker::{AUDIT_HEADER, OutcomeTracker};

fn signal(id: i64, market: Market, created_minute: u16) -> Signal {
    Signal {
        id,
        match_id: format!("m{id}"),
        market,
        created_minute,
        expiry_minute: market.expiry_minute(),
        created_ts: 1_700_000_000_000,
        league: "Premier League".to_string(),
        home: "Arsenal".to_string(),
        away: "Chelsea".to_string(),
        probability: 0.66,
        p_global: Some(0.3),
        p_league: None,
        p_team: None,
        baseline: None,
        source: "counter".to_string(),
        fair: Some(0.55),
        edge: Some(0.11),
        price: Some(1.72),
        state: WindowState::Open,
        settled_minute: None,
        pnl: None,
    }
}

#[test]
fn state_survives_reopen_and_audit_appends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let state_path = dir.path().join("tracker_state.json");
    let audit_path = dir.path().join("audit").join("signals_audit.csv");
    let payouts = PayoutTable::default();

    {
        let tracker = OutcomeTracker::open(state_path.clone(), audit_path.clone()).unwrap();
        let mut win = signal(1, Market::FullTime, 55);
        tracker.record_open(&win).unwrap();
        assert!(win.settle(WindowState::Won, 61, &payouts));
        tracker.record_result(&win).unwrap();

        let mut loss = signal(2, Market::FirstHalf, 20);
        tracker.record_open(&loss).unwrap();
        assert!(loss.settle(WindowState::Lost, 46, &payouts));
        tracker.record_result(&loss).unwrap();

        // Already-settled and still-open signals do not count twice.
        assert!(!loss.settle(WindowState::Won, 47, &payouts));
        tracker.record_result(&signal(3, Market::FirstHalf, 30)).unwrap();
    }

    let reopened = OutcomeTracker::open(state_path, audit_path.clone()).unwrap();
    let s = reopened.summary();
    assert_eq!(s.opened, 2);
    assert_eq!(s.greens, 1);
    assert_eq!(s.reds, 1);
    assert!((s.total_profit - 0.2).abs() < 1e-9);
    assert_eq!(s.accuracy(), 0.5);
    assert_eq!(s.per_market["FT"].greens, 1);
    assert_eq!(s.per_market["HT"].reds, 1);

    let raw = fs::read_to_string(audit_path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], AUDIT_HEADER.join(","));
    assert!(lines[2].contains(",WON,"));
    assert!(lines[4].contains(",LOST,"));
}

#[test]
fn in_memory_tracker_keeps_counts_only() {
    let tracker = OutcomeTracker::in_memory();
    let mut s = signal(9, Market::FirstHalf, 12);
    tracker.record_open(&s).unwrap();
    s.settle(WindowState::Won, 20, &PayoutTable::default());
    tracker.record_result(&s).unwrap();
    let summary = tracker.summary();
    assert_eq!(summary.settled(), 1);
    assert!((summary.total_profit - 1.2).abs() < 1e-9);
}

#[test]
fn concurrent_results_keep_file_state_and_audit_in_step() {
    let dir = tempfile::tempdir().expect("temp dir");
    let state_path = dir.path().join("tracker_state.json");
    let audit_path = dir.path().join("signals_audit.csv");
    let tracker = OutcomeTracker::open(state_path.clone(), audit_path.clone()).unwrap();
    let payouts = PayoutTable::default();

    std::thread::scope(|scope| {
        for t in 0..8i64 {
            let tracker = &tracker;
            let payouts = &payouts;
            scope.spawn(move || {
                for i in 0..50i64 {
                    let mut s = signal(t * 100 + i, Market::FirstHalf, 20);
                    assert!(s.settle(WindowState::Won, 30, payouts));
                    tracker.record_result(&s).expect("record result");
                }
            });
        }
    });

    assert_eq!(tracker.summary().greens, 400);
    let reopened = OutcomeTracker::open(state_path, audit_path.clone()).unwrap();
    assert_eq!(reopened.summary().greens, 400);
    let raw = fs::read_to_string(audit_path).unwrap();
    assert_eq!(raw.lines().count(), 401);
}
