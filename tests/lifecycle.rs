use std::sync::Arc;

use goalwatch::config::EngineConfig;
use goalwatch::counter_model::{CellCounts, CellKey, Scope};
use goalwatch::engine::build_services_with_store;
use goalwatch::features::{NONE_SIGNATURE, SigBin};
use goalwatch::lifecycle::{LifecycleManager, Services, Signal, SignalBook, WindowState};
use goalwatch::policy::PolicyParams;
use goalwatch::store::Store;
use goalwatch::tick::{Market, MatchContext, Side, SideStats, Tick};

fn context() -> MatchContext {
    MatchContext {
        match_id: "m1".to_string(),
        league: "Serie A - Round 3".to_string(),
        home: "Inter".to_string(),
        away: "Milan".to_string(),
    }
}

fn single_window_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.lifecycle.windows = vec![15];
    cfg.lifecycle.open_half_window = false;
    cfg.lifecycle.open_full_window = false;
    cfg
}

fn services(cfg: EngineConfig) -> Services {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    build_services_with_store(cfg, store).expect("services")
}

fn tick(minute: u16, status: &str, home_goals: u32, home_sot: u32) -> Tick {
    Tick {
        match_id: "m1".to_string(),
        ts: i64::from(minute) * 60_000,
        minute,
        status: status.to_string(),
        home: SideStats {
            goals: home_goals,
            shots_on_target: Some(home_sot),
            ..SideStats::default()
        },
        away: SideStats {
            goals: 0,
            shots_on_target: Some(0),
            ..SideStats::default()
        },
        quotes: None,
    }
}

fn cell(scope: Scope, side: Side) -> CellKey {
    CellKey {
        scope,
        window: 15,
        side,
        sig_bin: SigBin::of(NONE_SIGNATURE),
        minute_bucket: 6,
        gd_bin: 0,
    }
}

#[test]
fn goal_inside_window_wins_and_credits_every_scope() {
    let svc = services(single_window_config());
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_context(context()).unwrap();

    let first = manager.on_tick(tick(30, "1st half", 0, 0)).unwrap();
    assert_eq!(first.windows_opened, 3);
    assert_eq!(manager.open_windows("m1"), 3);

    let goal = manager.on_tick(tick(40, "1st half", 1, 1)).unwrap();
    assert!(goal.goal);
    assert_eq!(goal.windows_won, 2);
    assert_eq!(goal.windows_lost, 0);

    let won = Some(CellCounts { n: 1, y: 1 });
    for scope in [
        Scope::Global,
        Scope::League("serie a".to_string()),
        Scope::Team("inter".to_string()),
        Scope::Team("milan".to_string()),
    ] {
        assert_eq!(svc.model.counts(&cell(scope.clone(), Side::Any)), won, "{scope}");
        assert_eq!(svc.store.get_cell(&cell(scope, Side::Any)).unwrap(), won);
    }
    assert_eq!(
        svc.model.counts(&cell(Scope::Team("inter".to_string()), Side::Home)),
        won
    );
    // The away window is still waiting for an away goal.
    assert_eq!(
        svc.model.counts(&cell(Scope::Team("milan".to_string()), Side::Away)),
        None
    );
    assert_eq!(
        svc.model
            .counts(&cell(Scope::Global, Side::Any).wildcard()),
        won
    );
}

#[test]
fn window_is_lost_at_first_tick_past_expiry() {
    let svc = services(single_window_config());
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_context(context()).unwrap();

    manager.on_tick(tick(30, "1st half", 0, 0)).unwrap();
    let at_break = manager.on_tick(tick(45, "HT", 0, 0)).unwrap();
    assert_eq!(at_break.windows_lost, 0);
    assert_eq!(at_break.windows_opened, 0);

    let after = manager.on_tick(tick(46, "2nd half", 0, 0)).unwrap();
    assert_eq!(after.windows_lost, 3);

    let lost = Some(CellCounts { n: 1, y: 0 });
    for scope in [
        Scope::Global,
        Scope::League("serie a".to_string()),
        Scope::Team("inter".to_string()),
    ] {
        assert_eq!(svc.model.counts(&cell(scope, Side::Any)), lost);
    }
    assert!(svc.store.open_windows("m1").unwrap().iter().all(|w| w.created_minute == 46));
}

#[test]
fn duplicate_tick_is_ignored() {
    let svc = services(single_window_config());
    let mut manager = LifecycleManager::new(svc);
    let t = tick(12, "1st half", 0, 0);
    assert!(!manager.on_tick(t.clone()).unwrap().duplicate);
    let again = manager.on_tick(t).unwrap();
    assert!(again.duplicate);
    assert_eq!(again.windows_opened, 0);
    assert_eq!(manager.open_windows("m1"), 3);
}

#[test]
fn stale_minute_does_not_reopen_windows() {
    let svc = services(single_window_config());
    let mut manager = LifecycleManager::new(svc);
    manager.on_tick(tick(20, "1st half", 0, 0)).unwrap();
    let mut late = tick(18, "1st half", 0, 0);
    late.ts += 1;
    let report = manager.on_tick(late).unwrap();
    assert!(!report.duplicate);
    assert_eq!(report.windows_opened, 0);
}

fn signal_config() -> EngineConfig {
    let mut cfg = single_window_config();
    cfg.default_policy = PolicyParams {
        min_probability: 0.3,
        min_uplift: 0.0,
        min_dominance: 2.0,
        min_ramp: -10.0,
        cooldown_minutes: 3,
    };
    cfg
}

#[test]
fn signal_opens_once_per_lane_and_wins_on_goal() {
    let svc = services(signal_config());
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_context(context()).unwrap();

    manager.on_tick(tick(10, "1st half", 0, 0)).unwrap();
    let pressed = manager.on_tick(tick(16, "1st half", 0, 2)).unwrap();
    assert_eq!(pressed.signals_opened, 1);
    assert!(svc.book.is_open("m1", Market::FirstHalf));
    assert!(!svc.book.is_open("m1", Market::FullTime));

    let still = manager.on_tick(tick(17, "1st half", 0, 4)).unwrap();
    assert_eq!(still.signals_opened, 0);
    assert_eq!(svc.book.len(), 1);

    let goal = manager.on_tick(tick(18, "1st half", 1, 4)).unwrap();
    assert_eq!(goal.signals_settled, 1);
    assert!(svc.book.is_empty());

    let signals = svc.store.all_signals().unwrap();
    assert_eq!(signals.len(), 1);
    let s = &signals[0];
    assert_eq!(s.market, Market::FirstHalf);
    assert_eq!(s.created_minute, 16);
    assert_eq!(s.state, WindowState::Won);
    assert_eq!(s.settled_minute, Some(18));
    assert_eq!(s.pnl, Some(1.2));
    assert_eq!(s.source, "counter");

    let summary = svc.tracker.summary();
    assert_eq!(summary.opened, 1);
    assert_eq!(summary.greens, 1);
    assert_eq!(summary.reds, 0);
}

#[test]
fn goal_cooldown_blocks_signal_right_after_goal() {
    let svc = services(signal_config());
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_tick(tick(10, "1st half", 0, 0)).unwrap();
    let report = manager.on_tick(tick(16, "1st half", 1, 2)).unwrap();
    assert!(report.goal);
    assert_eq!(report.signals_opened, 0);
    assert!(
        report
            .rejections
            .iter()
            .any(|(m, r)| *m == Market::FirstHalf && r.as_str() == "goal_cooldown")
    );
}

#[test]
fn full_time_status_forces_open_entities_lost() {
    let svc = services(signal_config());
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_tick(tick(10, "1st half", 0, 0)).unwrap();
    manager.on_tick(tick(16, "1st half", 0, 2)).unwrap();
    assert_eq!(svc.book.len(), 1);

    let end = manager.on_tick(tick(30, "FT", 0, 2)).unwrap();
    assert!(end.concluded);
    assert_eq!(end.signals_settled, 1);
    assert_eq!(manager.active_matches(), 0);
    assert!(svc.store.open_windows("m1").unwrap().is_empty());

    let s = &svc.store.all_signals().unwrap()[0];
    assert_eq!(s.state, WindowState::Lost);
    assert_eq!(s.pnl, Some(-1.0));
}

#[test]
fn session_resumes_from_store_after_restart() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let svc = build_services_with_store(single_window_config(), store.clone()).unwrap();
    {
        let mut manager = LifecycleManager::new(svc);
        manager.on_context(context()).unwrap();
        manager.on_tick(tick(30, "1st half", 0, 0)).unwrap();
    }

    let svc = build_services_with_store(single_window_config(), store).unwrap();
    let mut manager = LifecycleManager::new(svc.clone());
    let goal = manager.on_tick(tick(40, "1st half", 1, 1)).unwrap();
    assert_eq!(goal.windows_won, 2);
    assert_eq!(
        svc.model.counts(&cell(Scope::League("serie a".to_string()), Side::Any)),
        Some(CellCounts { n: 1, y: 1 })
    );
}

#[test]
fn goal_after_expiry_does_not_win_window() {
    let svc = services(single_window_config());
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_context(context()).unwrap();

    manager.on_tick(tick(30, "1st half", 0, 0)).unwrap();
    let late = manager.on_tick(tick(46, "2nd half", 1, 1)).unwrap();
    assert!(late.goal);
    assert_eq!(late.windows_won, 0);
    assert_eq!(late.windows_lost, 3);
    assert_eq!(
        svc.model.counts(&cell(Scope::Global, Side::Any)),
        Some(CellCounts { n: 1, y: 0 })
    );
}

#[test]
fn conclude_after_restart_settles_persisted_entities() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    {
        let svc = build_services_with_store(signal_config(), store.clone()).unwrap();
        let mut manager = LifecycleManager::new(svc);
        manager.on_context(context()).unwrap();
        manager.on_tick(tick(10, "1st half", 0, 0)).unwrap();
        manager.on_tick(tick(16, "1st half", 0, 2)).unwrap();
    }
    assert!(!store.open_windows("m1").unwrap().is_empty());
    assert_eq!(store.open_signals(Some("m1")).unwrap().len(), 1);

    let svc = build_services_with_store(signal_config(), store.clone()).unwrap();
    let mut manager = LifecycleManager::new(svc.clone());
    let report = manager.conclude_match("m1", 90).unwrap();
    assert!(report.concluded);
    assert_eq!(report.signals_settled, 1);
    assert!(report.windows_lost > 0);
    assert!(store.open_windows("m1").unwrap().is_empty());
    assert!(store.open_signals(Some("m1")).unwrap().is_empty());
    assert!(svc.book.is_empty());
    assert_eq!(manager.active_matches(), 0);
}

#[test]
fn failed_settlement_keeps_windows_for_retry() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db_path = dir.path().join("events.sqlite");
    let mut cfg = single_window_config();
    cfg.storage.data_dir = dir.path().to_path_buf();
    cfg.storage.db_path = db_path.clone();
    let store = Arc::new(Store::open(&db_path).unwrap());
    let svc = build_services_with_store(cfg, store.clone()).unwrap();
    let mut manager = LifecycleManager::new(svc.clone());
    manager.on_context(context()).unwrap();
    manager.on_tick(tick(30, "1st half", 0, 0)).unwrap();

    let side = rusqlite::Connection::open(&db_path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER block_settle BEFORE UPDATE ON pending_windows
         BEGIN SELECT RAISE(ABORT, 'settle blocked'); END;",
    )
    .unwrap();
    assert!(manager.on_tick(tick(46, "2nd half", 0, 0)).is_err());
    assert_eq!(manager.open_windows("m1"), 3);
    assert_eq!(store.open_windows("m1").unwrap().len(), 3);
    assert_eq!(svc.model.counts(&cell(Scope::Global, Side::Any)), None);

    side.execute_batch("DROP TRIGGER block_settle;").unwrap();
    let retry = manager.on_tick(tick(47, "2nd half", 0, 0)).unwrap();
    assert_eq!(retry.windows_lost, 3);
    assert!(
        store
            .open_windows("m1")
            .unwrap()
            .iter()
            .all(|w| w.created_minute == 47)
    );
    assert_eq!(
        svc.model.counts(&cell(Scope::Global, Side::Any)),
        Some(CellCounts { n: 1, y: 0 })
    );
}

fn open_signal(id: i64) -> Signal {
    Signal {
        id,
        match_id: "m1".to_string(),
        market: Market::FullTime,
        created_minute: 30,
        expiry_minute: 90,
        created_ts: 0,
        league: "serie a".to_string(),
        home: "inter".to_string(),
        away: "milan".to_string(),
        probability: 0.7,
        p_global: None,
        p_league: None,
        p_team: None,
        baseline: None,
        source: "counter".to_string(),
        fair: None,
        edge: None,
        price: None,
        state: WindowState::Open,
        settled_minute: None,
        pnl: None,
    }
}

#[test]
fn concurrent_opens_leave_exactly_one_signal() {
    let book = SignalBook::new();
    let opened: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let book = &book;
                scope.spawn(move || book.try_open(open_signal(i)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| usize::from(h.join().expect("opener thread")))
            .sum()
    });
    assert_eq!(opened, 1);
    assert_eq!(book.len(), 1);
    assert_eq!(book.open_for("m1").len(), 1);
}
