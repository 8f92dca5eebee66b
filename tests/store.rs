use goalwatch::counter_model::{CellCounts, CellKey, Scope};
use goalwatch::features::SigBin;
use goalwatch::policy::{PolicyParams, ScopedPolicy};
use goalwatch::store::Store;
use goalwatch::tick::{MarketQuotes, MatchContext, Side, SideStats, Tick};

fn tick(match_id: &str, minute: u16, ts: i64) -> Tick {
    Tick {
        match_id: match_id.to_string(),
        ts,
        minute,
        status: "2nd half".to_string(),
        home: SideStats {
            goals: 1,
            shots_total: Some(7),
            shots_on_target: Some(3),
            xg: Some(0.84),
            ..SideStats::default()
        },
        away: SideStats::default(),
        quotes: Some(MarketQuotes {
            over05_ft: Some(1.45),
            under05_ft: Some(2.6),
            ..MarketQuotes::default()
        }),
    }
}

#[test]
fn ticks_round_trip_and_duplicates_are_rejected() {
    let store = Store::open_in_memory().unwrap();
    assert!(store.insert_tick(&tick("a", 61, 2)).unwrap());
    assert!(store.insert_tick(&tick("a", 60, 1)).unwrap());
    assert!(!store.insert_tick(&tick("a", 60, 1)).unwrap());
    assert!(store.insert_tick(&tick("a", 60, 5)).unwrap());

    let rows = store.load_ticks("a").unwrap();
    let order: Vec<(u16, i64)> = rows.iter().map(|t| (t.minute, t.ts)).collect();
    assert_eq!(order, vec![(60, 1), (60, 5), (61, 2)]);
    assert_eq!(rows[0], tick("a", 60, 1));
    assert!(store.load_ticks("b").unwrap().is_empty());
}

#[test]
fn match_list_includes_ticks_without_context() {
    let store = Store::open_in_memory().unwrap();
    store
        .upsert_match(&MatchContext {
            match_id: "a".to_string(),
            league: "Ligue 1".to_string(),
            home: "Lyon".to_string(),
            away: "Nice".to_string(),
        })
        .unwrap();
    store.insert_tick(&tick("a", 10, 1)).unwrap();
    store.insert_tick(&tick("b", 10, 1)).unwrap();

    let contexts = store.match_contexts().unwrap();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].home, "Lyon");
    assert_eq!(contexts[1].league, "");
    assert_eq!(store.load_context("a").unwrap().unwrap().away, "Nice");
    assert!(store.load_context("zzz").unwrap().is_none());
}

#[test]
fn counter_cells_accumulate() {
    let store = Store::open_in_memory().unwrap();
    let key = CellKey {
        scope: Scope::League("serie a".to_string()),
        window: 20,
        side: Side::Home,
        sig_bin: SigBin(77),
        minute_bucket: 12,
        gd_bin: -1,
    };
    assert_eq!(store.get_cell(&key).unwrap(), None);
    store.bump_cell(&key, 1).unwrap();
    store.bump_cell(&key, 0).unwrap();
    store
        .bump_cells(&[(key.clone(), CellCounts { n: 3, y: 2 })])
        .unwrap();
    assert_eq!(store.get_cell(&key).unwrap(), Some(CellCounts { n: 5, y: 3 }));

    let all = store.load_cells().unwrap();
    assert_eq!(all, vec![(key, CellCounts { n: 5, y: 3 })]);
    store.clear_cells().unwrap();
    assert!(store.load_cells().unwrap().is_empty());
}

#[test]
fn policies_upsert_by_scope() {
    let store = Store::open_in_memory().unwrap();
    let mut policy = ScopedPolicy {
        scope: Scope::Team("arsenal".to_string()),
        params: PolicyParams::default(),
        samples: 210,
        pnl: 14.5,
    };
    store.upsert_policy(&policy).unwrap();
    policy.samples = 260;
    policy.params.min_dominance = 2.0;
    store.upsert_policy(&policy).unwrap();

    let loaded = store.load_policies().unwrap();
    assert_eq!(loaded, vec![policy]);
}

#[test]
fn file_store_creates_parent_dir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("events.sqlite");
    let store = Store::open(&path).unwrap();
    assert_eq!(store.path(), Some(path.as_path()));
    assert!(path.exists());
}
