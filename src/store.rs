use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::counter_model::{CellCounts, CellKey, Scope};
use crate::features::SigBin;
use crate::lifecycle::{PendingWindow, Signal, WindowState};
use crate::online_logreg::FeatureMap;
use crate::policy::{PolicyParams, ScopedPolicy};
use crate::tick::{Market, MarketQuotes, MatchContext, Side, SideStats, Tick};

/// SQLite-backed persistence shared by every worker. One connection behind a
/// mutex; all writes are short single statements or small transactions.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSummary {
    pub open: usize,
    pub won: usize,
    pub lost: usize,
    pub pnl: f64,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    pub fn upsert_match(&self, ctx: &MatchContext) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO matches(match_id, league, home, away, league_key, home_key, away_key, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(match_id) DO UPDATE SET
                league = excluded.league,
                home = excluded.home,
                away = excluded.away,
                league_key = excluded.league_key,
                home_key = excluded.home_key,
                away_key = excluded.away_key,
                updated_at = excluded.updated_at",
            params![
                ctx.match_id,
                ctx.league,
                ctx.home,
                ctx.away,
                ctx.league_key(),
                ctx.home_key(),
                ctx.away_key(),
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("upsert match {}", ctx.match_id))?;
        Ok(())
    }

    pub fn load_context(&self, match_id: &str) -> Result<Option<MatchContext>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT match_id, league, home, away FROM matches WHERE match_id = ?1",
            params![match_id],
            |row| {
                Ok(MatchContext {
                    match_id: row.get(0)?,
                    league: row.get(1)?,
                    home: row.get(2)?,
                    away: row.get(3)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("load match context {match_id}"))
    }

    pub fn match_contexts(&self) -> Result<Vec<MatchContext>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT t.match_id, COALESCE(m.league, ''), COALESCE(m.home, ''), COALESCE(m.away, '')
                 FROM ticks t LEFT JOIN matches m ON m.match_id = t.match_id
                 ORDER BY t.match_id",
            )
            .context("prepare match list query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MatchContext {
                    match_id: row.get(0)?,
                    league: row.get(1)?,
                    home: row.get(2)?,
                    away: row.get(3)?,
                })
            })
            .context("query match list")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode match row")?);
        }
        Ok(out)
    }

    /// Returns false when an identical (match, minute, ts) tick already exists.
    pub fn insert_tick(&self, tick: &Tick) -> Result<bool> {
        let conn = self.conn();
        let q = tick.quotes.unwrap_or_default();
        let changed = conn
            .execute(
                "INSERT INTO ticks(
                    match_id, minute, ts, status,
                    home_goals, away_goals,
                    home_shots, away_shots, home_sot, away_sot, home_soff, away_soff,
                    home_corners, away_corners, home_da, away_da, home_xg, away_xg,
                    over05_ht, under05_ht, over05_ft, under05_ft)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
                 ON CONFLICT(match_id, minute, ts) DO NOTHING",
                params![
                    tick.match_id,
                    tick.minute,
                    tick.ts,
                    tick.status,
                    tick.home.goals,
                    tick.away.goals,
                    tick.home.shots_total,
                    tick.away.shots_total,
                    tick.home.shots_on_target,
                    tick.away.shots_on_target,
                    tick.home.shots_off_target,
                    tick.away.shots_off_target,
                    tick.home.corners,
                    tick.away.corners,
                    tick.home.dangerous_attacks,
                    tick.away.dangerous_attacks,
                    tick.home.xg,
                    tick.away.xg,
                    q.over05_ht,
                    q.under05_ht,
                    q.over05_ft,
                    q.under05_ft,
                ],
            )
            .with_context(|| format!("insert tick {} @{}", tick.match_id, tick.minute))?;
        Ok(changed > 0)
    }

    /// Ticks for a match ordered by (minute, ts).
    pub fn load_ticks(&self, match_id: &str) -> Result<Vec<Tick>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT match_id, minute, ts, status,
                        home_goals, away_goals,
                        home_shots, away_shots, home_sot, away_sot, home_soff, away_soff,
                        home_corners, away_corners, home_da, away_da, home_xg, away_xg,
                        over05_ht, under05_ht, over05_ft, under05_ft
                 FROM ticks WHERE match_id = ?1
                 ORDER BY minute ASC, ts ASC",
            )
            .context("prepare tick query")?;
        let rows = stmt
            .query_map(params![match_id], tick_from_row)
            .context("query ticks")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode tick row")?);
        }
        Ok(out)
    }

    /// Atomic increment-merge into one counter cell.
    pub fn bump_cell(&self, key: &CellKey, y: u64) -> Result<()> {
        let conn = self.conn();
        bump_cell_on(&conn, key, 1, y)
    }

    /// Merges many increments inside one transaction.
    pub fn bump_cells(&self, deltas: &[(CellKey, CellCounts)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("begin counter transaction")?;
        for (key, counts) in deltas {
            bump_cell_on(&tx, key, counts.n, counts.y)?;
        }
        tx.commit().context("commit counter transaction")?;
        Ok(())
    }

    pub fn get_cell(&self, key: &CellKey) -> Result<Option<CellCounts>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT n, y FROM model_counts
             WHERE scope_type = ?1 AND scope_key = ?2 AND window_minutes = ?3 AND side = ?4
               AND sig_bin = ?5 AND minute_bucket = ?6 AND gd_bin = ?7",
            params![
                key.scope.kind(),
                key.scope.key(),
                key.window,
                key.side.as_str(),
                i64::from(key.sig_bin.0),
                key.minute_bucket,
                key.gd_bin,
            ],
            |row| {
                Ok(CellCounts {
                    n: row.get::<_, i64>(0)?.max(0) as u64,
                    y: row.get::<_, i64>(1)?.max(0) as u64,
                })
            },
        )
        .optional()
        .context("exact-key counter lookup")
    }

    pub fn load_cells(&self) -> Result<Vec<(CellKey, CellCounts)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT scope_type, scope_key, window_minutes, side, sig_bin, minute_bucket, gd_bin, n, y
                 FROM model_counts",
            )
            .context("prepare counter scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u16>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, u8>(5)?,
                    row.get::<_, i8>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .context("query counters")?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, key, window, side, sig, bucket, gd, n, y) =
                row.context("decode counter row")?;
            let Some(scope) = Scope::from_parts(&kind, &key) else {
                continue;
            };
            let Some(side) = Side::parse(&side) else {
                continue;
            };
            out.push((
                CellKey {
                    scope,
                    window,
                    side,
                    sig_bin: SigBin(sig as u32),
                    minute_bucket: bucket,
                    gd_bin: gd,
                },
                CellCounts {
                    n: n.max(0) as u64,
                    y: y.max(0) as u64,
                },
            ));
        }
        Ok(out)
    }

    pub fn clear_cells(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM model_counts", [])
            .context("clear counters")?;
        Ok(())
    }

    pub fn insert_window(&self, w: &PendingWindow) -> Result<i64> {
        let conn = self.conn();
        let features = match &w.features {
            Some(f) => Some(serde_json::to_string(f).context("encode window features")?),
            None => None,
        };
        conn.execute(
            "INSERT INTO pending_windows(
                match_id, created_minute, window_minutes, side, market, sig_bin, minute_bucket, gd_bin,
                expiry_minute, state, settled_minute, features_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12)",
            params![
                w.match_id,
                w.created_minute,
                w.window,
                w.side.as_str(),
                w.lane.map(Market::as_str),
                i64::from(w.sig_bin.0),
                w.minute_bucket,
                w.gd_bin,
                w.expiry_minute,
                w.state.as_str(),
                features,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("insert pending window {}", w.match_id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Moves an OPEN window to a terminal state. Returns false if it was
    /// already settled.
    pub fn settle_window(&self, id: i64, state: WindowState, minute: u16) -> Result<bool> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE pending_windows SET state = ?1, settled_minute = ?2, settled_at = ?3
                 WHERE id = ?4 AND state = 'OPEN'",
                params![state.as_str(), minute, Utc::now().to_rfc3339(), id],
            )
            .with_context(|| format!("settle pending window {id}"))?;
        Ok(changed > 0)
    }

    pub fn open_windows(&self, match_id: &str) -> Result<Vec<PendingWindow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, match_id, created_minute, window_minutes, side, market, sig_bin, minute_bucket,
                        gd_bin, expiry_minute, state, settled_minute, features_json
                 FROM pending_windows WHERE match_id = ?1 AND state = 'OPEN'
                 ORDER BY id",
            )
            .context("prepare open windows query")?;
        let rows = stmt
            .query_map(params![match_id], window_from_row)
            .context("query open windows")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode pending window")?);
        }
        Ok(out)
    }

    pub fn insert_signal(&self, s: &Signal) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO signals(
                match_id, market, created_minute, expiry_minute, created_ts, league, home, away,
                probability, p_global, p_league, p_team, baseline, source,
                fair, edge, price, state, settled_minute, pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, NULL, NULL)",
            params![
                s.match_id,
                s.market.as_str(),
                s.created_minute,
                s.expiry_minute,
                s.created_ts,
                s.league,
                s.home,
                s.away,
                s.probability,
                s.p_global,
                s.p_league,
                s.p_team,
                s.baseline,
                s.source,
                s.fair,
                s.edge,
                s.price,
                s.state.as_str(),
            ],
        )
        .with_context(|| format!("insert signal {} {}", s.match_id, s.market.as_str()))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn settle_signal(&self, id: i64, state: WindowState, minute: u16, pnl: f64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE signals SET state = ?1, settled_minute = ?2, pnl = ?3, settled_at = ?4
                 WHERE id = ?5 AND state = 'OPEN'",
                params![state.as_str(), minute, pnl, Utc::now().to_rfc3339(), id],
            )
            .with_context(|| format!("settle signal {id}"))?;
        Ok(changed > 0)
    }

    pub fn open_signals(&self, match_id: Option<&str>) -> Result<Vec<Signal>> {
        let conn = self.conn();
        let sql = format!(
            "{SIGNAL_SELECT} WHERE state = 'OPEN' AND (?1 IS NULL OR match_id = ?1) ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql).context("prepare open signals query")?;
        let rows = stmt
            .query_map(params![match_id], signal_from_row)
            .context("query open signals")?;
        collect_signals(rows)
    }

    pub fn recent_settled_signals(&self, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn();
        let sql = format!("{SIGNAL_SELECT} WHERE state != 'OPEN' ORDER BY id DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql).context("prepare settled signals query")?;
        let rows = stmt
            .query_map(params![limit as i64], signal_from_row)
            .context("query settled signals")?;
        collect_signals(rows)
    }

    pub fn all_signals(&self) -> Result<Vec<Signal>> {
        let conn = self.conn();
        let sql = format!("{SIGNAL_SELECT} ORDER BY id");
        let mut stmt = conn.prepare(&sql).context("prepare signal ledger query")?;
        let rows = stmt
            .query_map([], signal_from_row)
            .context("query signal ledger")?;
        collect_signals(rows)
    }

    pub fn signal_summary(&self) -> Result<SignalSummary> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*), COALESCE(SUM(pnl), 0.0) FROM signals GROUP BY state")
            .context("prepare signal summary")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })
            .context("query signal summary")?;
        let mut out = SignalSummary::default();
        for row in rows {
            let (state, count, pnl) = row.context("decode signal summary")?;
            let count = count.max(0) as usize;
            match WindowState::parse(&state) {
                Some(WindowState::Open) => out.open += count,
                Some(WindowState::Won) => out.won += count,
                Some(WindowState::Lost) => out.lost += count,
                None => {}
            }
            out.pnl += pnl;
        }
        Ok(out)
    }

    pub fn upsert_policy(&self, policy: &ScopedPolicy) -> Result<()> {
        let conn = self.conn();
        let params_json =
            serde_json::to_string(&policy.params).context("encode policy params")?;
        conn.execute(
            "INSERT INTO policies(scope_type, scope_key, params_json, samples, pnl, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(scope_type, scope_key) DO UPDATE SET
                params_json = excluded.params_json,
                samples = excluded.samples,
                pnl = excluded.pnl,
                updated_at = excluded.updated_at",
            params![
                policy.scope.kind(),
                policy.scope.key(),
                params_json,
                policy.samples as i64,
                policy.pnl,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("upsert policy {}:{}", policy.scope.kind(), policy.scope.key()))?;
        Ok(())
    }

    pub fn load_policies(&self) -> Result<Vec<ScopedPolicy>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT scope_type, scope_key, params_json, samples, pnl FROM policies")
            .context("prepare policy query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })
            .context("query policies")?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, key, raw, samples, pnl) = row.context("decode policy row")?;
            let scope = Scope::from_parts(&kind, &key)
                .ok_or_else(|| anyhow!("unknown policy scope {kind}:{key}"))?;
            let params: PolicyParams = serde_json::from_str(&raw)
                .with_context(|| format!("decode policy params for {kind}:{key}"))?;
            out.push(ScopedPolicy {
                scope,
                params,
                samples: samples.max(0) as usize,
                pnl,
            });
        }
        Ok(out)
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS matches (
            match_id TEXT PRIMARY KEY,
            league TEXT NOT NULL,
            home TEXT NOT NULL,
            away TEXT NOT NULL,
            league_key TEXT NOT NULL,
            home_key TEXT NOT NULL,
            away_key TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ticks (
            match_id TEXT NOT NULL,
            minute INTEGER NOT NULL,
            ts INTEGER NOT NULL,
            status TEXT NOT NULL,
            home_goals INTEGER NOT NULL,
            away_goals INTEGER NOT NULL,
            home_shots INTEGER NULL,
            away_shots INTEGER NULL,
            home_sot INTEGER NULL,
            away_sot INTEGER NULL,
            home_soff INTEGER NULL,
            away_soff INTEGER NULL,
            home_corners INTEGER NULL,
            away_corners INTEGER NULL,
            home_da INTEGER NULL,
            away_da INTEGER NULL,
            home_xg REAL NULL,
            away_xg REAL NULL,
            over05_ht REAL NULL,
            under05_ht REAL NULL,
            over05_ft REAL NULL,
            under05_ft REAL NULL,
            PRIMARY KEY (match_id, minute, ts)
        );

        CREATE TABLE IF NOT EXISTS model_counts (
            scope_type TEXT NOT NULL,
            scope_key TEXT NOT NULL,
            window_minutes INTEGER NOT NULL,
            side TEXT NOT NULL,
            sig_bin INTEGER NOT NULL,
            minute_bucket INTEGER NOT NULL,
            gd_bin INTEGER NOT NULL,
            n INTEGER NOT NULL,
            y INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (scope_type, scope_key, window_minutes, side, sig_bin, minute_bucket, gd_bin)
        );

        CREATE TABLE IF NOT EXISTS pending_windows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id TEXT NOT NULL,
            created_minute INTEGER NOT NULL,
            window_minutes INTEGER NOT NULL,
            side TEXT NOT NULL,
            market TEXT NULL,
            sig_bin INTEGER NOT NULL,
            minute_bucket INTEGER NOT NULL,
            gd_bin INTEGER NOT NULL,
            expiry_minute INTEGER NOT NULL,
            state TEXT NOT NULL,
            settled_minute INTEGER NULL,
            features_json TEXT NULL,
            created_at TEXT NOT NULL,
            settled_at TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_open ON pending_windows(match_id, state);

        CREATE TABLE IF NOT EXISTS signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            match_id TEXT NOT NULL,
            market TEXT NOT NULL,
            created_minute INTEGER NOT NULL,
            expiry_minute INTEGER NOT NULL,
            created_ts INTEGER NOT NULL,
            league TEXT NOT NULL,
            home TEXT NOT NULL,
            away TEXT NOT NULL,
            probability REAL NOT NULL,
            p_global REAL NULL,
            p_league REAL NULL,
            p_team REAL NULL,
            baseline REAL NULL,
            source TEXT NOT NULL,
            fair REAL NULL,
            edge REAL NULL,
            price REAL NULL,
            state TEXT NOT NULL,
            settled_minute INTEGER NULL,
            pnl REAL NULL,
            settled_at TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signals_open ON signals(match_id, state);

        CREATE TABLE IF NOT EXISTS policies (
            scope_type TEXT NOT NULL,
            scope_key TEXT NOT NULL,
            params_json TEXT NOT NULL,
            samples INTEGER NOT NULL,
            pnl REAL NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (scope_type, scope_key)
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

fn bump_cell_on(conn: &Connection, key: &CellKey, n: u64, y: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO model_counts(scope_type, scope_key, window_minutes, side, sig_bin, minute_bucket, gd_bin, n, y, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(scope_type, scope_key, window_minutes, side, sig_bin, minute_bucket, gd_bin) DO UPDATE SET
            n = n + excluded.n,
            y = y + excluded.y,
            updated_at = excluded.updated_at",
        params![
            key.scope.kind(),
            key.scope.key(),
            key.window,
            key.side.as_str(),
            i64::from(key.sig_bin.0),
            key.minute_bucket,
            key.gd_bin,
            n as i64,
            y as i64,
            Utc::now().to_rfc3339(),
        ],
    )
    .context("bump model counter")?;
    Ok(())
}

fn tick_from_row(row: &Row<'_>) -> rusqlite::Result<Tick> {
    let side = |g: usize, offset: usize| -> rusqlite::Result<SideStats> {
        Ok(SideStats {
            goals: row.get(g)?,
            shots_total: row.get(6 + offset)?,
            shots_on_target: row.get(8 + offset)?,
            shots_off_target: row.get(10 + offset)?,
            corners: row.get(12 + offset)?,
            dangerous_attacks: row.get(14 + offset)?,
            xg: row.get(16 + offset)?,
        })
    };
    let quotes = MarketQuotes {
        over05_ht: row.get(18)?,
        under05_ht: row.get(19)?,
        over05_ft: row.get(20)?,
        under05_ft: row.get(21)?,
    };
    let has_quotes = quotes.over05_ht.is_some()
        || quotes.under05_ht.is_some()
        || quotes.over05_ft.is_some()
        || quotes.under05_ft.is_some();
    Ok(Tick {
        match_id: row.get(0)?,
        minute: row.get(1)?,
        ts: row.get(2)?,
        status: row.get(3)?,
        home: side(4, 0)?,
        away: side(5, 1)?,
        quotes: has_quotes.then_some(quotes),
    })
}

fn window_from_row(row: &Row<'_>) -> rusqlite::Result<PendingWindow> {
    let side: String = row.get(4)?;
    let market: Option<String> = row.get(5)?;
    let state: String = row.get(10)?;
    let features: Option<String> = row.get(12)?;
    Ok(PendingWindow {
        id: row.get(0)?,
        match_id: row.get(1)?,
        created_minute: row.get(2)?,
        window: row.get(3)?,
        side: Side::parse(&side).unwrap_or(Side::Any),
        lane: market.as_deref().and_then(Market::parse),
        sig_bin: SigBin(row.get::<_, i64>(6)? as u32),
        minute_bucket: row.get(7)?,
        gd_bin: row.get(8)?,
        expiry_minute: row.get(9)?,
        state: WindowState::parse(&state).unwrap_or(WindowState::Open),
        settled_minute: row.get(11)?,
        features: features.and_then(|raw| serde_json::from_str::<FeatureMap>(&raw).ok()),
    })
}

const SIGNAL_SELECT: &str = "SELECT id, match_id, market, created_minute, expiry_minute, created_ts,
        league, home, away, probability, p_global, p_league, p_team, baseline, source,
        fair, edge, price, state, settled_minute, pnl
     FROM signals";

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<Signal> {
    let market: String = row.get(2)?;
    let state: String = row.get(18)?;
    Ok(Signal {
        id: row.get(0)?,
        match_id: row.get(1)?,
        market: Market::parse(&market).unwrap_or(Market::FullTime),
        created_minute: row.get(3)?,
        expiry_minute: row.get(4)?,
        created_ts: row.get(5)?,
        league: row.get(6)?,
        home: row.get(7)?,
        away: row.get(8)?,
        probability: row.get(9)?,
        p_global: row.get(10)?,
        p_league: row.get(11)?,
        p_team: row.get(12)?,
        baseline: row.get(13)?,
        source: row.get(14)?,
        fair: row.get(15)?,
        edge: row.get(16)?,
        price: row.get(17)?,
        state: WindowState::parse(&state).unwrap_or(WindowState::Open),
        settled_minute: row.get(19)?,
        pnl: row.get(20)?,
    })
}

fn collect_signals(
    rows: impl Iterator<Item = rusqlite::Result<Signal>>,
) -> Result<Vec<Signal>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode signal row")?);
    }
    Ok(out)
}
