use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::config::ModelConfig;
use crate::features::SigBin;
use crate::store::Store;
use crate::tick::{MatchContext, Side};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Global,
    League(String),
    Team(String),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::League(_) => "league",
            Scope::Team(_) => "team",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Scope::Global => "*",
            Scope::League(key) | Scope::Team(key) => key,
        }
    }

    pub fn from_parts(kind: &str, key: &str) -> Option<Scope> {
        match kind {
            "global" => Some(Scope::Global),
            "league" => Some(Scope::League(key.to_string())),
            "team" => Some(Scope::Team(key.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub scope: Scope,
    pub window: u16,
    pub side: Side,
    pub sig_bin: SigBin,
    pub minute_bucket: u8,
    pub gd_bin: i8,
}

impl CellKey {
    pub fn wildcard(&self) -> CellKey {
        CellKey {
            sig_bin: SigBin::WILDCARD,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellCounts {
    pub n: u64,
    pub y: u64,
}

impl CellCounts {
    fn merge(&mut self, other: CellCounts) {
        self.n += other.n;
        self.y += other.y;
    }
}

/// Normalized scope keys of one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeKeys {
    pub league: String,
    pub home: String,
    pub away: String,
}

impl ScopeKeys {
    pub fn from_context(ctx: &MatchContext) -> Self {
        Self {
            league: ctx.league_key(),
            home: ctx.home_key(),
            away: ctx.away_key(),
        }
    }

    /// Scopes an outcome on `side` is credited to.
    pub fn fan_out(&self, side: Side) -> Vec<Scope> {
        let mut out = vec![Scope::Global, Scope::League(self.league.clone())];
        if side.covers_home() {
            out.push(Scope::Team(self.home.clone()));
        }
        if side.covers_away() && (self.away != self.home || !side.covers_home()) {
            out.push(Scope::Team(self.away.clone()));
        }
        out
    }
}

/// Cell coordinates without the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellCoords {
    pub window: u16,
    pub side: Side,
    pub sig_bin: SigBin,
    pub minute_bucket: u8,
    pub gd_bin: i8,
}

impl CellCoords {
    pub fn key(&self, scope: Scope) -> CellKey {
        CellKey {
            scope,
            window: self.window,
            side: self.side,
            sig_bin: self.sig_bin,
            minute_bucket: self.minute_bucket,
            gd_bin: self.gd_bin,
        }
    }

    pub fn wildcard(&self) -> CellCoords {
        CellCoords {
            sig_bin: SigBin::WILDCARD,
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScopeEstimate {
    pub p: f64,
    pub n: u64,
    pub weight: f64,
}

impl ScopeEstimate {
    /// Probability when this scope contributed to the blend.
    pub fn contributed(&self) -> Option<f64> {
        (self.weight > 0.0).then_some(self.p)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScopeBreakdown {
    pub global: ScopeEstimate,
    pub league: ScopeEstimate,
    pub team: ScopeEstimate,
    pub blended: f64,
}

/// Hierarchical empirical-Bayes counters. Updates merge commutatively, so the
/// order in which concurrent matches settle does not matter.
pub struct CounterModel {
    cells: Mutex<HashMap<CellKey, CellCounts>>,
    store: Option<Arc<Store>>,
    cfg: ModelConfig,
}

impl CounterModel {
    pub fn new(cfg: ModelConfig) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            store: None,
            cfg,
        }
    }

    pub fn with_store(cfg: ModelConfig, store: Arc<Store>) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            store: Some(store),
            cfg,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Replaces in-memory counters with everything persisted.
    pub fn load_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let rows = store.load_cells()?;
        let count = rows.len();
        let mut cells = self.cells.lock().expect("counter lock poisoned");
        cells.clear();
        cells.extend(rows);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.cells.lock().expect("counter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bump(&self, key: &CellKey, outcome: bool) -> Result<()> {
        self.bump_many(std::slice::from_ref(key), outcome)
    }

    /// Increments every key and its wildcard-signature cell by one observation.
    pub fn bump_many(&self, keys: &[CellKey], outcome: bool) -> Result<()> {
        let delta = CellCounts {
            n: 1,
            y: u64::from(outcome),
        };
        let mut touched: Vec<(CellKey, CellCounts)> = Vec::with_capacity(keys.len() * 2);
        for key in keys {
            touched.push((key.clone(), delta));
            if !key.sig_bin.is_wildcard() {
                touched.push((key.wildcard(), delta));
            }
        }
        self.merge(touched)
    }

    /// Adds pre-aggregated counts. Used by backfill. The store transaction
    /// commits first; memory only changes once it has.
    pub fn merge(&self, deltas: Vec<(CellKey, CellCounts)>) -> Result<()> {
        if let Some(store) = &self.store {
            store.bump_cells(&deltas)?;
        }
        let mut cells = self.cells.lock().expect("counter lock poisoned");
        for (key, counts) in deltas {
            cells.entry(key).or_default().merge(counts);
        }
        Ok(())
    }

    pub fn counts(&self, key: &CellKey) -> Option<CellCounts> {
        self.cells
            .lock()
            .expect("counter lock poisoned")
            .get(key)
            .copied()
    }

    pub fn estimate(&self, key: &CellKey) -> f64 {
        match self.counts(key) {
            Some(c) => self.smooth(c),
            None => self.cfg.prior,
        }
    }

    fn smooth(&self, c: CellCounts) -> f64 {
        let denom = c.n as f64 + self.cfg.alpha;
        if denom <= 0.0 {
            return self.cfg.prior;
        }
        (c.y as f64 + self.cfg.alpha * self.cfg.prior) / denom
    }

    fn scope_estimate(&self, counts: Option<CellCounts>, k: f64) -> ScopeEstimate {
        match counts {
            Some(c) if c.n > 0 => ScopeEstimate {
                p: self.smooth(c),
                n: c.n,
                weight: (c.n as f64 / k).min(1.0),
            },
            _ => ScopeEstimate {
                p: self.cfg.prior,
                n: 0,
                weight: 0.0,
            },
        }
    }

    /// Blends global, league and team estimates for a match. For side `any`
    /// the team scope pools both teams' cells.
    pub fn blend(&self, keys: &ScopeKeys, coords: CellCoords) -> ScopeBreakdown {
        let cells = self.cells.lock().expect("counter lock poisoned");
        let lookup = |scope: Scope| cells.get(&coords.key(scope)).copied();

        let global = lookup(Scope::Global);
        let league = lookup(Scope::League(keys.league.clone()));
        let team = match coords.side {
            Side::Home => lookup(Scope::Team(keys.home.clone())),
            Side::Away => lookup(Scope::Team(keys.away.clone())),
            Side::Any => {
                let home = lookup(Scope::Team(keys.home.clone()));
                let away = if keys.away == keys.home {
                    None
                } else {
                    lookup(Scope::Team(keys.away.clone()))
                };
                match (home, away) {
                    (None, None) => None,
                    (h, a) => {
                        let mut pooled = h.unwrap_or_default();
                        pooled.merge(a.unwrap_or_default());
                        Some(pooled)
                    }
                }
            }
        };
        drop(cells);

        let global = self.scope_estimate(global, self.cfg.k_global);
        let league = self.scope_estimate(league, self.cfg.k_league);
        let team = self.scope_estimate(team, self.cfg.k_team);
        let blended = blend_weighted(&[global, league, team]).unwrap_or(global.p);
        ScopeBreakdown {
            global,
            league,
            team,
            blended,
        }
    }

    /// Blend over the wildcard-signature cells.
    pub fn baseline(&self, keys: &ScopeKeys, coords: CellCoords) -> ScopeBreakdown {
        self.blend(keys, coords.wildcard())
    }
}

fn blend_weighted(parts: &[ScopeEstimate]) -> Option<f64> {
    let total: f64 = parts.iter().map(|p| p.weight).sum();
    if total <= 0.0 {
        return None;
    }
    Some(parts.iter().map(|p| p.weight * p.p).sum::<f64>() / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords() -> CellCoords {
        CellCoords {
            window: 10,
            side: Side::Any,
            sig_bin: SigBin(42),
            minute_bucket: 6,
            gd_bin: 0,
        }
    }

    #[test]
    fn absent_cell_returns_prior() {
        let model = CounterModel::new(ModelConfig::default());
        let key = coords().key(Scope::Global);
        assert_eq!(model.estimate(&key), 0.28);
    }

    #[test]
    fn bump_also_feeds_wildcard() {
        let model = CounterModel::new(ModelConfig::default());
        let key = coords().key(Scope::Global);
        model.bump(&key, true).unwrap();
        model.bump(&key, false).unwrap();
        assert_eq!(model.counts(&key), Some(CellCounts { n: 2, y: 1 }));
        assert_eq!(model.counts(&key.wildcard()), Some(CellCounts { n: 2, y: 1 }));
    }

    #[test]
    fn fan_out_any_credits_both_teams() {
        let keys = ScopeKeys {
            league: "serie a".into(),
            home: "inter".into(),
            away: "milan".into(),
        };
        assert_eq!(keys.fan_out(Side::Any).len(), 4);
        assert_eq!(
            keys.fan_out(Side::Away),
            vec![
                Scope::Global,
                Scope::League("serie a".into()),
                Scope::Team("milan".into())
            ]
        );
    }
}
