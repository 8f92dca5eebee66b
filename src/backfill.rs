use std::collections::HashMap;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::counter_model::{CellCounts, CellKey, CounterModel, ScopeKeys};
use crate::features::{SigBin, gd_bin, minute_bucket, signature, window_rows};
use crate::store::Store;
use crate::tick::{MatchContext, Side, Tick};

const MIN_TICKS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub matches: usize,
    pub samples: u64,
    pub positives: u64,
    pub cells: usize,
}

impl BackfillSummary {
    pub fn base_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.positives as f64 / self.samples as f64
        }
    }
}

/// True when cumulative goals rise within `(minute(i), minute(i) + w]`.
pub fn goal_within(rows: &[Tick], i: usize, w: u16) -> bool {
    let start = rows[i].minute;
    let end = start.saturating_add(w);
    let goals = rows[i].total_goals();
    rows[i + 1..]
        .iter()
        .take_while(|t| t.minute <= end)
        .any(|t| t.total_goals() > goals && t.minute > start)
}

/// Counter increments for one stored match, side `any`, every configured
/// window, credited to global, league and both teams.
pub fn match_deltas(
    ctx: &MatchContext,
    rows: &[Tick],
    cfg: &EngineConfig,
) -> (HashMap<CellKey, CellCounts>, u64, u64) {
    let mut deltas: HashMap<CellKey, CellCounts> = HashMap::new();
    let (mut samples, mut positives) = (0u64, 0u64);
    if rows.len() < MIN_TICKS {
        return (deltas, samples, positives);
    }
    let keys = ScopeKeys::from_context(ctx);
    let scopes = keys.fan_out(Side::Any);
    let lookback = cfg.features.lookback_minutes;

    for i in 0..rows.len() {
        let minute = rows[i].minute;
        let sig = SigBin::of(&signature(window_rows(&rows[..=i], minute, lookback)));
        let bucket = minute_bucket(minute);
        let gd = gd_bin(rows[i].goal_diff());

        for &w in &cfg.trainer.backfill_windows {
            let y = goal_within(rows, i, w);
            for scope in &scopes {
                let key = CellKey {
                    scope: scope.clone(),
                    window: w,
                    side: Side::Any,
                    sig_bin: sig,
                    minute_bucket: bucket,
                    gd_bin: gd,
                };
                for k in [key.wildcard(), key] {
                    let cell = deltas.entry(k).or_default();
                    cell.n += 1;
                    cell.y += u64::from(y);
                }
            }
            samples += 1;
            positives += u64::from(y);
        }
    }
    (deltas, samples, positives)
}

/// Rebuilds (or tops up, when `reset` is false) the counter model from every
/// match with stored ticks.
pub fn run_backfill(
    store: &Store,
    model: &CounterModel,
    cfg: &EngineConfig,
    reset: bool,
) -> Result<BackfillSummary> {
    if reset {
        store.clear_cells()?;
        model.load_from_store()?;
    }
    let contexts = store.match_contexts()?;
    info!(matches = contexts.len(), "backfill starting");

    let per_match: Vec<_> = contexts
        .par_iter()
        .filter_map(|ctx| match store.load_ticks(&ctx.match_id) {
            Ok(rows) => Some(match_deltas(ctx, &rows, cfg)),
            Err(err) => {
                warn!(match_id = %ctx.match_id, error = %format!("{err:#}"), "skipping match");
                None
            }
        })
        .collect();

    let mut merged: HashMap<CellKey, CellCounts> = HashMap::new();
    let mut summary = BackfillSummary::default();
    for (deltas, samples, positives) in per_match {
        if samples == 0 {
            continue;
        }
        summary.matches += 1;
        summary.samples += samples;
        summary.positives += positives;
        for (key, counts) in deltas {
            let cell = merged.entry(key).or_default();
            cell.n += counts.n;
            cell.y += counts.y;
        }
    }
    summary.cells = merged.len();
    model.merge(merged.into_iter().collect())?;

    info!(
        matches = summary.matches,
        samples = summary.samples,
        positives = summary.positives,
        base_rate = summary.base_rate(),
        cells = summary.cells,
        "backfill finished"
    );
    Ok(summary)
}
