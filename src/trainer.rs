use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{EngineConfig, LifecycleConfig};
use crate::counter_model::{CounterModel, Scope, ScopeKeys};
use crate::estimator::{CounterEstimator, HorizonProbs};
use crate::features::minute_features;
use crate::lifecycle::payout;
use crate::policy::{self, GateInput, GateLimits, PolicyParams, ScopeFloors, ScopedPolicy};
use crate::store::Store;
use crate::tick::{Market, MatchContext, MatchPhase, Tick, TwoWayPrice};

/// Everything the gates need at one sampled minute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateFrame {
    pub phase: MatchPhase,
    pub dominance: f64,
    pub ramp: f64,
    pub probs: HorizonProbs,
    pub baseline: Option<HorizonProbs>,
    pub price_half: Option<TwoWayPrice>,
    pub price_full: Option<TwoWayPrice>,
    pub minutes_since_goal: Option<u16>,
}

impl GateFrame {
    fn price(&self, market: Market) -> Option<TwoWayPrice> {
        match market {
            Market::FirstHalf => self.price_half,
            Market::FullTime => self.price_full,
        }
    }
}

/// One stored tick as seen by the replay: settlement inputs plus, on newly
/// sampled minutes, the gate inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayFrame {
    pub minute: u16,
    pub goal: bool,
    pub finished: bool,
    pub gate: Option<GateFrame>,
}

#[derive(Debug, Clone)]
pub struct MatchReplay {
    pub match_id: String,
    pub keys: ScopeKeys,
    pub frames: Vec<ReplayFrame>,
}

impl MatchReplay {
    fn in_scope(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Global => true,
            Scope::League(key) => &self.keys.league == key,
            Scope::Team(key) => &self.keys.home == key || &self.keys.away == key,
        }
    }
}

/// Precomputes replay frames for one match. Probabilities come from the
/// counter model's base window projected onto the HT and FT horizons.
pub fn build_replay(
    ctx: &MatchContext,
    ticks: &[Tick],
    estimator: &CounterEstimator,
    cfg: &EngineConfig,
) -> MatchReplay {
    let keys = ScopeKeys::from_context(ctx);
    let mut frames = Vec::with_capacity(ticks.len());
    let (mut goals_home, mut goals_away) = (0u32, 0u32);
    let mut last_goal: Option<u16> = None;
    let mut last_sampled: Option<u16> = None;

    for (i, tick) in ticks.iter().enumerate() {
        let goal = tick.home.goals > goals_home || tick.away.goals > goals_away;
        goals_home = goals_home.max(tick.home.goals);
        goals_away = goals_away.max(tick.away.goals);
        if goal {
            last_goal = Some(last_goal.map_or(tick.minute, |g| g.max(tick.minute)));
        }
        let phase = tick.phase();

        let mut gate = None;
        let new_minute = last_sampled.is_none_or(|m| tick.minute > m);
        if new_minute && phase == MatchPhase::Live {
            last_sampled = Some(tick.minute);
            if let Some(features) =
                minute_features(&ticks[..=i], tick.minute, last_goal, &cfg.features)
            {
                let detail = estimator.detail(&features, &keys);
                gate = Some(GateFrame {
                    phase,
                    dominance: features.dominance,
                    ramp: features.ramp(),
                    probs: detail.probs,
                    baseline: detail.baseline,
                    price_half: tick.quotes.and_then(|q| q.for_market(Market::FirstHalf)),
                    price_full: tick.quotes.and_then(|q| q.for_market(Market::FullTime)),
                    minutes_since_goal: features.minutes_since_goal,
                });
            }
        }
        frames.push(ReplayFrame {
            minute: tick.minute,
            goal,
            finished: phase == MatchPhase::Finished,
            gate,
        });
    }
    MatchReplay {
        match_id: ctx.match_id.clone(),
        keys,
        frames,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimResult {
    pub signals: usize,
    pub wins: usize,
    pub losses: usize,
    pub pnl: f64,
}

impl SimResult {
    fn add(&mut self, other: SimResult) {
        self.signals += other.signals;
        self.wins += other.wins;
        self.losses += other.losses;
        self.pnl += other.pnl;
    }
}

/// Replays one match under `params`: one open signal per lane, cooldowns,
/// settlement at the first goal or at expiry.
pub fn simulate_match(
    replay: &MatchReplay,
    params: &PolicyParams,
    gates: &GateLimits,
    lifecycle: &LifecycleConfig,
) -> SimResult {
    let mut out = SimResult::default();
    let mut open: [Option<u16>; 2] = [None, None];
    let mut last_signal: [Option<u16>; 2] = [None, None];
    let lane_idx = |m: Market| match m {
        Market::FirstHalf => 0,
        Market::FullTime => 1,
    };
    let settle = |out: &mut SimResult, market: Market, created: u16, won: bool| {
        out.pnl += payout(market, created, won, &lifecycle.payouts);
        if won {
            out.wins += 1;
        } else {
            out.losses += 1;
        }
    };

    for frame in &replay.frames {
        for market in Market::ALL {
            let idx = lane_idx(market);
            let Some(created) = open[idx] else {
                continue;
            };
            let expiry = market.expiry_minute();
            if frame.goal && frame.minute >= created && frame.minute <= expiry {
                settle(&mut out, market, created, true);
                open[idx] = None;
            } else if frame.minute > expiry {
                settle(&mut out, market, created, false);
                open[idx] = None;
            }
        }
        if frame.finished {
            break;
        }
        let Some(g) = &frame.gate else {
            continue;
        };
        for market in Market::ALL {
            let idx = lane_idx(market);
            if open[idx].is_some() || market.remaining(frame.minute) == 0 {
                continue;
            }
            let input = GateInput {
                market,
                minute: frame.minute,
                phase: g.phase,
                dominance: g.dominance,
                ramp: g.ramp,
                probability: g.probs.for_market(market),
                baseline: g.baseline.map(|b| b.for_market(market)),
                price: g.price(market),
                minutes_since_signal: last_signal[idx].map(|m| frame.minute.saturating_sub(m)),
                minutes_since_goal: g.minutes_since_goal,
                post_goal_cooldown: lifecycle.post_goal_cooldown,
            };
            if policy::evaluate(params, gates, &input).is_emit() {
                open[idx] = Some(frame.minute);
                last_signal[idx] = Some(frame.minute);
                out.signals += 1;
            }
        }
    }
    for market in Market::ALL {
        if let Some(created) = open[lane_idx(market)] {
            settle(&mut out, market, created, false);
        }
    }
    out
}

pub fn simulate(
    replays: &[&MatchReplay],
    params: &PolicyParams,
    gates: &GateLimits,
    lifecycle: &LifecycleConfig,
) -> SimResult {
    let mut total = SimResult::default();
    for replay in replays {
        total.add(simulate_match(replay, params, gates, lifecycle));
    }
    total
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeOutcome {
    pub scope: Scope,
    pub matches: usize,
    pub best: Option<(PolicyParams, SimResult)>,
    pub floor: usize,
}

impl ScopeOutcome {
    pub fn winner(&self) -> Option<ScopedPolicy> {
        let (params, result) = self.best?;
        (result.signals >= self.floor).then(|| ScopedPolicy {
            scope: self.scope.clone(),
            params,
            samples: result.signals,
            pnl: result.pnl,
        })
    }
}

/// Grid search for one scope: highest PnL among combinations whose signal
/// count clears the floor. Ties go to the combination with more signals.
pub fn train_scope(
    scope: Scope,
    replays: &[MatchReplay],
    cfg: &EngineConfig,
    floors: &ScopeFloors,
) -> ScopeOutcome {
    let subset: Vec<&MatchReplay> = replays.iter().filter(|r| r.in_scope(&scope)).collect();
    let floor = floors.for_scope(&scope);
    let combos = cfg.trainer.grid.combinations();

    let best = combos
        .par_iter()
        .map(|params| (*params, simulate(&subset, params, &cfg.gates, &cfg.lifecycle)))
        .filter(|(_, r)| r.signals >= floor && r.signals > 0)
        .reduce_with(|a, b| {
            let better = b.1.pnl > a.1.pnl || (b.1.pnl == a.1.pnl && b.1.signals > a.1.signals);
            if better { b } else { a }
        });
    ScopeOutcome {
        scope,
        matches: subset.len(),
        best,
        floor,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub matches: usize,
    pub scopes: Vec<ScopeOutcome>,
    pub saved: Vec<ScopedPolicy>,
}

pub fn load_replays(
    store: &Store,
    model: Arc<CounterModel>,
    cfg: &EngineConfig,
) -> Result<Vec<MatchReplay>> {
    let estimator = CounterEstimator::new(model);
    let contexts = store.match_contexts()?;
    let replays: Vec<MatchReplay> = contexts
        .par_iter()
        .filter_map(|ctx| match store.load_ticks(&ctx.match_id) {
            Ok(ticks) if !ticks.is_empty() => Some(build_replay(ctx, &ticks, &estimator, cfg)),
            Ok(_) => None,
            Err(err) => {
                warn!(match_id = %ctx.match_id, error = %format!("{err:#}"), "skipping match");
                None
            }
        })
        .collect();
    Ok(replays)
}

/// Trains global, per-league and per-team policies and persists the winners.
/// Scopes with no qualifying combination keep no override.
pub fn train_all(store: &Store, model: Arc<CounterModel>, cfg: &EngineConfig) -> Result<TrainReport> {
    let replays = load_replays(store, model, cfg)?;
    let floors = ScopeFloors::from_trainer(&cfg.trainer);

    let mut scopes = vec![Scope::Global];
    let leagues: BTreeSet<&str> = replays.iter().map(|r| r.keys.league.as_str()).collect();
    scopes.extend(leagues.into_iter().map(|l| Scope::League(l.to_string())));
    let teams: BTreeSet<&str> = replays
        .iter()
        .flat_map(|r| [r.keys.home.as_str(), r.keys.away.as_str()])
        .collect();
    scopes.extend(teams.into_iter().map(|t| Scope::Team(t.to_string())));

    let mut report = TrainReport {
        matches: replays.len(),
        ..TrainReport::default()
    };
    for scope in scopes {
        let outcome = train_scope(scope, &replays, cfg, &floors);
        match outcome.winner() {
            Some(policy) => {
                store.upsert_policy(&policy)?;
                info!(
                    scope = %policy.scope,
                    signals = policy.samples,
                    pnl = policy.pnl,
                    "policy saved"
                );
                report.saved.push(policy);
            }
            None => {
                info!(scope = %outcome.scope, matches = outcome.matches, "no policy cleared the floor");
            }
        }
        report.scopes.push(outcome);
    }
    Ok(report)
}
