use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PayoutTable};
use crate::counter_model::{CellCoords, CellKey, CounterModel, ScopeKeys};
use crate::estimator::{EstimateQuery, EstimatorStack, feature_map};
use crate::features::{MinuteFeatures, SigBin, minute_features};
use crate::online_logreg::FeatureMap;
use crate::policy::{self, Decision, GateInput, PolicyBook, Rejection};
use crate::store::Store;
use crate::tick::{
    FULL_TIME_MINUTE, HALF_TIME_MINUTE, Market, MatchContext, MatchPhase, Side, Tick,
};
use crate::tracker::OutcomeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WindowState {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "WON")]
    Won,
    #[serde(rename = "LOST")]
    Lost,
}

impl WindowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowState::Open => "OPEN",
            WindowState::Won => "WON",
            WindowState::Lost => "LOST",
        }
    }

    pub fn parse(raw: &str) -> Option<WindowState> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(WindowState::Open),
            "WON" => Some(WindowState::Won),
            "LOST" => Some(WindowState::Lost),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != WindowState::Open
    }
}

/// Open observation "will a goal on `side` happen by `expiry_minute`".
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWindow {
    pub id: i64,
    pub match_id: String,
    pub created_minute: u16,
    pub window: u16,
    pub side: Side,
    /// Set for the absolute half-time and full-time windows.
    pub lane: Option<Market>,
    pub sig_bin: SigBin,
    pub minute_bucket: u8,
    pub gd_bin: i8,
    pub expiry_minute: u16,
    pub state: WindowState,
    pub settled_minute: Option<u16>,
    pub features: Option<FeatureMap>,
}

impl PendingWindow {
    pub fn coords(&self) -> CellCoords {
        CellCoords {
            window: self.window,
            side: self.side,
            sig_bin: self.sig_bin,
            minute_bucket: self.minute_bucket,
            gd_bin: self.gd_bin,
        }
    }

    /// Single terminal transition. Returns false when already settled.
    pub fn settle(&mut self, state: WindowState, minute: u16) -> bool {
        if self.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.state = state;
        self.settled_minute = Some(minute);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub id: i64,
    pub match_id: String,
    pub market: Market,
    pub created_minute: u16,
    pub expiry_minute: u16,
    pub created_ts: i64,
    pub league: String,
    pub home: String,
    pub away: String,
    pub probability: f64,
    pub p_global: Option<f64>,
    pub p_league: Option<f64>,
    pub p_team: Option<f64>,
    pub baseline: Option<f64>,
    pub source: String,
    pub fair: Option<f64>,
    pub edge: Option<f64>,
    pub price: Option<f64>,
    pub state: WindowState,
    pub settled_minute: Option<u16>,
    pub pnl: Option<f64>,
}

impl Signal {
    pub fn settle(&mut self, state: WindowState, minute: u16, payouts: &PayoutTable) -> bool {
        if self.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.state = state;
        self.settled_minute = Some(minute);
        self.pnl = Some(payout(
            self.market,
            self.created_minute,
            state == WindowState::Won,
            payouts,
        ));
        true
    }
}

pub fn payout(market: Market, created_minute: u16, won: bool, p: &PayoutTable) -> f64 {
    if !won {
        return p.loss;
    }
    match market {
        Market::FirstHalf => p.win_ht,
        Market::FullTime if created_minute >= p.ft_late_from_minute => p.win_ft_late,
        Market::FullTime => p.win_ft_early,
    }
}

/// Open signals across every shard, at most one per (match, market).
#[derive(Default)]
pub struct SignalBook {
    open: Mutex<HashMap<(String, Market), Signal>>,
}

impl SignalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open signal. A second signal for the same (match, market)
    /// is dropped and `false` returned.
    pub fn try_open(&self, signal: Signal) -> bool {
        let mut open = self.open.lock().expect("signal book lock poisoned");
        match open.entry((signal.match_id.clone(), signal.market)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(signal);
                true
            }
        }
    }

    pub fn is_open(&self, match_id: &str, market: Market) -> bool {
        self.open
            .lock()
            .expect("signal book lock poisoned")
            .contains_key(&(match_id.to_string(), market))
    }

    pub fn open_for(&self, match_id: &str) -> Vec<Signal> {
        let open = self.open.lock().expect("signal book lock poisoned");
        Market::ALL
            .iter()
            .filter_map(|m| open.get(&(match_id.to_string(), *m)).cloned())
            .collect()
    }

    pub fn take(&self, match_id: &str, market: Market) -> Option<Signal> {
        self.open
            .lock()
            .expect("signal book lock poisoned")
            .remove(&(match_id.to_string(), market))
    }

    pub fn snapshot(&self) -> Vec<Signal> {
        let mut out: Vec<Signal> = self
            .open
            .lock()
            .expect("signal book lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn len(&self) -> usize {
        self.open.lock().expect("signal book lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handles every shard's manager works against.
#[derive(Clone)]
pub struct Services {
    pub cfg: Arc<EngineConfig>,
    pub store: Arc<Store>,
    pub model: Arc<CounterModel>,
    pub estimators: Arc<EstimatorStack>,
    pub policies: Arc<PolicyBook>,
    pub book: Arc<SignalBook>,
    pub tracker: Arc<OutcomeTracker>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub match_id: String,
    pub minute: u16,
    pub duplicate: bool,
    pub goal: bool,
    pub windows_opened: usize,
    pub windows_won: usize,
    pub windows_lost: usize,
    pub signals_opened: usize,
    pub signals_settled: usize,
    pub rejections: Vec<(Market, Rejection)>,
    pub concluded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GoalEvent {
    home: bool,
    away: bool,
}

impl GoalEvent {
    fn credits(&self, side: Side) -> bool {
        match side {
            Side::Any => true,
            Side::Home => self.home,
            Side::Away => self.away,
        }
    }
}

/// Per-match state owned by the manager of the shard the match routes to.
#[derive(Debug)]
struct MatchSession {
    ctx: MatchContext,
    keys: ScopeKeys,
    seq: u64,
    history: Vec<Tick>,
    goals_home: u32,
    goals_away: u32,
    last_goal_minute: Option<u16>,
    last_sampled_minute: Option<u16>,
    last_signal_minute: HashMap<Market, u16>,
    windows: Vec<PendingWindow>,
}

impl MatchSession {
    fn new(ctx: MatchContext) -> Self {
        let keys = ScopeKeys::from_context(&ctx);
        Self {
            ctx,
            keys,
            seq: 0,
            history: Vec::new(),
            goals_home: 0,
            goals_away: 0,
            last_goal_minute: None,
            last_sampled_minute: None,
            last_signal_minute: HashMap::new(),
            windows: Vec::new(),
        }
    }

    fn set_context(&mut self, ctx: MatchContext) {
        self.keys = ScopeKeys::from_context(&ctx);
        self.ctx = ctx;
    }

    /// Compares cumulative goal counters against the highest seen so far.
    fn detect_goal(&mut self, tick: &Tick) -> Option<GoalEvent> {
        let home = tick.home.goals > self.goals_home;
        let away = tick.away.goals > self.goals_away;
        self.goals_home = self.goals_home.max(tick.home.goals);
        self.goals_away = self.goals_away.max(tick.away.goals);
        if !(home || away) {
            return None;
        }
        self.last_goal_minute = Some(match self.last_goal_minute {
            Some(prev) => prev.max(tick.minute),
            None => tick.minute,
        });
        Some(GoalEvent { home, away })
    }

    fn push_history(&mut self, tick: Tick, cap: usize) {
        let at = self
            .history
            .partition_point(|t| (t.minute, t.ts) <= (tick.minute, tick.ts));
        self.history.insert(at, tick);
        if cap > 0 && self.history.len() > cap {
            let excess = self.history.len() - cap;
            self.history.drain(..excess);
        }
    }
}

/// Drives every match routed to one shard: settles and opens pending windows,
/// gates and settles signals, and feeds outcomes back into the models.
pub struct LifecycleManager {
    svc: Services,
    sessions: HashMap<String, MatchSession>,
}

impl LifecycleManager {
    pub fn new(svc: Services) -> Self {
        Self {
            svc,
            sessions: HashMap::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.svc
    }

    pub fn active_matches(&self) -> usize {
        self.sessions.len()
    }

    pub fn open_windows(&self, match_id: &str) -> usize {
        self.sessions
            .get(match_id)
            .map(|s| s.windows.len())
            .unwrap_or(0)
    }

    pub fn on_context(&mut self, ctx: MatchContext) -> Result<()> {
        self.svc.store.upsert_match(&ctx)?;
        if let Some(session) = self.sessions.get_mut(&ctx.match_id) {
            session.set_context(ctx);
        }
        Ok(())
    }

    pub fn on_tick(&mut self, tick: Tick) -> Result<TickReport> {
        let mut report = TickReport {
            match_id: tick.match_id.clone(),
            minute: tick.minute,
            ..TickReport::default()
        };
        let svc = &self.svc;

        let session = match self.sessions.entry(tick.match_id.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(resume_session(svc, &tick.match_id)?),
        };

        if !svc.store.insert_tick(&tick)? {
            report.duplicate = true;
            return Ok(report);
        }
        session.seq += 1;

        let goal = session.detect_goal(&tick);
        report.goal = goal.is_some();
        let windows = settle_windows(svc, session, goal, tick.minute, &mut report);
        let signals = settle_signals(svc, &tick.match_id, goal, tick.minute, &mut report);
        windows?;
        signals?;

        let minute = tick.minute;
        let phase = tick.phase();
        let quotes = tick.quotes;
        let ts = tick.ts;
        session.push_history(tick, svc.cfg.lifecycle.history_cap);

        if phase == MatchPhase::Finished {
            conclude(svc, session, minute, &mut report)?;
            self.sessions.remove(&report.match_id);
            return Ok(report);
        }

        let new_minute = session.last_sampled_minute.is_none_or(|last| minute > last);
        if !new_minute || phase != MatchPhase::Live {
            return Ok(report);
        }
        session.last_sampled_minute = Some(minute);

        let Some(features) =
            minute_features(&session.history, minute, session.last_goal_minute, &svc.cfg.features)
        else {
            return Ok(report);
        };
        let fmap = feature_map(&features, &session.keys);
        open_windows(svc, session, &features, &fmap, &mut report)?;
        evaluate_signals(
            svc,
            session,
            &features,
            &fmap,
            phase,
            quotes.as_ref(),
            ts,
            &mut report,
        )?;

        if report.windows_won + report.windows_lost + report.signals_opened > 0 {
            debug!(
                match_id = %report.match_id,
                minute,
                opened = report.windows_opened,
                won = report.windows_won,
                lost = report.windows_lost,
                signals = report.signals_opened,
                "tick processed"
            );
        }
        Ok(report)
    }

    /// Settles everything still open for a match and forgets it.
    pub fn conclude_match(&mut self, match_id: &str, minute: u16) -> Result<TickReport> {
        let mut report = TickReport {
            match_id: match_id.to_string(),
            minute,
            ..TickReport::default()
        };
        let mut session = match self.sessions.remove(match_id) {
            Some(session) => session,
            None => resume_session(&self.svc, match_id)?,
        };
        if let Err(err) = conclude(&self.svc, &mut session, minute, &mut report) {
            self.sessions.insert(match_id.to_string(), session);
            return Err(err);
        }
        Ok(report)
    }
}

/// Rebuilds a session from persisted ticks, windows and signals.
fn resume_session(svc: &Services, match_id: &str) -> Result<MatchSession> {
    let ctx = svc
        .store
        .load_context(match_id)?
        .unwrap_or_else(|| MatchContext {
            match_id: match_id.to_string(),
            ..MatchContext::default()
        });
    let mut session = MatchSession::new(ctx);

    let history = svc.store.load_ticks(match_id)?;
    for tick in &history {
        session.detect_goal(tick);
        session.last_sampled_minute = Some(
            session
                .last_sampled_minute
                .map_or(tick.minute, |m| m.max(tick.minute)),
        );
    }
    let cap = svc.cfg.lifecycle.history_cap;
    for tick in history {
        session.push_history(tick, cap);
    }

    session.windows = svc.store.open_windows(match_id)?;
    for signal in svc.store.open_signals(Some(match_id))? {
        session
            .last_signal_minute
            .insert(signal.market, signal.created_minute);
        svc.book.try_open(signal);
    }
    if !session.history.is_empty() {
        info!(
            match_id,
            ticks = session.history.len(),
            windows = session.windows.len(),
            "resumed match session"
        );
    }
    Ok(session)
}

fn settle_windows(
    svc: &Services,
    session: &mut MatchSession,
    goal: Option<GoalEvent>,
    minute: u16,
    report: &mut TickReport,
) -> Result<()> {
    let mut settled = Vec::new();
    session.windows.retain(|w| {
        let won = goal.is_some_and(|g| g.credits(w.side))
            && minute >= w.created_minute
            && minute <= w.expiry_minute;
        let state = if won {
            WindowState::Won
        } else if minute > w.expiry_minute {
            WindowState::Lost
        } else {
            return true;
        };
        settled.push((w.clone(), state));
        false
    });
    finish_windows(svc, session, settled, minute, report)
}

/// Settles each window in turn. A window whose settlement fails goes back
/// into the session so a later tick retries it; the first error is returned.
fn finish_windows(
    svc: &Services,
    session: &mut MatchSession,
    settled: Vec<(PendingWindow, WindowState)>,
    minute: u16,
    report: &mut TickReport,
) -> Result<()> {
    let mut first_err = None;
    for (window, state) in settled {
        if let Err(err) = finish_window(svc, &session.keys, window.clone(), state, minute, report)
        {
            warn!(
                match_id = %window.match_id,
                window_id = window.id,
                error = %err,
                "window settlement failed"
            );
            session.windows.push(window);
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn finish_window(
    svc: &Services,
    keys: &ScopeKeys,
    mut window: PendingWindow,
    state: WindowState,
    minute: u16,
    report: &mut TickReport,
) -> Result<()> {
    if !window.settle(state, minute) || !svc.store.settle_window(window.id, state, minute)? {
        return Ok(());
    }
    let won = state == WindowState::Won;
    let coords = window.coords();
    let cells: Vec<CellKey> = keys
        .fan_out(window.side)
        .into_iter()
        .map(|scope| coords.key(scope))
        .collect();
    svc.model.bump_many(&cells, won)?;

    if let (Some(lane), Some(features), Some(logistic)) =
        (window.lane, &window.features, svc.estimators.logistic())
    {
        logistic.learn(lane, features, won);
    }
    if won {
        report.windows_won += 1;
    } else {
        report.windows_lost += 1;
    }
    Ok(())
}

fn settle_signals(
    svc: &Services,
    match_id: &str,
    goal: Option<GoalEvent>,
    minute: u16,
    report: &mut TickReport,
) -> Result<()> {
    let mut first_err = None;
    for signal in svc.book.open_for(match_id) {
        let state = if goal.is_some()
            && minute >= signal.created_minute
            && minute <= signal.expiry_minute
        {
            WindowState::Won
        } else if minute > signal.expiry_minute {
            WindowState::Lost
        } else {
            continue;
        };
        if let Err(err) = close_signal(svc, match_id, signal.market, state, minute, report) {
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn close_signal(
    svc: &Services,
    match_id: &str,
    market: Market,
    state: WindowState,
    minute: u16,
    report: &mut TickReport,
) -> Result<()> {
    let Some(open) = svc.book.take(match_id, market) else {
        return Ok(());
    };
    let mut signal = open.clone();
    if !signal.settle(state, minute, &svc.cfg.lifecycle.payouts) {
        return Ok(());
    }
    let pnl = signal.pnl.unwrap_or(0.0);
    match svc.store.settle_signal(signal.id, state, minute, pnl) {
        Ok(true) => {}
        Ok(false) => return Ok(()),
        Err(err) => {
            warn!(match_id, market = market.as_str(), error = %err, "signal settlement failed");
            svc.book.try_open(open);
            return Err(err);
        }
    }
    info!(
        match_id,
        market = market.as_str(),
        outcome = state.as_str(),
        minute,
        pnl,
        "signal settled"
    );
    if let Err(err) = svc.tracker.record_result(&signal) {
        warn!(match_id, error = %err, "tracker failed to record result");
    }
    report.signals_settled += 1;
    Ok(())
}

fn conclude(
    svc: &Services,
    session: &mut MatchSession,
    minute: u16,
    report: &mut TickReport,
) -> Result<()> {
    let open: Vec<(PendingWindow, WindowState)> = std::mem::take(&mut session.windows)
        .into_iter()
        .map(|w| (w, WindowState::Lost))
        .collect();
    let windows = finish_windows(svc, session, open, minute, report);
    let mut signals = Ok(());
    for signal in svc.book.open_for(&session.ctx.match_id) {
        if let Err(err) = close_signal(
            svc,
            &session.ctx.match_id,
            signal.market,
            WindowState::Lost,
            minute,
            report,
        ) && signals.is_ok()
        {
            signals = Err(err);
        }
    }
    windows?;
    signals?;
    report.concluded = true;
    info!(
        match_id = %session.ctx.match_id,
        minute,
        ticks = session.seq,
        "match concluded"
    );
    Ok(())
}

fn open_windows(
    svc: &Services,
    session: &mut MatchSession,
    features: &MinuteFeatures,
    fmap: &FeatureMap,
    report: &mut TickReport,
) -> Result<()> {
    let cfg = &svc.cfg.lifecycle;
    let minute = features.minute;
    let mut specs: Vec<(u16, Side, u16, Option<Market>)> = Vec::new();
    for &w in &cfg.windows {
        for side in Side::ALL {
            specs.push((w, side, minute.saturating_add(w), None));
        }
    }
    if cfg.open_half_window && minute < HALF_TIME_MINUTE {
        specs.push((HALF_TIME_MINUTE, Side::Any, HALF_TIME_MINUTE, Some(Market::FirstHalf)));
    }
    if cfg.open_full_window && minute < FULL_TIME_MINUTE {
        specs.push((FULL_TIME_MINUTE, Side::Any, FULL_TIME_MINUTE, Some(Market::FullTime)));
    }

    for (window, side, expiry_minute, lane) in specs {
        let mut pending = PendingWindow {
            id: 0,
            match_id: session.ctx.match_id.clone(),
            created_minute: minute,
            window,
            side,
            lane,
            sig_bin: features.sig_bin,
            minute_bucket: features.minute_bucket(),
            gd_bin: features.gd_bin(),
            expiry_minute,
            state: WindowState::Open,
            settled_minute: None,
            features: lane.map(|_| fmap.clone()),
        };
        pending.id = svc.store.insert_window(&pending)?;
        session.windows.push(pending);
        report.windows_opened += 1;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn evaluate_signals(
    svc: &Services,
    session: &mut MatchSession,
    features: &MinuteFeatures,
    fmap: &FeatureMap,
    phase: MatchPhase,
    quotes: Option<&crate::tick::MarketQuotes>,
    ts: i64,
    report: &mut TickReport,
) -> Result<()> {
    let match_id = session.ctx.match_id.clone();
    let minute = features.minute;
    let estimate = svc.estimators.estimate(&EstimateQuery {
        match_id: &match_id,
        features,
        keys: &session.keys,
        feature_map: fmap,
    });
    let policy = svc.policies.resolve(&session.keys);

    for market in Market::ALL {
        if market.remaining(minute) == 0 || svc.book.is_open(&match_id, market) {
            continue;
        }
        let probability = estimate.probs.for_market(market);
        let baseline = estimate.counter.baseline.map(|b| b.for_market(market));
        let input = GateInput {
            market,
            minute,
            phase,
            dominance: features.dominance,
            ramp: features.ramp(),
            probability,
            baseline,
            price: quotes.and_then(|q| q.for_market(market)),
            minutes_since_signal: session
                .last_signal_minute
                .get(&market)
                .map(|m| minute.saturating_sub(*m)),
            minutes_since_goal: features.minutes_since_goal,
            post_goal_cooldown: svc.cfg.lifecycle.post_goal_cooldown,
        };
        let (fair, edge, price) = match policy::evaluate(&policy.params, &svc.cfg.gates, &input) {
            Decision::Skip(reason) => {
                report.rejections.push((market, reason));
                continue;
            }
            Decision::Emit { fair, edge, price } => (fair, edge, price),
        };

        let breakdown = &estimate.counter.breakdown;
        let mut signal = Signal {
            id: 0,
            match_id: match_id.clone(),
            market,
            created_minute: minute,
            expiry_minute: market.expiry_minute(),
            created_ts: ts,
            league: session.ctx.league.clone(),
            home: session.ctx.home.clone(),
            away: session.ctx.away.clone(),
            probability,
            p_global: breakdown.global.contributed(),
            p_league: breakdown.league.contributed(),
            p_team: breakdown.team.contributed(),
            baseline,
            source: estimate.source.clone(),
            fair,
            edge,
            price,
            state: WindowState::Open,
            settled_minute: None,
            pnl: None,
        };
        // One shard owns each match, so nothing else can open this lane between
        // the `is_open` check above and `try_open` below.
        signal.id = svc.store.insert_signal(&signal)?;
        if !svc.book.try_open(signal.clone()) {
            continue;
        }
        session.last_signal_minute.insert(market, minute);
        info!(
            match_id = %match_id,
            market = market.as_str(),
            minute,
            p = probability,
            source = %signal.source,
            policy = %policy.scope.as_ref().map_or("default".to_string(), |s| s.to_string()),
            "signal opened"
        );
        if let Err(err) = svc.tracker.record_open(&signal) {
            warn!(match_id = %match_id, error = %err, "tracker failed to record open");
        }
        report.signals_opened += 1;
    }
    Ok(())
}
