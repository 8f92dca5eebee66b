use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::TrainerConfig;
use crate::counter_model::{Scope, ScopeKeys};
use crate::store::Store;
use crate::tick::{HALF_TIME_MINUTE, Market, MatchPhase, TwoWayPrice};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyParams {
    pub min_probability: f64,
    /// Ratio to the wildcard-signature baseline; 0 disables the gate.
    pub min_uplift: f64,
    pub min_dominance: f64,
    pub min_ramp: f64,
    pub cooldown_minutes: u16,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            min_probability: 0.60,
            min_uplift: 0.0,
            min_dominance: 3.0,
            min_ramp: 0.15,
            cooldown_minutes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateLimits {
    pub ht_min_minute: u16,
    pub ht_max_minute: u16,
    pub ft_min_minute: u16,
    pub ft_max_minute: u16,
    pub blackout_start: u16,
    pub blackout_end: u16,
    pub min_edge_ht: f64,
    pub min_edge_ft: f64,
    pub min_price: f64,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            ht_min_minute: 8,
            ht_max_minute: 35,
            ft_min_minute: 25,
            ft_max_minute: 80,
            blackout_start: HALF_TIME_MINUTE,
            blackout_end: 50,
            min_edge_ht: 0.05,
            min_edge_ft: 0.06,
            min_price: 1.6,
        }
    }
}

impl GateLimits {
    pub fn minute_range(&self, market: Market) -> (u16, u16) {
        match market {
            Market::FirstHalf => (self.ht_min_minute, self.ht_max_minute),
            Market::FullTime => (self.ft_min_minute, self.ft_max_minute),
        }
    }

    pub fn min_edge(&self, market: Market) -> f64 {
        match market {
            Market::FirstHalf => self.min_edge_ht,
            Market::FullTime => self.min_edge_ft,
        }
    }

    fn in_blackout(&self, minute: u16) -> bool {
        minute >= self.blackout_start && minute <= self.blackout_end
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateInput {
    pub market: Market,
    pub minute: u16,
    pub phase: MatchPhase,
    pub dominance: f64,
    pub ramp: f64,
    pub probability: f64,
    pub baseline: Option<f64>,
    pub price: Option<TwoWayPrice>,
    pub minutes_since_signal: Option<u16>,
    pub minutes_since_goal: Option<u16>,
    pub post_goal_cooldown: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MinuteOutOfRange,
    Blackout,
    HalfTimeBreak,
    LowDominance,
    LowRamp,
    LowProbability,
    LowUplift,
    LowEdge,
    PriceTooShort,
    SignalCooldown,
    GoalCooldown,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::MinuteOutOfRange => "minute_out_of_range",
            Rejection::Blackout => "blackout",
            Rejection::HalfTimeBreak => "half_time_break",
            Rejection::LowDominance => "low_dominance",
            Rejection::LowRamp => "low_ramp",
            Rejection::LowProbability => "low_probability",
            Rejection::LowUplift => "low_uplift",
            Rejection::LowEdge => "low_edge",
            Rejection::PriceTooShort => "price_too_short",
            Rejection::SignalCooldown => "signal_cooldown",
            Rejection::GoalCooldown => "goal_cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Emit {
        fair: Option<f64>,
        edge: Option<f64>,
        price: Option<f64>,
    },
    Skip(Rejection),
}

impl Decision {
    pub fn is_emit(&self) -> bool {
        matches!(self, Decision::Emit { .. })
    }
}

/// Fair "over" probability from a two-way price with the margin removed.
pub fn devig(price: TwoWayPrice) -> f64 {
    let p_over = 1.0 / price.over;
    let p_under = 1.0 / price.under;
    let margin = p_over + p_under - 1.0;
    p_over / (1.0 + margin)
}

/// Applies every gate in order and reports the first that fails.
pub fn evaluate(params: &PolicyParams, limits: &GateLimits, input: &GateInput) -> Decision {
    if input.phase == MatchPhase::HalfTime {
        return Decision::Skip(Rejection::HalfTimeBreak);
    }
    let (lo, hi) = limits.minute_range(input.market);
    if input.minute < lo || input.minute > hi {
        return Decision::Skip(Rejection::MinuteOutOfRange);
    }
    if limits.in_blackout(input.minute) {
        return Decision::Skip(Rejection::Blackout);
    }
    if input.dominance.abs() < params.min_dominance {
        return Decision::Skip(Rejection::LowDominance);
    }
    if input.ramp < params.min_ramp {
        return Decision::Skip(Rejection::LowRamp);
    }

    let mut priced = (None, None, None);
    match input.price {
        Some(price) => {
            let fair = devig(price);
            let edge = input.probability - fair;
            if edge < limits.min_edge(input.market) {
                return Decision::Skip(Rejection::LowEdge);
            }
            if price.over < limits.min_price {
                return Decision::Skip(Rejection::PriceTooShort);
            }
            priced = (Some(fair), Some(edge), Some(price.over));
        }
        None => {
            if input.probability < params.min_probability {
                return Decision::Skip(Rejection::LowProbability);
            }
        }
    }

    if params.min_uplift > 0.0
        && let Some(baseline) = input.baseline
        && baseline > 0.0
        && input.probability / baseline < params.min_uplift
    {
        return Decision::Skip(Rejection::LowUplift);
    }

    if let Some(since) = input.minutes_since_signal
        && since < params.cooldown_minutes
    {
        return Decision::Skip(Rejection::SignalCooldown);
    }
    if let Some(since) = input.minutes_since_goal
        && since < input.post_goal_cooldown
    {
        return Decision::Skip(Rejection::GoalCooldown);
    }

    let (fair, edge, price) = priced;
    Decision::Emit { fair, edge, price }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPolicy {
    pub scope: Scope,
    pub params: PolicyParams,
    pub samples: usize,
    pub pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeFloors {
    pub global: usize,
    pub league: usize,
    pub team: usize,
}

impl ScopeFloors {
    pub fn from_trainer(cfg: &TrainerConfig) -> Self {
        Self {
            global: cfg.min_signals_global,
            league: cfg.min_signals_league,
            team: cfg.min_signals_team,
        }
    }

    pub fn for_scope(&self, scope: &Scope) -> usize {
        match scope {
            Scope::Global => self.global,
            Scope::League(_) => self.league,
            Scope::Team(_) => self.team,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicy {
    pub params: PolicyParams,
    /// `None` when the configured defaults apply.
    pub scope: Option<Scope>,
}

/// Trained policies by scope with narrow-to-broad fallback.
#[derive(Debug, Clone)]
pub struct PolicyBook {
    policies: HashMap<Scope, ScopedPolicy>,
    defaults: PolicyParams,
    floors: ScopeFloors,
}

impl PolicyBook {
    pub fn new(defaults: PolicyParams, floors: ScopeFloors) -> Self {
        Self {
            policies: HashMap::new(),
            defaults,
            floors,
        }
    }

    pub fn load(store: &Store, defaults: PolicyParams, floors: ScopeFloors) -> Result<Self> {
        let mut book = Self::new(defaults, floors);
        for policy in store.load_policies()? {
            book.insert(policy);
        }
        Ok(book)
    }

    pub fn insert(&mut self, policy: ScopedPolicy) {
        self.policies.insert(policy.scope.clone(), policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn resolve(&self, keys: &ScopeKeys) -> ResolvedPolicy {
        let chain = [
            Scope::Team(keys.home.clone()),
            Scope::Team(keys.away.clone()),
            Scope::League(keys.league.clone()),
            Scope::Global,
        ];
        for scope in chain {
            if let Some(policy) = self.policies.get(&scope)
                && policy.samples >= self.floors.for_scope(&scope)
            {
                return ResolvedPolicy {
                    params: policy.params,
                    scope: Some(scope),
                };
            }
        }
        ResolvedPolicy {
            params: self.defaults,
            scope: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devig_removes_margin() {
        let fair = devig(TwoWayPrice {
            over: 1.8,
            under: 2.0,
        });
        let p_over = 1.0 / 1.8;
        let p_under = 1.0 / 2.0;
        assert!((fair - p_over / (p_over + p_under)).abs() < 1e-12);
        assert!(fair < p_over);
    }

    #[test]
    fn rejection_names_are_stable() {
        assert_eq!(Rejection::LowDominance.as_str(), "low_dominance");
        assert_eq!(Rejection::GoalCooldown.as_str(), "goal_cooldown");
    }
}
