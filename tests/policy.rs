use goalwatch::counter_model::{Scope, ScopeKeys};
use goalwatch::policy::{
    Decision, GateInput, GateLimits, PolicyBook, PolicyParams, Rejection, ScopeFloors,
    ScopedPolicy, evaluate,
};
use goalwatch::tick::{Market, MatchPhase, TwoWayPrice};

fn input(market: Market, minute: u16) -> GateInput {
    GateInput {
        market,
        minute,
        phase: MatchPhase::Live,
        dominance: 4.0,
        ramp: 0.5,
        probability: 0.7,
        baseline: Some(0.4),
        price: None,
        minutes_since_signal: None,
        minutes_since_goal: None,
        post_goal_cooldown: 2,
    }
}

fn skip(params: &PolicyParams, gi: &GateInput) -> Option<Rejection> {
    match evaluate(params, &GateLimits::default(), gi) {
        Decision::Skip(r) => Some(r),
        Decision::Emit { .. } => None,
    }
}

#[test]
fn time_gates_per_lane() {
    let p = PolicyParams::default();
    assert_eq!(skip(&p, &input(Market::FirstHalf, 7)), Some(Rejection::MinuteOutOfRange));
    assert_eq!(skip(&p, &input(Market::FirstHalf, 8)), None);
    assert_eq!(skip(&p, &input(Market::FirstHalf, 36)), Some(Rejection::MinuteOutOfRange));
    assert_eq!(skip(&p, &input(Market::FullTime, 24)), Some(Rejection::MinuteOutOfRange));
    assert_eq!(skip(&p, &input(Market::FullTime, 47)), Some(Rejection::Blackout));
    assert_eq!(skip(&p, &input(Market::FullTime, 51)), None);
    assert_eq!(skip(&p, &input(Market::FullTime, 81)), Some(Rejection::MinuteOutOfRange));

    let mut at_break = input(Market::FullTime, 30);
    at_break.phase = MatchPhase::HalfTime;
    assert_eq!(skip(&p, &at_break), Some(Rejection::HalfTimeBreak));
}

#[test]
fn pressure_and_probability_gates() {
    let p = PolicyParams::default();
    let mut gi = input(Market::FullTime, 60);
    gi.dominance = -3.5;
    assert_eq!(skip(&p, &gi), None, "away dominance counts by magnitude");
    gi.dominance = 2.9;
    assert_eq!(skip(&p, &gi), Some(Rejection::LowDominance));

    let mut gi = input(Market::FullTime, 60);
    gi.ramp = 0.1;
    assert_eq!(skip(&p, &gi), Some(Rejection::LowRamp));

    let mut gi = input(Market::FullTime, 60);
    gi.probability = 0.55;
    assert_eq!(skip(&p, &gi), Some(Rejection::LowProbability));

    let uplift = PolicyParams {
        min_uplift: 1.8,
        ..p
    };
    assert_eq!(skip(&uplift, &input(Market::FullTime, 60)), Some(Rejection::LowUplift));
    let mut no_base = input(Market::FullTime, 60);
    no_base.baseline = None;
    assert_eq!(skip(&uplift, &no_base), None);
}

#[test]
fn priced_lane_uses_edge_and_min_price() {
    let p = PolicyParams::default();
    let mut gi = input(Market::FullTime, 60);
    gi.probability = 0.58;
    gi.price = Some(TwoWayPrice {
        over: 2.0,
        under: 1.9,
    });
    match evaluate(&p, &GateLimits::default(), &gi) {
        Decision::Emit { fair, edge, price } => {
            let fair = fair.unwrap();
            assert!(fair < 0.5);
            assert!((edge.unwrap() - (0.58 - fair)).abs() < 1e-12);
            assert_eq!(price, Some(2.0));
        }
        other => panic!("expected emit, got {other:?}"),
    }

    gi.probability = 0.52;
    assert_eq!(skip(&p, &gi), Some(Rejection::LowEdge));

    gi.probability = 0.9;
    gi.price = Some(TwoWayPrice {
        over: 1.5,
        under: 2.6,
    });
    assert_eq!(skip(&p, &gi), Some(Rejection::PriceTooShort));
}

#[test]
fn cooldowns() {
    let p = PolicyParams::default();
    let mut gi = input(Market::FullTime, 60);
    gi.minutes_since_signal = Some(2);
    assert_eq!(skip(&p, &gi), Some(Rejection::SignalCooldown));
    gi.minutes_since_signal = Some(3);
    assert_eq!(skip(&p, &gi), None);
    gi.minutes_since_goal = Some(1);
    assert_eq!(skip(&p, &gi), Some(Rejection::GoalCooldown));
}

#[test]
fn resolve_walks_team_league_global_and_honours_floors() {
    let floors = ScopeFloors {
        global: 1000,
        league: 400,
        team: 200,
    };
    let defaults = PolicyParams::default();
    let mut book = PolicyBook::new(defaults, floors);
    let keys = ScopeKeys {
        league: "serie a".to_string(),
        home: "inter".to_string(),
        away: "milan".to_string(),
    };
    let tuned = |scope: Scope, samples: usize, dom: f64| ScopedPolicy {
        scope,
        params: PolicyParams {
            min_dominance: dom,
            ..defaults
        },
        samples,
        pnl: 1.0,
    };

    assert_eq!(book.resolve(&keys).scope, None);

    book.insert(tuned(Scope::Global, 1500, 1.0));
    assert_eq!(book.resolve(&keys).scope, Some(Scope::Global));

    book.insert(tuned(Scope::League("serie a".to_string()), 399, 2.0));
    assert_eq!(book.resolve(&keys).scope, Some(Scope::Global));
    book.insert(tuned(Scope::League("serie a".to_string()), 450, 2.0));
    assert_eq!(book.resolve(&keys).params.min_dominance, 2.0);

    book.insert(tuned(Scope::Team("milan".to_string()), 250, 4.0));
    assert_eq!(book.resolve(&keys).scope, Some(Scope::Team("milan".to_string())));
    book.insert(tuned(Scope::Team("inter".to_string()), 220, 5.0));
    assert_eq!(book.resolve(&keys).params.min_dominance, 5.0);
}
