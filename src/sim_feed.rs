use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ingest::FeedEvent;
use crate::tick::{
    FULL_TIME_MINUTE, HALF_TIME_MINUTE, MarketQuotes, MatchContext, SideStats, Tick,
};

const LEAGUES: [(&str, [&str; 6]); 3] = [
    (
        "Serie A - Round 7",
        ["Inter", "Milan", "Juventus", "Napoli", "Roma", "Lazio"],
    ),
    (
        "Premier League",
        ["Arsenal", "Chelsea", "Liverpool", "Everton", "Fulham", "Brentford"],
    ),
    (
        "Brasileirao: Serie A",
        ["Flamengo", "Palmeiras", "Santos", "Gremio", "Bahia", "Vasco"],
    ),
];

const BASE_TS: i64 = 1_767_225_600_000;
const MARGIN: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub struct SimOptions {
    pub seed: u64,
    pub with_quotes: bool,
    pub with_xg: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            seed: 7,
            with_quotes: false,
            with_xg: true,
        }
    }
}

struct SideSim {
    stats: SideStats,
    momentum: f64,
}

impl SideSim {
    fn new(with_xg: bool) -> Self {
        Self {
            stats: SideStats {
                goals: 0,
                shots_total: Some(0),
                shots_on_target: Some(0),
                shots_off_target: Some(0),
                corners: Some(0),
                dangerous_attacks: Some(0),
                xg: with_xg.then_some(0.0),
            },
            momentum: 0.0,
        }
    }

    /// Advances one minute; returns whether this side scored.
    fn step(&mut self, rng: &mut StdRng, strength: f64) -> bool {
        self.momentum = (self.momentum * 0.8 + rng.gen_range(-0.3..0.5)).clamp(0.0, 2.0);
        let press = strength + self.momentum;
        let bump = |slot: &mut Option<u32>, n: u32| {
            if let Some(v) = slot {
                *v += n;
            }
        };

        let mut da = 0;
        for _ in 0..3 {
            if rng.gen_bool((0.18 * press).clamp(0.0, 0.95)) {
                da += 1;
            }
        }
        bump(&mut self.stats.dangerous_attacks, da);
        if rng.gen_bool((0.04 * press).clamp(0.0, 0.9)) {
            bump(&mut self.stats.corners, 1);
        }
        let on_target = rng.gen_bool((0.045 * press).clamp(0.0, 0.9));
        let off_target = rng.gen_bool((0.06 * press).clamp(0.0, 0.9));
        if on_target {
            bump(&mut self.stats.shots_on_target, 1);
            bump(&mut self.stats.shots_total, 1);
        }
        if off_target {
            bump(&mut self.stats.shots_off_target, 1);
            bump(&mut self.stats.shots_total, 1);
        }
        if let Some(xg) = self.stats.xg.as_mut() {
            if on_target {
                *xg += rng.gen_range(0.05..0.35);
            }
            if off_target {
                *xg += rng.gen_range(0.01..0.08);
            }
        }

        let p_goal = 0.006 + if on_target { 0.22 } else { 0.0 } + 0.004 * self.momentum;
        let scored = rng.gen_bool(p_goal.clamp(0.0, 0.9));
        if scored {
            self.stats.goals += 1;
            self.momentum = 0.0;
        }
        scored
    }
}

fn quotes_for(minute: u16, home: &SideSim, away: &SideSim) -> MarketQuotes {
    let rate = 0.028 + 0.01 * (home.momentum + away.momentum);
    let price = |horizon: u16| -> (Option<f64>, Option<f64>) {
        if horizon == 0 {
            return (None, None);
        }
        let p_over = (1.0 - (-rate * f64::from(horizon)).exp()).clamp(0.02, 0.98);
        let over = 1.0 / (p_over * (1.0 + MARGIN));
        let under = 1.0 / ((1.0 - p_over) * (1.0 + MARGIN));
        (Some(over), Some(under))
    };
    let (over05_ht, under05_ht) = price(HALF_TIME_MINUTE.saturating_sub(minute));
    let (over05_ft, under05_ft) = price(FULL_TIME_MINUTE.saturating_sub(minute));
    MarketQuotes {
        over05_ht,
        under05_ht,
        over05_ft,
        under05_ft,
    }
}

/// Context plus one tick per played minute for a single synthetic match,
/// including a half-time tick and a final full-time tick.
pub fn simulate_match(index: usize, opts: &SimOptions) -> Vec<FeedEvent> {
    let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_mul(1_000_003).wrapping_add(index as u64));
    let (league, teams) = LEAGUES[index % LEAGUES.len()];
    let home_idx = rng.gen_range(0..teams.len());
    let away_idx = (home_idx + rng.gen_range(1..teams.len())) % teams.len();
    let match_id = format!("sim-{}-{index}", opts.seed);

    let mut events = vec![FeedEvent::Context(MatchContext {
        match_id: match_id.clone(),
        league: league.to_string(),
        home: teams[home_idx].to_string(),
        away: teams[away_idx].to_string(),
    })];

    let home_strength = rng.gen_range(0.7..1.5);
    let away_strength = rng.gen_range(0.5..1.3);
    let mut home = SideSim::new(opts.with_xg);
    let mut away = SideSim::new(opts.with_xg);
    let stoppage = rng.gen_range(1..5u16);
    let kickoff = BASE_TS + index as i64 * 7_200_000;

    let tick = |minute: u16, status: &str, home: &SideSim, away: &SideSim, seq: i64| {
        FeedEvent::Tick(Tick {
            match_id: match_id.clone(),
            ts: kickoff + i64::from(minute) * 60_000 + seq,
            minute,
            status: status.to_string(),
            home: home.stats.clone(),
            away: away.stats.clone(),
            quotes: opts.with_quotes.then(|| quotes_for(minute, home, away)),
        })
    };

    events.push(tick(0, "1st half", &home, &away, 0));
    for minute in 1..=(FULL_TIME_MINUTE + stoppage) {
        home.step(&mut rng, home_strength);
        away.step(&mut rng, away_strength);
        let label = if minute <= HALF_TIME_MINUTE { "1st half" } else { "2nd half" };
        events.push(tick(minute.min(FULL_TIME_MINUTE), label, &home, &away, i64::from(minute)));
        if minute == HALF_TIME_MINUTE {
            events.push(tick(minute, "HT", &home, &away, 30_000));
        }
    }
    events.push(tick(FULL_TIME_MINUTE, "FT", &home, &away, 59_000));
    events
}

/// Interleaves several matches minute by minute, as a live feed would.
pub fn generate(matches: usize, opts: &SimOptions) -> Vec<FeedEvent> {
    let per_match: Vec<Vec<FeedEvent>> = (0..matches).map(|i| simulate_match(i, opts)).collect();
    let longest = per_match.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = Vec::with_capacity(per_match.iter().map(Vec::len).sum());
    for step in 0..longest {
        for events in &per_match {
            if let Some(e) = events.get(step) {
                out.push(e.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_match() {
        let opts = SimOptions::default();
        assert_eq!(simulate_match(3, &opts), simulate_match(3, &opts));
    }

    #[test]
    fn goals_never_decrease() {
        let opts = SimOptions {
            seed: 11,
            with_quotes: true,
            with_xg: false,
        };
        let mut last = 0;
        for event in simulate_match(0, &opts) {
            if let FeedEvent::Tick(t) = event {
                assert!(t.total_goals() >= last);
                last = t.total_goals();
            }
        }
    }
}
