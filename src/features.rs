use crate::config::FeatureConfig;
use crate::tick::{SideStats, Tick};

pub const MULTI_SCALE_WINDOWS: [u16; 4] = [1, 3, 6, 10];
pub const NONE_SIGNATURE: &str = "NONE";

const MINUTE_BUCKET_MAX: u8 = 20;
const GOAL_DIFF_LIMIT: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Xg,
    ShotsTotal,
    ShotsOnTarget,
    ShotsOffTarget,
    Corners,
    DangerousAttacks,
}

impl Stat {
    pub const ALL: [Stat; 6] = [
        Stat::Xg,
        Stat::ShotsTotal,
        Stat::ShotsOnTarget,
        Stat::ShotsOffTarget,
        Stat::Corners,
        Stat::DangerousAttacks,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Stat::Xg => "xg",
            Stat::ShotsTotal => "st",
            Stat::ShotsOnTarget => "sot",
            Stat::ShotsOffTarget => "soff",
            Stat::Corners => "corners",
            Stat::DangerousAttacks => "da",
        }
    }

    pub fn is_rate(self) -> bool {
        matches!(self, Stat::Xg)
    }

    pub fn read(self, side: &SideStats) -> Option<f64> {
        match self {
            Stat::Xg => side.xg,
            Stat::ShotsTotal => side.shots_total.map(f64::from),
            Stat::ShotsOnTarget => side.shots_on_target.map(f64::from),
            Stat::ShotsOffTarget => side.shots_off_target.map(f64::from),
            Stat::Corners => side.corners.map(f64::from),
            Stat::DangerousAttacks => side.dangerous_attacks.map(f64::from),
        }
    }
}

/// Non-negative per-side increments between two ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SideDelta {
    pub xg: f64,
    pub shots_total: f64,
    pub shots_on_target: f64,
    pub shots_off_target: f64,
    pub corners: f64,
    pub dangerous_attacks: f64,
}

impl SideDelta {
    fn between(base: &SideStats, current: &SideStats) -> Self {
        let d = |stat: Stat| {
            let now = stat.read(current).unwrap_or(0.0);
            let then = stat.read(base).unwrap_or(0.0);
            (now - then).max(0.0)
        };
        Self {
            xg: d(Stat::Xg),
            shots_total: d(Stat::ShotsTotal),
            shots_on_target: d(Stat::ShotsOnTarget),
            shots_off_target: d(Stat::ShotsOffTarget),
            corners: d(Stat::Corners),
            dangerous_attacks: d(Stat::DangerousAttacks),
        }
    }

    pub fn pressure(&self, cfg: &FeatureConfig) -> f64 {
        self.shots_on_target * cfg.w_shots_on_target
            + self.shots_off_target * cfg.w_shots_off_target
            + self.dangerous_attacks * cfg.w_dangerous_attacks
            + self.corners * cfg.w_corners
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowDelta {
    pub home: SideDelta,
    pub away: SideDelta,
    pub from_minute: u16,
    pub to_minute: u16,
}

/// Deltas over the last `w` minutes ending at `now`. `history` must be sorted
/// ascending by minute. The baseline is the latest tick at or before `now - w`,
/// or the earliest tick when the match is younger than the window.
pub fn window_delta(history: &[Tick], now: u16, w: u16) -> Option<WindowDelta> {
    let (base, current) = window_bounds(history, now, w)?;
    let (base, current) = (&history[base], &history[current]);
    Some(WindowDelta {
        home: SideDelta::between(&base.home, &current.home),
        away: SideDelta::between(&base.away, &current.away),
        from_minute: base.minute,
        to_minute: current.minute,
    })
}

/// Indices of the baseline and current ticks for a window ending at `now`.
fn window_bounds(history: &[Tick], now: u16, w: u16) -> Option<(usize, usize)> {
    let end = history.partition_point(|t| t.minute <= now);
    if end == 0 {
        return None;
    }
    let target = now.saturating_sub(w);
    let base = history[..end]
        .partition_point(|t| t.minute <= target)
        .saturating_sub(1);
    Some((base, end - 1))
}

/// Ticks spanning the window ending at `now`, baseline first.
pub fn window_rows(history: &[Tick], now: u16, w: u16) -> &[Tick] {
    match window_bounds(history, now, w) {
        Some((base, current)) => &history[base..=current],
        None => &[],
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pressure {
    pub home: f64,
    pub away: f64,
}

impl Pressure {
    pub fn dominance(&self) -> f64 {
        self.home - self.away
    }

    pub fn intensity(&self) -> f64 {
        self.home + self.away
    }
}

pub fn pressure(home: &SideDelta, away: &SideDelta, cfg: &FeatureConfig) -> Pressure {
    Pressure {
        home: home.pressure(cfg),
        away: away.pressure(cfg),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScaleValues {
    pub window: u16,
    pub dominance: f64,
    pub intensity: f64,
    pub sot_rate: f64,
    pub shot_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MultiScale {
    pub scales: [ScaleValues; 4],
    pub ramp: f64,
}

impl MultiScale {
    pub fn at(&self, window: u16) -> Option<&ScaleValues> {
        self.scales.iter().find(|s| s.window == window)
    }
}

pub fn multi_scale(history: &[Tick], now: u16, cfg: &FeatureConfig) -> MultiScale {
    let mut scales = [ScaleValues::default(); 4];
    for (slot, &w) in scales.iter_mut().zip(MULTI_SCALE_WINDOWS.iter()) {
        slot.window = w;
        if let Some(delta) = window_delta(history, now, w) {
            let p = pressure(&delta.home, &delta.away, cfg);
            slot.dominance = p.dominance();
            slot.intensity = p.intensity();
            slot.sot_rate = (delta.home.shots_on_target + delta.away.shots_on_target) / f64::from(w);
            slot.shot_rate = (delta.home.shots_total + delta.away.shots_total) / f64::from(w);
        }
    }
    let dom3 = scales[1].dominance;
    let dom10 = scales[3].dominance;
    let ramp = (dom3 - dom10) / (3.0 - 10.0);
    MultiScale { scales, ramp }
}

fn bin_count(v: f64) -> u8 {
    let v = v.max(0.0).floor();
    if v <= 0.0 {
        0
    } else if v < 2.0 {
        1
    } else if v < 3.0 {
        2
    } else {
        3
    }
}

fn bin_rate(v: f64) -> u8 {
    let v = v.max(0.0);
    if v < 0.005 {
        0
    } else if v < 0.05 {
        1
    } else if v < 0.10 {
        2
    } else if v < 0.20 {
        3
    } else if v < 0.35 {
        4
    } else {
        5
    }
}

/// Order-independent encoding of per-statistic intensity and dominance bins
/// between the first and last row.
pub fn signature(rows: &[Tick]) -> String {
    if rows.len() < 2 {
        return NONE_SIGNATURE.to_string();
    }
    let (first, last) = (&rows[0], &rows[rows.len() - 1]);

    let mut parts = Vec::new();
    for stat in Stat::ALL {
        let (Some(h0), Some(h1), Some(a0), Some(a1)) = (
            stat.read(&first.home),
            stat.read(&last.home),
            stat.read(&first.away),
            stat.read(&last.away),
        ) else {
            continue;
        };
        let dh = h1 - h0;
        let da = a1 - a0;
        let sum = (dh + da).max(0.0);
        let dom = dh - da;
        let bin = if stat.is_rate() { bin_rate } else { bin_count };
        let sign = if dom > 0.0 {
            'P'
        } else if dom < 0.0 {
            'N'
        } else {
            'Z'
        };
        parts.push(format!("{}:S{},D{}{}", stat.key(), bin(sum), bin(dom.abs()), sign));
    }
    if parts.is_empty() {
        return NONE_SIGNATURE.to_string();
    }
    parts.sort();
    parts.join(";")
}

pub fn fnv1a32(input: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in input.bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Signature hash as stored in model cells. Zero is the wildcard bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SigBin(pub u32);

impl SigBin {
    pub const WILDCARD: SigBin = SigBin(0);

    pub fn of(signature: &str) -> SigBin {
        match fnv1a32(signature) {
            0 => SigBin(1),
            h => SigBin(h),
        }
    }

    pub fn is_wildcard(self) -> bool {
        self.0 == 0
    }
}

pub fn minute_bucket(minute: u16) -> u8 {
    let bucket = (minute / 5).min(u16::from(MINUTE_BUCKET_MAX));
    bucket as u8
}

pub fn gd_bin(goal_diff: i32) -> i8 {
    goal_diff.clamp(-GOAL_DIFF_LIMIT, GOAL_DIFF_LIMIT) as i8
}

/// Everything the estimators, gates and trainer read for one match minute.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteFeatures {
    pub minute: u16,
    pub goal_diff: i32,
    pub total_goals: u32,
    pub dominance: f64,
    pub intensity: f64,
    pub multi: MultiScale,
    pub signature: String,
    pub sig_bin: SigBin,
    pub minutes_since_goal: Option<u16>,
}

impl MinuteFeatures {
    pub fn ramp(&self) -> f64 {
        self.multi.ramp
    }

    pub fn minute_bucket(&self) -> u8 {
        minute_bucket(self.minute)
    }

    pub fn gd_bin(&self) -> i8 {
        gd_bin(self.goal_diff)
    }
}

/// Computes features at `now` from a history sorted ascending by minute.
/// Returns `None` until at least one tick at or before `now` exists.
pub fn minute_features(
    history: &[Tick],
    now: u16,
    last_goal_minute: Option<u16>,
    cfg: &FeatureConfig,
) -> Option<MinuteFeatures> {
    let delta = window_delta(history, now, cfg.lookback_minutes)?;
    let rows = window_rows(history, now, cfg.lookback_minutes);
    let current = rows.last()?;
    let p = pressure(&delta.home, &delta.away, cfg);
    let signature = signature(rows);
    let sig_bin = SigBin::of(&signature);
    Some(MinuteFeatures {
        minute: now,
        goal_diff: current.goal_diff(),
        total_goals: current.total_goals(),
        dominance: p.dominance(),
        intensity: p.intensity(),
        multi: multi_scale(history, now, cfg),
        signature,
        sig_bin,
        minutes_since_goal: last_goal_minute.map(|g| now.saturating_sub(g)),
    })
}
