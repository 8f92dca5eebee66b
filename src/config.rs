//! Every tunable number the engine uses lives here. Defaults are the
//! documented constants; `EngineConfig::from_env` applies overrides from the
//! process environment (after loading `.env.local` / `.env`). Policies written
//! by the trainer override `default_policy` per scope at decision time.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::policy::{GateLimits, PolicyParams};

const APP_DIR: &str = "goalwatch";

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub w_shots_on_target: f64,
    pub w_shots_off_target: f64,
    pub w_dangerous_attacks: f64,
    pub w_corners: f64,
    /// Lookback for the dominance gate and the feature signature.
    pub lookback_minutes: u16,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            w_shots_on_target: 3.0,
            w_shots_off_target: 1.5,
            w_dangerous_attacks: 0.5,
            w_corners: 0.5,
            lookback_minutes: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Global base rate of "goal within window"; returned for absent cells.
    pub prior: f64,
    /// Pseudo-count strength pulling sparse cells toward `prior`.
    pub alpha: f64,
    pub k_global: f64,
    pub k_league: f64,
    pub k_team: f64,
    /// Window whose counters feed hazard projection onto the HT/FT horizons.
    pub base_window: u16,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            prior: 0.28,
            alpha: 50.0,
            k_global: 500.0,
            k_league: 200.0,
            k_team: 100.0,
            base_window: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PayoutTable {
    pub win_ht: f64,
    pub win_ft_early: f64,
    pub win_ft_late: f64,
    /// FT signals created at or after this minute pay `win_ft_late`.
    pub ft_late_from_minute: u16,
    pub loss: f64,
}

impl Default for PayoutTable {
    fn default() -> Self {
        Self {
            win_ht: 1.2,
            win_ft_early: 1.1,
            win_ft_late: 1.2,
            ft_late_from_minute: 50,
            loss: -1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub windows: Vec<u16>,
    pub open_half_window: bool,
    pub open_full_window: bool,
    pub post_goal_cooldown: u16,
    pub payouts: PayoutTable,
    pub history_cap: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            windows: vec![10, 15, 20, 25, 30],
            open_half_window: true,
            open_full_window: true,
            post_goal_cooldown: 2,
            payouts: PayoutTable::default(),
            history_cap: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorMode {
    Counter,
    Logistic,
    Remote,
    Blend,
}

impl FromStr for EstimatorMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "counter" => Ok(EstimatorMode::Counter),
            "logistic" | "logreg" => Ok(EstimatorMode::Logistic),
            "remote" | "ml" => Ok(EstimatorMode::Remote),
            "blend" => Ok(EstimatorMode::Blend),
            other => Err(format!("unknown estimator mode {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionConfig {
    pub mode: EstimatorMode,
    pub remote_url: Option<String>,
    pub timeout_ms: u64,
    pub weight_counter: f64,
    pub weight_logistic: f64,
    pub weight_remote: f64,
    pub logistic_dim: usize,
    pub logistic_lr: f64,
    pub logistic_l2: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            mode: EstimatorMode::Counter,
            remote_url: None,
            timeout_ms: 800,
            weight_counter: 1.0,
            weight_logistic: 1.0,
            weight_remote: 1.0,
            logistic_dim: 1 << 17,
            logistic_lr: 0.05,
            logistic_l2: 1e-6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyGrid {
    pub min_probability: Vec<f64>,
    pub min_uplift: Vec<f64>,
    pub min_dominance: Vec<f64>,
    pub min_ramp: Vec<f64>,
    pub cooldown_minutes: Vec<u16>,
}

impl Default for PolicyGrid {
    fn default() -> Self {
        Self {
            min_probability: vec![0.50, 0.55, 0.60, 0.65],
            min_uplift: vec![1.2, 1.5, 1.8],
            min_dominance: vec![1.0, 2.0, 3.0],
            min_ramp: vec![0.5, 1.0, 1.5],
            cooldown_minutes: vec![1, 2, 3],
        }
    }
}

impl PolicyGrid {
    pub fn combinations(&self) -> Vec<PolicyParams> {
        let mut out = Vec::new();
        for &min_probability in &self.min_probability {
            for &min_uplift in &self.min_uplift {
                for &min_dominance in &self.min_dominance {
                    for &min_ramp in &self.min_ramp {
                        for &cooldown_minutes in &self.cooldown_minutes {
                            out.push(PolicyParams {
                                min_probability,
                                min_uplift,
                                min_dominance,
                                min_ramp,
                                cooldown_minutes,
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub grid: PolicyGrid,
    pub min_signals_global: usize,
    pub min_signals_league: usize,
    pub min_signals_team: usize,
    pub backfill_windows: Vec<u16>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            grid: PolicyGrid::default(),
            min_signals_global: 1000,
            min_signals_league: 400,
            min_signals_team: 200,
            backfill_windows: vec![5, 10, 15, 20, 25],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn tracker_state_path(&self) -> PathBuf {
        self.data_dir.join("tracker_state.json")
    }

    pub fn audit_csv_path(&self) -> PathBuf {
        self.data_dir.join("signals_audit.csv")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("events.sqlite"),
            data_dir,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub lifecycle: LifecycleConfig,
    pub default_policy: PolicyParams,
    pub gates: GateLimits,
    pub prediction: PredictionConfig,
    pub trainer: TrainerConfig,
    pub storage: StorageConfig,
    pub shards: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");

        let mut cfg = EngineConfig {
            shards: 4,
            ..EngineConfig::default()
        };

        cfg.shards = env_parse::<usize>("ENGINE_SHARDS")
            .unwrap_or(cfg.shards)
            .clamp(1, 64);

        let f = &mut cfg.features;
        f.lookback_minutes = env_parse::<u16>("PRESS_LOOKBACK_MIN")
            .unwrap_or(f.lookback_minutes)
            .clamp(2, 30);

        let m = &mut cfg.model;
        m.prior = env_parse::<f64>("MODEL_PRIOR")
            .unwrap_or(m.prior)
            .clamp(0.01, 0.99);
        m.alpha = env_parse::<f64>("MODEL_ALPHA")
            .unwrap_or(m.alpha)
            .clamp(0.0, 10_000.0);
        m.k_global = env_parse::<f64>("K_GLOBAL").unwrap_or(m.k_global).max(1.0);
        m.k_league = env_parse::<f64>("K_LEAGUE").unwrap_or(m.k_league).max(1.0);
        m.k_team = env_parse::<f64>("K_TEAM").unwrap_or(m.k_team).max(1.0);
        m.base_window = env_parse::<u16>("TRAIN_BASE_WINDOW")
            .unwrap_or(m.base_window)
            .clamp(1, 45);

        let l = &mut cfg.lifecycle;
        if let Some(windows) = env_list::<u16>("PENDING_WINDOWS") {
            l.windows = windows.into_iter().filter(|w| *w > 0).collect();
        }
        l.post_goal_cooldown = env_parse::<u16>("POST_GOAL_COOLDOWN").unwrap_or(l.post_goal_cooldown);
        l.payouts.win_ht = env_parse::<f64>("WIN_HT").unwrap_or(l.payouts.win_ht);
        l.payouts.win_ft_early = env_parse::<f64>("WIN_FT_BEFORE50").unwrap_or(l.payouts.win_ft_early);
        l.payouts.win_ft_late = env_parse::<f64>("WIN_FT_AFTER50").unwrap_or(l.payouts.win_ft_late);
        l.payouts.loss = -env_parse::<f64>("LOSE_ANY")
            .map(f64::abs)
            .unwrap_or(l.payouts.loss.abs());

        let p = &mut cfg.default_policy;
        p.min_probability = env_parse::<f64>("POLICY_MIN_P")
            .unwrap_or(p.min_probability)
            .clamp(0.0, 1.0);
        p.min_uplift = env_parse::<f64>("POLICY_MIN_UPLIFT").unwrap_or(p.min_uplift);
        p.min_dominance = env_parse::<f64>("MIN_DOM6").unwrap_or(p.min_dominance);
        p.min_ramp = env_parse::<f64>("MIN_SLOPE6").unwrap_or(p.min_ramp);
        p.cooldown_minutes = env_parse::<u16>("COOLDOWN_MIN").unwrap_or(p.cooldown_minutes);

        let g = &mut cfg.gates;
        g.ht_min_minute = env_parse::<u16>("MIN_MIN_HT").unwrap_or(g.ht_min_minute);
        g.ht_max_minute = env_parse::<u16>("MAX_MIN_HT").unwrap_or(g.ht_max_minute);
        g.ft_min_minute = env_parse::<u16>("MIN_MIN_FT").unwrap_or(g.ft_min_minute);
        g.ft_max_minute = env_parse::<u16>("MAX_MIN_FT").unwrap_or(g.ft_max_minute);
        g.min_edge_ht = env_parse::<f64>("EDGE_HT").unwrap_or(g.min_edge_ht);
        g.min_edge_ft = env_parse::<f64>("EDGE_FT").unwrap_or(g.min_edge_ft);
        g.min_price = env_parse::<f64>("MIN_ODDS").unwrap_or(g.min_price);

        let pr = &mut cfg.prediction;
        pr.remote_url = env::var("ML_URL").ok().filter(|s| !s.trim().is_empty());
        pr.mode = env_parse::<EstimatorMode>("ESTIMATOR").unwrap_or(if pr.remote_url.is_some() {
            EstimatorMode::Blend
        } else {
            pr.mode
        });
        pr.timeout_ms = env_parse::<u64>("ML_TIMEOUT_MS")
            .unwrap_or(pr.timeout_ms)
            .clamp(50, 10_000);
        pr.weight_counter = env_parse::<f64>("BLEND_W_COUNTER").unwrap_or(pr.weight_counter).max(0.0);
        pr.weight_logistic = env_parse::<f64>("BLEND_W_LOGISTIC").unwrap_or(pr.weight_logistic).max(0.0);
        pr.weight_remote = env_parse::<f64>("BLEND_W_REMOTE").unwrap_or(pr.weight_remote).max(0.0);

        let t = &mut cfg.trainer;
        t.min_signals_global = env_parse::<usize>("MIN_SIGNALS_GLOBAL").unwrap_or(t.min_signals_global);
        t.min_signals_league = env_parse::<usize>("MIN_SIGNALS_LEAGUE").unwrap_or(t.min_signals_league);
        t.min_signals_team = env_parse::<usize>("MIN_SIGNALS_TEAM").unwrap_or(t.min_signals_team);

        let s = &mut cfg.storage;
        if let Ok(dir) = env::var("DATA_DIR")
            && !dir.trim().is_empty()
        {
            s.data_dir = PathBuf::from(dir.trim());
            s.db_path = s.data_dir.join("events.sqlite");
        }
        if let Ok(path) = env::var("DB_PATH")
            && !path.trim().is_empty()
        {
            s.db_path = PathBuf::from(path.trim());
        }

        cfg
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn env_list<T: FromStr>(key: &str) -> Option<Vec<T>> {
    let raw = env::var(key).ok()?;
    let items = raw
        .split([',', ';', ' '])
        .filter_map(|part| part.trim().parse::<T>().ok())
        .collect::<Vec<_>>();
    if items.is_empty() { None } else { Some(items) }
}

fn default_data_dir() -> PathBuf {
    if let Ok(base) = env::var("XDG_DATA_HOME")
        && !base.trim().is_empty()
    {
        return PathBuf::from(base).join(APP_DIR);
    }
    match env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => {
            PathBuf::from(home).join(".local").join("share").join(APP_DIR)
        }
        _ => PathBuf::from("data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grid_has_full_cartesian_product() {
        let grid = PolicyGrid::default();
        assert_eq!(grid.combinations().len(), 4 * 3 * 3 * 3 * 3);
    }

    #[test]
    fn estimator_mode_parses_aliases() {
        assert_eq!("logreg".parse::<EstimatorMode>(), Ok(EstimatorMode::Logistic));
        assert_eq!(" Blend ".parse::<EstimatorMode>(), Ok(EstimatorMode::Blend));
        assert!("nope".parse::<EstimatorMode>().is_err());
    }
}
