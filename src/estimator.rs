use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{EstimatorMode, PredictionConfig};
use crate::counter_model::{CellCoords, CounterModel, ScopeBreakdown, ScopeKeys};
use crate::features::MinuteFeatures;
use crate::hazard;
use crate::online_logreg::{FeatureMap, FeatureValue, OnlineLogReg};
use crate::tick::{Market, Side};

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("prediction transport error: {0}")]
    Transport(String),
    #[error("prediction timed out after {0} ms")]
    Timeout(u64),
    #[error("prediction service returned status {0}")]
    Status(u16),
    #[error("malformed prediction payload: {0}")]
    Malformed(String),
    #[error("estimator not ready: {0}")]
    Unavailable(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HorizonProbs {
    pub p_half: f64,
    pub p_full: f64,
}

impl HorizonProbs {
    pub fn for_market(&self, market: Market) -> f64 {
        match market {
            Market::FirstHalf => self.p_half,
            Market::FullTime => self.p_full,
        }
    }
}

pub struct EstimateQuery<'a> {
    pub match_id: &'a str,
    pub features: &'a MinuteFeatures,
    pub keys: &'a ScopeKeys,
    pub feature_map: &'a FeatureMap,
}

pub trait ProbabilityEstimator: Send + Sync {
    fn name(&self) -> &'static str;
    fn estimate(&self, query: &EstimateQuery<'_>) -> Result<HorizonProbs, PredictError>;
}

/// Numeric and categorical inputs shared by the logistic and remote estimators.
pub fn feature_map(f: &MinuteFeatures, keys: &ScopeKeys) -> FeatureMap {
    let mut out = FeatureMap::new();
    let mut num = |k: String, v: f64| {
        out.insert(k, FeatureValue::Num(v));
    };
    num("minute".into(), f64::from(f.minute));
    num("is_ft".into(), if f.minute > 45 { 1.0 } else { 0.0 });
    num("gd".into(), f64::from(f.gd_bin()));
    num("total_goals".into(), f64::from(f.total_goals));
    for s in &f.multi.scales {
        num(format!("dom_{}", s.window), s.dominance);
        num(format!("psum_{}", s.window), s.intensity);
        num(format!("rate_sot_{}", s.window), s.sot_rate);
        num(format!("rate_st_{}", s.window), s.shot_rate);
    }
    num("slope_dom_6".into(), f.ramp());
    num(
        "since_goal".into(),
        f.minutes_since_goal.map(f64::from).unwrap_or(999.0),
    );
    out.insert("league".into(), FeatureValue::Cat(keys.league.clone()));
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterDetail {
    pub probs: HorizonProbs,
    /// `None` until some wildcard cell on the match's scopes has observations.
    pub baseline: Option<HorizonProbs>,
    pub breakdown: ScopeBreakdown,
}

/// Hierarchical counter probability on a fixed base window, projected onto
/// the time left in the half and in the match.
pub struct CounterEstimator {
    model: Arc<CounterModel>,
    base_window: u16,
}

impl CounterEstimator {
    pub fn new(model: Arc<CounterModel>) -> Self {
        let base_window = model.config().base_window;
        Self { model, base_window }
    }

    pub fn detail(&self, features: &MinuteFeatures, keys: &ScopeKeys) -> CounterDetail {
        let coords = CellCoords {
            window: self.base_window,
            side: Side::Any,
            sig_bin: features.sig_bin,
            minute_bucket: features.minute_bucket(),
            gd_bin: features.gd_bin(),
        };
        let breakdown = self.model.blend(keys, coords);
        let base = self.model.baseline(keys, coords);
        CounterDetail {
            probs: self.project(breakdown.blended, features.minute),
            baseline: has_observations(&base).then(|| self.project(base.blended, features.minute)),
            breakdown,
        }
    }

    fn project(&self, p: f64, minute: u16) -> HorizonProbs {
        HorizonProbs {
            p_half: hazard::project(p, self.base_window, Market::FirstHalf.remaining(minute)),
            p_full: hazard::project(p, self.base_window, Market::FullTime.remaining(minute)),
        }
    }
}

impl ProbabilityEstimator for CounterEstimator {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn estimate(&self, query: &EstimateQuery<'_>) -> Result<HorizonProbs, PredictError> {
        Ok(self.detail(query.features, query.keys).probs)
    }
}

fn has_observations(b: &ScopeBreakdown) -> bool {
    b.global.n + b.league.n + b.team.n > 0
}

/// One online logistic model per market lane.
pub struct LogisticEstimator {
    half: Mutex<OnlineLogReg>,
    full: Mutex<OnlineLogReg>,
    dir: Option<PathBuf>,
}

impl LogisticEstimator {
    pub fn new(cfg: &PredictionConfig) -> Self {
        Self {
            half: Mutex::new(OnlineLogReg::from_config(cfg)),
            full: Mutex::new(OnlineLogReg::from_config(cfg)),
            dir: None,
        }
    }

    /// Loads saved weights from `dir` when present; missing files start fresh.
    pub fn open(cfg: &PredictionConfig, dir: PathBuf) -> Self {
        let load = |market: Market| {
            let path = lane_path(&dir, market);
            if !path.exists() {
                return OnlineLogReg::from_config(cfg);
            }
            match OnlineLogReg::load(&path) {
                Ok(model) => model,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding unreadable logistic weights");
                    OnlineLogReg::from_config(cfg)
                }
            }
        };
        Self {
            half: Mutex::new(load(Market::FirstHalf)),
            full: Mutex::new(load(Market::FullTime)),
            dir: Some(dir),
        }
    }

    fn lane(&self, market: Market) -> &Mutex<OnlineLogReg> {
        match market {
            Market::FirstHalf => &self.half,
            Market::FullTime => &self.full,
        }
    }

    pub fn learn(&self, market: Market, features: &FeatureMap, y: bool) {
        let mut model = self.lane(market).lock().expect("logistic lock poisoned");
        model.update(features, y);
    }

    pub fn updates(&self, market: Market) -> u64 {
        self.lane(market)
            .lock()
            .expect("logistic lock poisoned")
            .updates()
    }

    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        for market in Market::ALL {
            let model = self.lane(market).lock().expect("logistic lock poisoned").clone();
            model
                .save(&lane_path(dir, market))
                .with_context(|| format!("save {} logistic model", market.as_str()))?;
        }
        Ok(())
    }
}

fn lane_path(dir: &std::path::Path, market: Market) -> PathBuf {
    dir.join(format!("online_logreg_{}.json", market.as_str().to_ascii_lowercase()))
}

impl ProbabilityEstimator for LogisticEstimator {
    fn name(&self) -> &'static str {
        "logistic"
    }

    fn estimate(&self, query: &EstimateQuery<'_>) -> Result<HorizonProbs, PredictError> {
        let half = self.half.lock().expect("logistic lock poisoned");
        let full = self.full.lock().expect("logistic lock poisoned");
        if half.updates() == 0 || full.updates() == 0 {
            return Err(PredictError::Unavailable("logistic model has no updates yet"));
        }
        Ok(HorizonProbs {
            p_half: half.predict(query.feature_map),
            p_full: full.predict(query.feature_map),
        })
    }
}

#[derive(Serialize)]
struct RemoteRequest<'a> {
    match_id: &'a str,
    features: &'a FeatureMap,
}

#[derive(Deserialize)]
struct RemoteReply {
    #[serde(alias = "p_half")]
    p_ht: f64,
    #[serde(alias = "p_full")]
    p_ft: f64,
}

/// Synchronous HTTP prediction service with a bounded timeout.
pub struct RemoteEstimator {
    url: String,
    timeout_ms: u64,
    client: OnceCell<Client>,
}

impl RemoteEstimator {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            url: url.into(),
            timeout_ms,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&Client, PredictError> {
        self.client.get_or_try_init(|| {
            Client::builder()
                .timeout(Duration::from_millis(self.timeout_ms))
                .build()
                .map_err(|e| PredictError::Transport(e.to_string()))
        })
    }
}

impl ProbabilityEstimator for RemoteEstimator {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn estimate(&self, query: &EstimateQuery<'_>) -> Result<HorizonProbs, PredictError> {
        let body = RemoteRequest {
            match_id: query.match_id,
            features: query.feature_map,
        };
        let resp = self
            .client()?
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    PredictError::Timeout(self.timeout_ms)
                } else {
                    PredictError::Transport(e.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PredictError::Status(status.as_u16()));
        }
        let text = resp.text().map_err(|e| {
            if e.is_timeout() {
                PredictError::Timeout(self.timeout_ms)
            } else {
                PredictError::Transport(e.to_string())
            }
        })?;
        parse_remote_reply(&text)
    }
}

pub fn parse_remote_reply(raw: &str) -> Result<HorizonProbs, PredictError> {
    let reply: RemoteReply =
        serde_json::from_str(raw).map_err(|e| PredictError::Malformed(e.to_string()))?;
    for (name, p) in [("p_ht", reply.p_ht), ("p_ft", reply.p_ft)] {
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(PredictError::Malformed(format!("{name} out of range: {p}")));
        }
    }
    Ok(HorizonProbs {
        p_half: reply.p_ht,
        p_full: reply.p_ft,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackEstimate {
    pub probs: HorizonProbs,
    pub source: String,
    pub counter: CounterDetail,
}

struct Weighted {
    estimator: Arc<dyn ProbabilityEstimator>,
    weight: f64,
}

/// Weighted blend of the configured estimators. The counter estimate is always
/// computed so that it can stand in when every other estimator fails.
pub struct EstimatorStack {
    counter: CounterEstimator,
    counter_weight: f64,
    others: Vec<Weighted>,
    logistic: Option<Arc<LogisticEstimator>>,
}

impl EstimatorStack {
    pub fn counter_only(model: Arc<CounterModel>) -> Self {
        Self {
            counter: CounterEstimator::new(model),
            counter_weight: 1.0,
            others: Vec::new(),
            logistic: None,
        }
    }

    pub fn from_config(
        cfg: &PredictionConfig,
        model: Arc<CounterModel>,
        logistic: Option<Arc<LogisticEstimator>>,
    ) -> Self {
        let mut stack = Self::counter_only(model);
        stack.logistic = logistic.clone();
        let remote = cfg
            .remote_url
            .as_ref()
            .map(|url| Arc::new(RemoteEstimator::new(url.clone(), cfg.timeout_ms)));

        match cfg.mode {
            EstimatorMode::Counter => {}
            EstimatorMode::Logistic => {
                if let Some(l) = logistic {
                    stack.counter_weight = 0.0;
                    stack.push(l, 1.0);
                } else {
                    warn!("logistic estimator requested but not built; using counter");
                }
            }
            EstimatorMode::Remote => {
                if let Some(r) = remote {
                    stack.counter_weight = 0.0;
                    stack.push(r, 1.0);
                } else {
                    warn!("remote estimator requested without ML_URL; using counter");
                }
            }
            EstimatorMode::Blend => {
                stack.counter_weight = cfg.weight_counter;
                if let Some(l) = logistic {
                    stack.push(l, cfg.weight_logistic);
                }
                if let Some(r) = remote {
                    stack.push(r, cfg.weight_remote);
                }
            }
        }
        stack
    }

    pub fn push(&mut self, estimator: Arc<dyn ProbabilityEstimator>, weight: f64) {
        if weight > 0.0 {
            self.others.push(Weighted { estimator, weight });
        }
    }

    pub fn logistic(&self) -> Option<&Arc<LogisticEstimator>> {
        self.logistic.as_ref()
    }

    pub fn estimate(&self, query: &EstimateQuery<'_>) -> StackEstimate {
        let counter = self.counter.detail(query.features, query.keys);

        let mut total = 0.0;
        let mut half = 0.0;
        let mut full = 0.0;
        let mut used: Vec<&'static str> = Vec::new();
        if self.counter_weight > 0.0 {
            total += self.counter_weight;
            half += self.counter_weight * counter.probs.p_half;
            full += self.counter_weight * counter.probs.p_full;
            used.push(self.counter.name());
        }
        for w in &self.others {
            match w.estimator.estimate(query) {
                Ok(p) => {
                    total += w.weight;
                    half += w.weight * p.p_half;
                    full += w.weight * p.p_full;
                    used.push(w.estimator.name());
                }
                Err(PredictError::Unavailable(reason)) => {
                    debug!(estimator = w.estimator.name(), reason, "estimator skipped");
                }
                Err(err) => {
                    warn!(
                        estimator = w.estimator.name(),
                        match_id = query.match_id,
                        error = %err,
                        "estimator failed; skipping"
                    );
                }
            }
        }

        if total <= 0.0 {
            return StackEstimate {
                probs: counter.probs,
                source: "counter".to_string(),
                counter,
            };
        }
        StackEstimate {
            probs: HorizonProbs {
                p_half: half / total,
                p_full: full / total,
            },
            source: used.join("+"),
            counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_reply_accepts_aliases() {
        let p = parse_remote_reply(r#"{"p_half":0.4,"p_full":0.7}"#).unwrap();
        assert_eq!(p.p_half, 0.4);
        assert_eq!(p.p_full, 0.7);
    }

    #[test]
    fn logistic_lanes_learn_and_reload_independently() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PredictionConfig::default();
        let mut f = FeatureMap::new();
        f.insert("dom_6".into(), 2.5.into());
        f.insert("league".into(), "serie a".into());

        let est = LogisticEstimator::open(&cfg, dir.path().to_path_buf());
        est.learn(Market::FirstHalf, &f, true);
        est.learn(Market::FirstHalf, &f, false);
        est.learn(Market::FullTime, &f, true);
        assert_eq!(est.updates(Market::FirstHalf), 2);
        assert_eq!(est.updates(Market::FullTime), 1);
        est.save().unwrap();

        let reloaded = LogisticEstimator::open(&cfg, dir.path().to_path_buf());
        assert_eq!(reloaded.updates(Market::FirstHalf), 2);
        assert_eq!(reloaded.updates(Market::FullTime), 1);
    }

    #[test]
    fn remote_reply_rejects_out_of_range() {
        let err = parse_remote_reply(r#"{"p_ht":1.4,"p_ft":0.7}"#).unwrap_err();
        assert!(matches!(err, PredictError::Malformed(_)));
        let err = parse_remote_reply("not json").unwrap_err();
        assert!(matches!(err, PredictError::Malformed(_)));
    }
}
