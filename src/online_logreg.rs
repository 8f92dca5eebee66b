use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::config::PredictionConfig;
use crate::features::fnv1a32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Num(f64),
    Cat(String),
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Num(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Cat(v.to_string())
    }
}

pub type FeatureMap = BTreeMap<String, FeatureValue>;

const SIGMOID_CLAMP: f64 = 35.0;

/// Hashed-feature logistic regression trained by single SGD steps.
#[derive(Debug, Clone)]
pub struct OnlineLogReg {
    dim: usize,
    lr: f64,
    l2: f64,
    bias: f64,
    weights: Vec<f64>,
    updates: u64,
}

#[derive(Serialize, Deserialize)]
struct SavedModel {
    dim: usize,
    lr: f64,
    l2: f64,
    bias: f64,
    #[serde(default)]
    updates: u64,
    /// Non-zero weights only.
    weights: Vec<(u32, f64)>,
}

impl OnlineLogReg {
    pub fn new(dim: usize, lr: f64, l2: f64) -> Self {
        let dim = dim.max(2);
        Self {
            dim,
            lr,
            l2,
            bias: 1.0,
            weights: vec![0.0; dim],
            updates: 0,
        }
    }

    pub fn from_config(cfg: &PredictionConfig) -> Self {
        Self::new(cfg.logistic_dim, cfg.logistic_lr, cfg.logistic_l2)
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    fn featurize(&self, features: &FeatureMap) -> Vec<(usize, f64)> {
        let buckets = (self.dim - 1) as u32;
        let mut out = Vec::with_capacity(features.len() + 1);
        out.push((0, self.bias));
        for (name, value) in features {
            match value {
                FeatureValue::Num(v) if v.is_finite() => {
                    let idx = fnv1a32(&format!("n:{name}")) % buckets + 1;
                    out.push((idx as usize, *v));
                }
                FeatureValue::Num(_) => {}
                FeatureValue::Cat(v) => {
                    let idx = fnv1a32(&format!("c:{name}={v}")) % buckets + 1;
                    out.push((idx as usize, 1.0));
                }
            }
        }
        out
    }

    fn dot(&self, x: &[(usize, f64)]) -> f64 {
        x.iter().map(|(i, v)| self.weights[*i] * v).sum()
    }

    pub fn predict(&self, features: &FeatureMap) -> f64 {
        sigmoid(self.dot(&self.featurize(features)))
    }

    pub fn update(&mut self, features: &FeatureMap, y: bool) -> f64 {
        let x = self.featurize(features);
        let p = sigmoid(self.dot(&x));
        let g = p - if y { 1.0 } else { 0.0 };
        for (i, v) in x {
            let grad = g * v + self.l2 * self.weights[i];
            self.weights[i] -= self.lr * grad;
        }
        self.updates += 1;
        p
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let saved = SavedModel {
            dim: self.dim,
            lr: self.lr,
            l2: self.l2,
            bias: self.bias,
            updates: self.updates,
            weights: self
                .weights
                .iter()
                .enumerate()
                .filter(|(_, w)| **w != 0.0)
                .map(|(i, w)| (i as u32, *w))
                .collect(),
        };
        let json = serde_json::to_vec(&saved).context("encode logistic weights")?;
        write_atomic(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read(path).with_context(|| format!("read logistic weights {}", path.display()))?;
        let saved: SavedModel = serde_json::from_slice(&raw)
            .with_context(|| format!("decode logistic weights {}", path.display()))?;
        if saved.dim < 2 {
            return Err(anyhow!("logistic model dim {} too small", saved.dim));
        }
        let mut weights = vec![0.0; saved.dim];
        for (i, w) in saved.weights {
            if let Some(slot) = weights.get_mut(i as usize) {
                *slot = w;
            }
        }
        Ok(Self {
            dim: saved.dim,
            lr: saved.lr,
            l2: saved.l2,
            bias: saved.bias,
            weights,
            updates: saved.updates,
        })
    }
}

fn sigmoid(z: f64) -> f64 {
    if z < -SIGMOID_CLAMP {
        0.0
    } else if z > SIGMOID_CLAMP {
        1.0
    } else {
        1.0 / (1.0 + (-z).exp())
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dom: f64, league: &str) -> FeatureMap {
        let mut f = FeatureMap::new();
        f.insert("dom_6".into(), dom.into());
        f.insert("league".into(), league.into());
        f
    }

    #[test]
    fn untrained_model_predicts_half() {
        let m = OnlineLogReg::new(1 << 10, 0.05, 1e-6);
        assert!((m.predict(&sample(2.0, "x")) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn updates_move_prediction_toward_label() {
        let mut m = OnlineLogReg::new(1 << 10, 0.1, 1e-6);
        let f = sample(1.0, "serie a");
        let before = m.predict(&f);
        for _ in 0..50 {
            m.update(&f, true);
        }
        assert!(m.predict(&f) > before);
        assert_eq!(m.updates(), 50);
    }

    #[test]
    fn save_and_load_keep_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.json");
        let mut m = OnlineLogReg::new(1 << 10, 0.1, 1e-6);
        let f = sample(3.0, "liga");
        m.update(&f, false);
        m.save(&path).unwrap();
        let loaded = OnlineLogReg::load(&path).unwrap();
        assert!((loaded.predict(&f) - m.predict(&f)).abs() < 1e-12);
    }
}
