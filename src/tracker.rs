use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use csv::Writer as CsvWriter;
use serde::{Deserialize, Serialize};

use crate::lifecycle::{Signal, WindowState};
use crate::online_logreg::write_atomic;

pub const AUDIT_HEADER: [&str; 20] = [
    "timestamp",
    "event",
    "signal_id",
    "match_id",
    "market",
    "odds",
    "minute_at_signal",
    "horizon",
    "league",
    "home",
    "away",
    "p_model",
    "p_fair",
    "edge",
    "outcome",
    "profit",
    "greens",
    "reds",
    "accuracy",
    "total_profit",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneTotals {
    pub opened: u64,
    pub greens: u64,
    pub reds: u64,
    pub profit: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    #[serde(default)]
    pub opened: u64,
    pub greens: u64,
    pub reds: u64,
    pub total_profit: f64,
    #[serde(default)]
    pub per_market: BTreeMap<String, LaneTotals>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl TrackerState {
    pub fn settled(&self) -> u64 {
        self.greens + self.reds
    }

    pub fn accuracy(&self) -> f64 {
        match self.settled() {
            0 => 0.0,
            n => self.greens as f64 / n as f64,
        }
    }
}

/// Durable win/loss/PnL counters plus a CSV audit trail. Thread-safe and
/// independent of the engine's in-memory match state.
pub struct OutcomeTracker {
    state: Mutex<TrackerState>,
    state_path: Option<PathBuf>,
    audit_path: Option<PathBuf>,
}

impl OutcomeTracker {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            state_path: None,
            audit_path: None,
        }
    }

    pub fn open(state_path: PathBuf, audit_path: PathBuf) -> Result<Self> {
        let state = if state_path.exists() {
            let raw = fs::read_to_string(&state_path)
                .with_context(|| format!("read tracker state {}", state_path.display()))?;
            serde_json::from_str::<TrackerState>(&raw)
                .with_context(|| format!("decode tracker state {}", state_path.display()))?
        } else {
            TrackerState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            state_path: Some(state_path),
            audit_path: Some(audit_path),
        })
    }

    pub fn summary(&self) -> TrackerState {
        self.state.lock().expect("tracker lock poisoned").clone()
    }

    /// File writes happen under the state lock so snapshots land in order.
    pub fn record_open(&self, signal: &Signal) -> Result<()> {
        let mut state = self.state.lock().expect("tracker lock poisoned");
        state.opened += 1;
        state
            .per_market
            .entry(signal.market.as_str().to_string())
            .or_default()
            .opened += 1;
        state.updated_at = Some(Utc::now().to_rfc3339());
        self.commit("OPEN", signal, &state)
    }

    /// Counts a settled signal. Signals still OPEN are ignored.
    pub fn record_result(&self, signal: &Signal) -> Result<()> {
        let won = match signal.state {
            WindowState::Open => return Ok(()),
            WindowState::Won => true,
            WindowState::Lost => false,
        };
        let profit = signal.pnl.unwrap_or(0.0);
        let mut state = self.state.lock().expect("tracker lock poisoned");
        let lane = state
            .per_market
            .entry(signal.market.as_str().to_string())
            .or_default();
        if won {
            lane.greens += 1;
        } else {
            lane.reds += 1;
        }
        lane.profit += profit;
        if won {
            state.greens += 1;
        } else {
            state.reds += 1;
        }
        state.total_profit += profit;
        state.updated_at = Some(Utc::now().to_rfc3339());
        self.commit(signal.state.as_str(), signal, &state)
    }

    /// The audit row is appended even when the state file write fails.
    fn commit(&self, event: &str, signal: &Signal, state: &TrackerState) -> Result<()> {
        let persisted = self.persist(state);
        self.append_audit(event, signal, state)?;
        persisted
    }

    fn persist(&self, state: &TrackerState) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(state).context("encode tracker state")?;
        write_atomic(path, &json)
    }

    fn append_audit(&self, event: &str, s: &Signal, state: &TrackerState) -> Result<()> {
        let Some(path) = &self.audit_path else {
            return Ok(());
        };
        let needs_header = file_is_empty(path);
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit csv {}", path.display()))?;
        let mut wtr = CsvWriter::from_writer(file);
        if needs_header {
            wtr.write_record(AUDIT_HEADER).context("write audit header")?;
        }
        let opt = |v: Option<f64>| v.map(|x| format!("{x:.4}")).unwrap_or_default();
        let row = [
            Utc::now().to_rfc3339(),
            event.to_string(),
            s.id.to_string(),
            s.match_id.clone(),
            s.market.as_str().to_string(),
            opt(s.price),
            s.created_minute.to_string(),
            s.expiry_minute.to_string(),
            s.league.clone(),
            s.home.clone(),
            s.away.clone(),
            format!("{:.4}", s.probability),
            opt(s.fair),
            opt(s.edge),
            if s.state == WindowState::Open {
                String::new()
            } else {
                s.state.as_str().to_string()
            },
            opt(s.pnl),
            state.greens.to_string(),
            state.reds.to_string(),
            format!("{:.4}", state.accuracy()),
            format!("{:.2}", state.total_profit),
        ];
        wtr.write_record(&row).context("write audit row")?;
        wtr.flush().context("flush audit csv")?;
        Ok(())
    }
}

fn file_is_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}
