use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::lifecycle::{Signal, SignalBook};
use crate::store::Store;
use crate::tracker::{OutcomeTracker, TrackerState};

pub const DEFAULT_RECENT: usize = 25;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerTotals {
    pub open: usize,
    pub won: usize,
    pub lost: usize,
    pub accuracy: f64,
    pub pnl: f64,
}

/// Read-only view handed to whatever renders the live board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub generated_at: String,
    pub open: Vec<Signal>,
    pub recent: Vec<Signal>,
    pub ledger: LedgerTotals,
    pub tracker: TrackerState,
}

pub fn snapshot(
    store: &Store,
    book: &SignalBook,
    tracker: &OutcomeTracker,
    recent: usize,
) -> Result<Snapshot> {
    // The in-memory book only knows this process's signals; after a restart
    // the store still has the rest.
    let mut open = book.snapshot();
    if open.is_empty() {
        open = store.open_signals(None)?;
    }
    let summary = store.signal_summary()?;
    let settled = summary.won + summary.lost;
    let accuracy = if settled == 0 {
        0.0
    } else {
        summary.won as f64 / settled as f64
    };
    Ok(Snapshot {
        generated_at: Utc::now().to_rfc3339(),
        open,
        recent: store.recent_settled_signals(recent)?,
        ledger: LedgerTotals {
            open: summary.open,
            won: summary.won,
            lost: summary.lost,
            accuracy,
            pnl: summary.pnl,
        },
        tracker: tracker.summary(),
    })
}
