use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::lifecycle::{Signal, WindowState};
use crate::store::Store;
use crate::tick::Market;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub signals: usize,
    pub settled: usize,
    pub lanes: usize,
}

/// Writes the signal ledger to an `.xlsx` workbook: one row per signal plus a
/// per-lane summary sheet.
pub fn export_signals(store: &Store, path: &Path) -> Result<ExportReport> {
    let signals = store.all_signals()?;
    let mut ledger_rows = vec![
        [
            "ID", "Match", "League", "Home", "Away", "Market", "Created", "Expiry", "State",
            "Settled", "Probability", "P Global", "P League", "P Team", "Baseline", "Source",
            "Fair", "Edge", "Price", "PnL",
        ]
        .map(String::from)
        .to_vec(),
    ];
    for s in &signals {
        ledger_rows.push(signal_row(s));
    }

    let mut summary_rows = vec![
        ["Market", "Signals", "Won", "Lost", "Open", "Accuracy", "PnL"]
            .map(String::from)
            .to_vec(),
    ];
    for market in Market::ALL {
        let lane: Vec<&Signal> = signals.iter().filter(|s| s.market == market).collect();
        let won = lane.iter().filter(|s| s.state == WindowState::Won).count();
        let lost = lane.iter().filter(|s| s.state == WindowState::Lost).count();
        let pnl: f64 = lane.iter().filter_map(|s| s.pnl).sum();
        let accuracy = if won + lost == 0 {
            String::new()
        } else {
            format!("{:.3}", won as f64 / (won + lost) as f64)
        };
        summary_rows.push(vec![
            market.as_str().to_string(),
            lane.len().to_string(),
            won.to_string(),
            lost.to_string(),
            (lane.len() - won - lost).to_string(),
            accuracy,
            format!("{pnl:.2}"),
        ]);
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create export dir {}", parent.display()))?;
    }
    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Signals")?;
        write_rows(sheet, &ledger_rows)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Summary")?;
        write_rows(sheet, &summary_rows)?;
    }
    workbook
        .save(path)
        .with_context(|| format!("write workbook {}", path.display()))?;

    Ok(ExportReport {
        signals: signals.len(),
        settled: signals.iter().filter(|s| s.state.is_terminal()).count(),
        lanes: Market::ALL.len(),
    })
}

fn signal_row(s: &Signal) -> Vec<String> {
    vec![
        s.id.to_string(),
        s.match_id.clone(),
        s.league.clone(),
        s.home.clone(),
        s.away.clone(),
        s.market.as_str().to_string(),
        s.created_minute.to_string(),
        s.expiry_minute.to_string(),
        s.state.as_str().to_string(),
        opt_to_string(s.settled_minute),
        format!("{:.4}", s.probability),
        opt_fixed(s.p_global),
        opt_fixed(s.p_league),
        opt_fixed(s.p_team),
        opt_fixed(s.baseline),
        s.source.clone(),
        opt_fixed(s.fair),
        opt_fixed(s.edge),
        opt_to_string(s.price),
        opt_to_string(s.pnl),
    ]
}

fn opt_to_string<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_fixed(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_default()
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}
