use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::IngestEvent;
use crate::tick::{MatchContext, Tick};

/// One NDJSON line of the telemetry feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedEvent {
    Tick(Tick),
    Context(MatchContext),
}

impl From<FeedEvent> for IngestEvent {
    fn from(event: FeedEvent) -> Self {
        match event {
            FeedEvent::Tick(t) => IngestEvent::Tick(t),
            FeedEvent::Context(c) => IngestEvent::Context(c),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: usize,
    pub events: usize,
    pub skipped: usize,
}

/// Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<FeedEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str::<FeedEvent>(trimmed).context("decode feed line")?;
    if let FeedEvent::Tick(t) = &event
        && t.match_id.trim().is_empty()
    {
        anyhow::bail!("tick without match_id");
    }
    Ok(Some(event))
}

/// Streams events to `sink`. Undecodable lines are logged and skipped; an
/// error returned by `sink` stops the read.
pub fn read_feed<R: BufRead>(
    reader: R,
    mut sink: impl FnMut(FeedEvent) -> Result<()>,
) -> Result<FeedStats> {
    let mut stats = FeedStats::default();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read feed line {}", idx + 1))?;
        stats.lines += 1;
        match parse_line(&line) {
            Ok(Some(event)) => {
                sink(event)?;
                stats.events += 1;
            }
            Ok(None) => {}
            Err(err) => {
                stats.skipped += 1;
                warn!(line = idx + 1, error = %format!("{err:#}"), "skipping feed line");
            }
        }
    }
    Ok(stats)
}

pub fn read_feed_file(path: &Path, sink: impl FnMut(FeedEvent) -> Result<()>) -> Result<FeedStats> {
    let file = File::open(path).with_context(|| format!("open feed {}", path.display()))?;
    read_feed(BufReader::new(file), sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_lines_are_skipped() {
        let raw = r#"{"type":"context","match_id":"m1","league":"Serie A","home":"Inter","away":"Milan"}
not json at all
{"type":"tick","match_id":"m1","minute":3,"home":{"goals":0,"shots_on_target":1},"away":{"goals":0}}

{"type":"weather","match_id":"m1"}
"#;
        let mut seen = Vec::new();
        let stats = read_feed(raw.as_bytes(), |e| {
            seen.push(e);
            Ok(())
        })
        .unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.skipped, 2);
        assert!(matches!(seen[1], FeedEvent::Tick(ref t) if t.home.shots_on_target == Some(1)));
    }
}
