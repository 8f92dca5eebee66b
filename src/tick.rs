use serde::{Deserialize, Deserializer, Serialize};

pub const HALF_TIME_MINUTE: u16 = 45;
pub const FULL_TIME_MINUTE: u16 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
    Any,
}

impl Side {
    pub const ALL: [Side; 3] = [Side::Home, Side::Away, Side::Any];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
            Side::Any => "any",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "home" => Some(Side::Home),
            "away" => Some(Side::Away),
            "any" => Some(Side::Any),
            _ => None,
        }
    }

    pub fn covers_home(self) -> bool {
        matches!(self, Side::Home | Side::Any)
    }

    pub fn covers_away(self) -> bool {
        matches!(self, Side::Away | Side::Any)
    }
}

/// Market lane a Signal is emitted on: "over 0.5 goals" until half-time or
/// until full-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Market {
    #[serde(rename = "HT")]
    FirstHalf,
    #[serde(rename = "FT")]
    FullTime,
}

impl Market {
    pub const ALL: [Market; 2] = [Market::FirstHalf, Market::FullTime];

    pub fn as_str(self) -> &'static str {
        match self {
            Market::FirstHalf => "HT",
            Market::FullTime => "FT",
        }
    }

    pub fn parse(raw: &str) -> Option<Market> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HT" => Some(Market::FirstHalf),
            "FT" => Some(Market::FullTime),
            _ => None,
        }
    }

    pub fn expiry_minute(self) -> u16 {
        match self {
            Market::FirstHalf => HALF_TIME_MINUTE,
            Market::FullTime => FULL_TIME_MINUTE,
        }
    }

    /// Minutes left on this lane at `minute`; zero once the lane has expired.
    pub fn remaining(self, minute: u16) -> u16 {
        self.expiry_minute().saturating_sub(minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    NotStarted,
    Live,
    HalfTime,
    Finished,
}

impl MatchPhase {
    pub fn from_status(status: &str) -> MatchPhase {
        let s = status.trim().to_ascii_lowercase();
        if s.is_empty() {
            return MatchPhase::Live;
        }
        let finished = ["ft", "ended", "finished", "full time", "full-time", "encerrado", "aet"];
        if finished.iter().any(|k| s == *k || s.starts_with(&format!("{k} "))) {
            return MatchPhase::Finished;
        }
        if s.contains("finished") || s.contains("encerrado") {
            return MatchPhase::Finished;
        }
        if s == "ht" || s.contains("half time") || s.contains("half-time") || s.contains("intervalo")
        {
            return MatchPhase::HalfTime;
        }
        if s == "ns" || s.contains("not started") || s.contains("scheduled") {
            return MatchPhase::NotStarted;
        }
        MatchPhase::Live
    }
}

/// Cumulative counters for one side. Fields a feed does not report stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    #[serde(default)]
    pub goals: u32,
    #[serde(default)]
    pub shots_total: Option<u32>,
    #[serde(default)]
    pub shots_on_target: Option<u32>,
    #[serde(default)]
    pub shots_off_target: Option<u32>,
    #[serde(default)]
    pub corners: Option<u32>,
    #[serde(default)]
    pub dangerous_attacks: Option<u32>,
    #[serde(default)]
    pub xg: Option<f64>,
}

/// Two-way decimal prices for "over/under 0.5 goals" per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketQuotes {
    #[serde(default)]
    pub over05_ht: Option<f64>,
    #[serde(default)]
    pub under05_ht: Option<f64>,
    #[serde(default)]
    pub over05_ft: Option<f64>,
    #[serde(default)]
    pub under05_ft: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoWayPrice {
    pub over: f64,
    pub under: f64,
}

impl MarketQuotes {
    pub fn for_market(&self, market: Market) -> Option<TwoWayPrice> {
        let (over, under) = match market {
            Market::FirstHalf => (self.over05_ht?, self.under05_ht?),
            Market::FullTime => (self.over05_ft?, self.under05_ft?),
        };
        if over > 1.0 && under > 1.0 {
            Some(TwoWayPrice { over, under })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub match_id: String,
    /// Unix milliseconds at observation.
    #[serde(default)]
    pub ts: i64,
    #[serde(deserialize_with = "deserialize_minute")]
    pub minute: u16,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub home: SideStats,
    #[serde(default)]
    pub away: SideStats,
    #[serde(default)]
    pub quotes: Option<MarketQuotes>,
}

impl Tick {
    pub fn total_goals(&self) -> u32 {
        self.home.goals + self.away.goals
    }

    pub fn goal_diff(&self) -> i32 {
        self.home.goals as i32 - self.away.goals as i32
    }

    pub fn phase(&self) -> MatchPhase {
        MatchPhase::from_status(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchContext {
    pub match_id: String,
    #[serde(default)]
    pub league: String,
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub away: String,
}

impl MatchContext {
    pub fn league_key(&self) -> String {
        normalize_league_name(&self.league)
    }

    pub fn home_key(&self) -> String {
        normalize_team_name(&self.home)
    }

    pub fn away_key(&self) -> String {
        normalize_team_name(&self.away)
    }
}

/// Accepts `37`, `"37"`, `"45+2"` or `"90'"`; stoppage time folds into the
/// base minute.
fn deserialize_minute<'de, D: Deserializer<'de>>(de: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(v) if v.is_finite() && v >= 0.0 => Ok(v.min(f64::from(u16::MAX)) as u16),
        Raw::Num(v) => Err(serde::de::Error::custom(format!("invalid minute {v}"))),
        Raw::Text(s) => parse_minute(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid minute {s:?}"))),
    }
}

pub fn parse_minute(raw: &str) -> Option<u16> {
    let head = raw.trim().split('+').next()?;
    let digits: String = head.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub const UNKNOWN_KEY: &str = "unknown";

pub fn normalize_team_name(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    if collapsed.is_empty() {
        UNKNOWN_KEY.to_string()
    } else {
        collapsed.to_lowercase()
    }
}

/// League labels often carry a trailing round or stage suffix after a
/// separator ("Serie A - Round 12"); only the part before it is kept.
pub fn normalize_league_name(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    let head = collapsed
        .split([':', '|', '–', '—'])
        .next()
        .unwrap_or_default();
    let head = match head.find(" - ") {
        Some(idx) => &head[..idx],
        None => head,
    };
    let head = head.trim_end_matches(|c: char| c == '-' || c == '_' || c.is_whitespace());
    if head.is_empty() {
        UNKNOWN_KEY.to_string()
    } else {
        head.to_lowercase()
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_phases() {
        assert_eq!(MatchPhase::from_status("FT"), MatchPhase::Finished);
        assert_eq!(MatchPhase::from_status("Encerrado"), MatchPhase::Finished);
        assert_eq!(MatchPhase::from_status("Intervalo"), MatchPhase::HalfTime);
        assert_eq!(MatchPhase::from_status("HT"), MatchPhase::HalfTime);
        assert_eq!(MatchPhase::from_status("2nd half"), MatchPhase::Live);
        assert_eq!(MatchPhase::from_status(""), MatchPhase::Live);
    }

    #[test]
    fn league_names_drop_stage_suffix() {
        assert_eq!(normalize_league_name("Serie A - Round 12"), "serie a");
        assert_eq!(normalize_league_name("  Premier   League "), "premier league");
        assert_eq!(normalize_league_name("Copa: Group B"), "copa");
        assert_eq!(normalize_league_name(""), UNKNOWN_KEY);
    }

    #[test]
    fn minute_labels_fold_stoppage_time() {
        assert_eq!(parse_minute("45+2"), Some(45));
        assert_eq!(parse_minute("90'"), Some(90));
        assert_eq!(parse_minute(" 12 "), Some(12));
        assert_eq!(parse_minute("HT"), None);
        let t: Tick = serde_json::from_str(r#"{"match_id":"m","minute":"45+3"}"#).unwrap();
        assert_eq!(t.minute, 45);
    }

    #[test]
    fn quotes_require_both_prices() {
        let q = MarketQuotes {
            over05_ht: Some(1.9),
            under05_ht: None,
            over05_ft: Some(1.3),
            under05_ft: Some(3.4),
        };
        assert!(q.for_market(Market::FirstHalf).is_none());
        assert!(q.for_market(Market::FullTime).is_some());
    }
}
