use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HomeAway {
    Home,
    Away,
}

impl HomeAway {
    pub fn as_str(self) -> &'static str {
        match self {
            HomeAway::Home => "HOME",
            HomeAway::Away => "AWAY",
        }
    }

    /// Unrecognized values fall back to Away, the documented default for
    /// missing game context.
    pub fn parse(raw: &str) -> HomeAway {
        if raw.trim().eq_ignore_ascii_case("home") {
            HomeAway::Home
        } else {
            HomeAway::Away
        }
    }
}

/// One player's box score for one game. Immutable once ingested; histories
/// are always handled in ascending (player, game_date) order.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub player_id: i64,
    pub game_id: String,
    pub game_date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub home_away: HomeAway,
    /// Raw "MM:SS" string as ingested; see [`GameRecord::minutes_played`].
    pub minutes: String,
    pub points: f64,
    pub rebounds: f64,
    pub assists: f64,
    pub steals: f64,
    pub blocks: f64,
    pub turnovers: f64,
    pub fg_made: f64,
    pub fg_attempted: f64,
    pub fg_pct: f64,
    pub fg3_made: f64,
    pub fg3_attempted: f64,
    pub fg3_pct: f64,
    pub ft_made: f64,
    pub ft_attempted: f64,
    pub ft_pct: f64,
    pub plus_minus: f64,
    pub win_loss: String,
}

impl GameRecord {
    pub fn opponent(&self) -> &str {
        match self.home_away {
            HomeAway::Home => &self.away_team,
            HomeAway::Away => &self.home_team,
        }
    }

    pub fn minutes_played(&self) -> f64 {
        parse_minutes(&self.minutes)
    }
}

/// Convert an "MM:SS" minutes string to fractional minutes. Plain numeric
/// strings are accepted as-is; empty or unparseable input yields 0.0.
pub fn parse_minutes(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some((mins, secs)) = trimmed.split_once(':') {
        let m = mins.trim().parse::<f64>().unwrap_or(0.0);
        let s = secs.trim().parse::<f64>().unwrap_or(0.0);
        return m + s / 60.0;
    }
    trimmed.parse::<f64>().unwrap_or(0.0)
}

/// A bookmaker points line observation. Multiple raw observations may exist
/// for the same (player, date); [`dedup_latest_lines`] selects one.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketLine {
    pub player_id: i64,
    pub game_date: NaiveDate,
    pub line: f64,
    pub fetched_at: DateTime<Utc>,
    pub sportsbook: String,
}

/// Keep the most recently fetched observation per (player, date).
pub fn dedup_latest_lines(lines: Vec<MarketLine>) -> Vec<MarketLine> {
    let mut latest: HashMap<(i64, NaiveDate), MarketLine> = HashMap::new();
    for line in lines {
        let key = (line.player_id, line.game_date);
        match latest.get(&key) {
            Some(existing) if existing.fetched_at >= line.fetched_at => {}
            _ => {
                latest.insert(key, line);
            }
        }
    }
    let mut out: Vec<MarketLine> = latest.into_values().collect();
    out.sort_by(|a, b| {
        a.player_id
            .cmp(&b.player_id)
            .then(a.game_date.cmp(&b.game_date))
    });
    out
}

/// A served probability for one (player, date). Upserted; recomputation
/// overwrites the prior row for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub player_id: i64,
    pub game_date: NaiveDate,
    pub line: f64,
    pub prob_over: f64,
    pub confidence: f64,
    pub artifact_version: String,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_minutes_handles_formats() {
        assert!((parse_minutes("34:30") - 34.5).abs() < 1e-9);
        assert!((parse_minutes("12:00") - 12.0).abs() < 1e-9);
        assert!((parse_minutes("28.5") - 28.5).abs() < 1e-9);
        assert_eq!(parse_minutes(""), 0.0);
        assert_eq!(parse_minutes("DNP"), 0.0);
        assert!((parse_minutes("bad:30") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn home_away_parse_defaults_to_away() {
        assert_eq!(HomeAway::parse("HOME"), HomeAway::Home);
        assert_eq!(HomeAway::parse("home"), HomeAway::Home);
        assert_eq!(HomeAway::parse("AWAY"), HomeAway::Away);
        assert_eq!(HomeAway::parse(""), HomeAway::Away);
        assert_eq!(HomeAway::parse("garbage"), HomeAway::Away);
    }

    #[test]
    fn dedup_keeps_most_recent_fetch() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let make = |hour, line| MarketLine {
            player_id: 7,
            game_date: date,
            line,
            fetched_at: Utc.with_ymd_and_hms(2025, 1, 10, hour, 0, 0).unwrap(),
            sportsbook: "book".to_string(),
        };
        let out = dedup_latest_lines(vec![make(8, 25.5), make(12, 26.5), make(10, 24.5)]);
        assert_eq!(out.len(), 1);
        assert!((out[0].line - 26.5).abs() < 1e-9);
    }
}
