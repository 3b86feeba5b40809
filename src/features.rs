//! Feature engine: leakage-safe rolling and expanding statistics.
//!
//! Every feature for a target date D is a pure function of game records
//! dated strictly before D (plus same-day context such as home/away), so
//! recomputing over the same history is deterministic and training-time and
//! serving-time vectors agree by construction.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use rayon::prelude::*;

use crate::gamelog::{GameRecord, HomeAway};

pub const ROLLING_WINDOWS: [usize; 3] = [5, 10, 20];
/// A player needs at least this many strictly prior games before any
/// feature vector is emitted for them.
pub const MIN_HISTORY_GAMES: usize = 10;
/// Rolling std is only meaningful with a few samples; below this it is 0.0.
pub const MIN_STD_SAMPLES: usize = 3;
/// League-average points fallback when an opponent has no prior games.
pub const LEAGUE_AVG_POINTS_ALLOWED: f64 = 110.0;
/// Pace is a fixed placeholder until a richer pace model is supplied.
pub const PACE_PLACEHOLDER: f64 = 100.0;
pub const DEFAULT_REST_DAYS: f64 = 3.0;
pub const MAX_REST_DAYS: f64 = 10.0;

/// Ordered numeric feature names. [`compute_numeric_features`] pushes values
/// in exactly this order; `schema_len_matches` guards the pairing.
pub fn numeric_feature_names() -> Vec<String> {
    let mut names = Vec::new();
    for w in ROLLING_WINDOWS {
        names.push(format!("avg_points_last_{w}"));
        names.push(format!("std_points_last_{w}"));
        names.push(format!("avg_minutes_last_{w}"));
        names.push(format!("avg_fga_last_{w}"));
        names.push(format!("avg_fg_pct_last_{w}"));
        names.push(format!("avg_3pa_last_{w}"));
        names.push(format!("avg_3p_pct_last_{w}"));
        names.push(format!("avg_fta_last_{w}"));
        names.push(format!("avg_ft_pct_last_{w}"));
    }
    names.extend(
        [
            "days_rest",
            "opp_pts_allowed_avg",
            "opp_pace",
            "team_pace",
            "season_avg_points",
            "season_avg_minutes",
            "season_avg_fga",
        ]
        .map(str::to_string),
    );
    names
}

/// Opponent-defense lookup. Implementations must only read strictly prior
/// records; they never mutate shared state.
pub trait DefenseLookup {
    /// Mean points across all stored game rows involving `team` (home or
    /// away) dated strictly before `before`. None when no such games exist.
    fn points_allowed_before(&self, team: &str, before: NaiveDate) -> Result<Option<f64>>;
}

/// In-memory defense index over a snapshot of game rows, for the batch
/// training path. Per-team rows are kept date-sorted so a prefix lookup is a
/// partition point away.
pub struct TeamGameIndex {
    by_team: HashMap<String, Vec<(NaiveDate, f64)>>,
}

impl TeamGameIndex {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a GameRecord>) -> Self {
        let mut by_team: HashMap<String, Vec<(NaiveDate, f64)>> = HashMap::new();
        for rec in records {
            for team in [&rec.home_team, &rec.away_team] {
                by_team
                    .entry(team.clone())
                    .or_default()
                    .push((rec.game_date, rec.points));
            }
        }
        for rows in by_team.values_mut() {
            rows.sort_by_key(|(date, _)| *date);
        }
        Self { by_team }
    }
}

impl DefenseLookup for TeamGameIndex {
    fn points_allowed_before(&self, team: &str, before: NaiveDate) -> Result<Option<f64>> {
        let Some(rows) = self.by_team.get(team) else {
            return Ok(None);
        };
        let end = rows.partition_point(|(date, _)| *date < before);
        if end == 0 {
            return Ok(None);
        }
        let sum: f64 = rows[..end].iter().map(|(_, pts)| pts).sum();
        Ok(Some(sum / end as f64))
    }
}

/// One row of model input for a (player, target date).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub player_id: i64,
    pub game_date: NaiveDate,
    /// Aligned with [`numeric_feature_names`].
    pub values: Vec<f64>,
    pub home_away: HomeAway,
    /// Ground truth for in-history targets; None for upcoming games.
    pub realized_points: Option<f64>,
}

pub struct FeatureEngine<'a, D: DefenseLookup> {
    defense: &'a D,
}

impl<'a, D: DefenseLookup> FeatureEngine<'a, D> {
    pub fn new(defense: &'a D) -> Self {
        Self { defense }
    }

    /// One vector per eligible in-history game: the target at index i uses
    /// games [0, i) only, and i must be at least [`MIN_HISTORY_GAMES`].
    /// Players with too little history simply produce an empty vec.
    pub fn vectors_for_history(&self, history: &[GameRecord]) -> Result<Vec<FeatureVector>> {
        let mut out = Vec::new();
        for i in MIN_HISTORY_GAMES..history.len() {
            let target = &history[i];
            let prior = &history[..i];
            let values = self.compute_numeric_features(
                prior,
                target.game_date,
                Some(target.opponent()),
            )?;
            out.push(FeatureVector {
                player_id: target.player_id,
                game_date: target.game_date,
                values,
                home_away: target.home_away,
                realized_points: Some(target.points),
            });
        }
        Ok(out)
    }

    /// Vector for an arbitrary target date (typically an upcoming game).
    /// Only games dated strictly before `date` contribute; None when the
    /// player has insufficient prior history.
    pub fn vector_for_date(
        &self,
        history: &[GameRecord],
        player_id: i64,
        date: NaiveDate,
        home_away: HomeAway,
        opponent: Option<&str>,
    ) -> Result<Option<FeatureVector>> {
        let end = history.partition_point(|g| g.game_date < date);
        let prior = &history[..end];
        if prior.len() < MIN_HISTORY_GAMES {
            return Ok(None);
        }
        let values = self.compute_numeric_features(prior, date, opponent)?;
        Ok(Some(FeatureVector {
            player_id,
            game_date: date,
            values,
            home_away,
            realized_points: None,
        }))
    }

    fn compute_numeric_features(
        &self,
        prior: &[GameRecord],
        date: NaiveDate,
        opponent: Option<&str>,
    ) -> Result<Vec<f64>> {
        let mut values = Vec::with_capacity(numeric_feature_names().len());

        for w in ROLLING_WINDOWS {
            let tail = &prior[prior.len().saturating_sub(w)..];
            values.push(mean(tail, |g| g.points));
            values.push(if tail.len() >= MIN_STD_SAMPLES {
                sample_std(tail, |g| g.points)
            } else {
                0.0
            });
            values.push(mean(tail, GameRecord::minutes_played));
            values.push(mean(tail, |g| g.fg_attempted));
            values.push(mean(tail, |g| g.fg_pct));
            values.push(mean(tail, |g| g.fg3_attempted));
            values.push(mean(tail, |g| g.fg3_pct));
            values.push(mean(tail, |g| g.ft_attempted));
            values.push(mean(tail, |g| g.ft_pct));
        }

        values.push(rest_days(prior, date));

        let opp_pts = match opponent {
            Some(team) => self
                .defense
                .points_allowed_before(team, date)?
                .unwrap_or(LEAGUE_AVG_POINTS_ALLOWED),
            None => LEAGUE_AVG_POINTS_ALLOWED,
        };
        values.push(opp_pts);
        values.push(PACE_PLACEHOLDER);
        values.push(PACE_PLACEHOLDER);

        values.push(mean(prior, |g| g.points));
        values.push(mean(prior, GameRecord::minutes_played));
        values.push(mean(prior, |g| g.fg_attempted));

        // Missing numeric inputs default to 0.0 after computation.
        for v in &mut values {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        debug_assert!(schema_len_matches(&values));
        Ok(values)
    }
}

/// Whole days since the player's last prior game, defaulting to 3 with no
/// prior game and clipped at 10 for outlier containment.
pub fn rest_days(prior: &[GameRecord], date: NaiveDate) -> f64 {
    match prior.last() {
        Some(last) => {
            let days = (date - last.game_date).num_days() as f64;
            days.clamp(0.0, MAX_REST_DAYS)
        }
        None => DEFAULT_REST_DAYS,
    }
}

/// Feature fan-out across players. Each player's computation is independent
/// and only reads the shared defense index, so the map is embarrassingly
/// parallel; results are concatenated in input order.
pub fn vectors_for_players<D>(
    histories: &[Vec<GameRecord>],
    defense: &D,
) -> Result<Vec<FeatureVector>>
where
    D: DefenseLookup + Sync,
{
    let per_player: Vec<Vec<FeatureVector>> = histories
        .par_iter()
        .map(|history| FeatureEngine::new(defense).vectors_for_history(history))
        .collect::<Result<_>>()?;
    Ok(per_player.into_iter().flatten().collect())
}

fn mean(records: &[GameRecord], f: impl Fn(&GameRecord) -> f64) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(&f).sum::<f64>() / records.len() as f64
}

fn sample_std(records: &[GameRecord], f: impl Fn(&GameRecord) -> f64) -> f64 {
    let n = records.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(records, &f);
    let ss: f64 = records.iter().map(|g| (f(g) - m) * (f(g) - m)).sum();
    (ss / (n - 1) as f64).sqrt()
}

fn schema_len_matches(values: &[f64]) -> bool {
    values.len() == numeric_feature_names().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDefense;
    impl DefenseLookup for NoDefense {
        fn points_allowed_before(&self, _: &str, _: NaiveDate) -> Result<Option<f64>> {
            Ok(None)
        }
    }

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Days::new(n as u64)
    }

    fn game(player_id: i64, n: u32, points: f64) -> GameRecord {
        GameRecord {
            player_id,
            game_id: format!("g{n}"),
            game_date: day(n),
            home_team: "AAA".to_string(),
            away_team: "BBB".to_string(),
            home_away: if n % 2 == 0 { HomeAway::Home } else { HomeAway::Away },
            minutes: "32:00".to_string(),
            points,
            rebounds: 5.0,
            assists: 4.0,
            steals: 1.0,
            blocks: 0.5,
            turnovers: 2.0,
            fg_made: points / 2.5,
            fg_attempted: 18.0,
            fg_pct: 0.47,
            fg3_made: 2.0,
            fg3_attempted: 6.0,
            fg3_pct: 0.35,
            ft_made: 4.0,
            ft_attempted: 5.0,
            ft_pct: 0.8,
            plus_minus: 3.0,
            win_loss: "W".to_string(),
        }
    }

    fn history(n: u32) -> Vec<GameRecord> {
        (0..n).map(|i| game(1, i * 2, 20.0 + i as f64)).collect()
    }

    fn feature_index(name: &str) -> usize {
        numeric_feature_names()
            .iter()
            .position(|c| c == name)
            .unwrap()
    }

    #[test]
    fn eligibility_threshold_is_ten_prior_games() {
        let engine = FeatureEngine::new(&NoDefense);
        // 10 games total: no in-history target has 10 prior games.
        assert!(engine.vectors_for_history(&history(10)).unwrap().is_empty());
        // 11 games: exactly one target (the 11th) has 10 prior games.
        let vectors = engine.vectors_for_history(&history(11)).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].game_date, day(20));

        // A date-based target with only 9 prior games yields nothing.
        let nine = history(9);
        let out = engine
            .vector_for_date(&nine, 1, day(100), HomeAway::Away, None)
            .unwrap();
        assert!(out.is_none());
        // With 10 prior games it yields exactly one vector.
        let ten = history(10);
        let out = engine
            .vector_for_date(&ten, 1, day(100), HomeAway::Away, None)
            .unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn rolling_mean_uses_last_five_prior_games() {
        // 12 games with known points; the vector computed after game 12
        // averages games 8..=12 for the 5-game window.
        let points: Vec<f64> = (0..12).map(|i| 10.0 + 2.0 * i as f64).collect();
        let hist: Vec<GameRecord> = points
            .iter()
            .enumerate()
            .map(|(i, &p)| game(1, i as u32, p))
            .collect();
        let engine = FeatureEngine::new(&NoDefense);
        let v = engine
            .vector_for_date(&hist, 1, day(50), HomeAway::Home, None)
            .unwrap()
            .unwrap();
        let expected = points[7..12].iter().sum::<f64>() / 5.0;
        let got = v.values[feature_index("avg_points_last_5")];
        assert!((got - expected).abs() < 1e-9);

        let season = points.iter().sum::<f64>() / 12.0;
        let got = v.values[feature_index("season_avg_points")];
        assert!((got - season).abs() < 1e-9);
    }

    #[test]
    fn features_never_use_games_on_or_after_target_date() {
        let mut hist = history(14);
        let engine = FeatureEngine::new(&NoDefense);
        let target_date = hist[12].game_date;
        let before = engine
            .vector_for_date(&hist, 1, target_date, HomeAway::Home, None)
            .unwrap()
            .unwrap();

        // Perturb the target game and everything after it.
        for g in hist.iter_mut().filter(|g| g.game_date >= target_date) {
            g.points = 99.0;
            g.minutes = "48:00".to_string();
        }
        let after = engine
            .vector_for_date(&hist, 1, target_date, HomeAway::Home, None)
            .unwrap()
            .unwrap();
        assert_eq!(before.values, after.values);
    }

    #[test]
    fn rest_days_default_and_clip() {
        assert_eq!(rest_days(&[], day(5)), 3.0);
        let hist = vec![game(1, 0, 20.0)];
        // 15 real days clipped to 10.
        assert_eq!(rest_days(&hist, day(15)), 10.0);
        assert_eq!(rest_days(&hist, day(2)), 2.0);
    }

    #[test]
    fn opponent_defense_defaults_to_league_average() {
        let hist = history(11);
        let engine = FeatureEngine::new(&NoDefense);
        let v = engine
            .vector_for_date(&hist, 1, day(99), HomeAway::Away, Some("ZZZ"))
            .unwrap()
            .unwrap();
        let got = v.values[feature_index("opp_pts_allowed_avg")];
        assert_eq!(got, LEAGUE_AVG_POINTS_ALLOWED);
    }

    #[test]
    fn team_index_pools_strictly_prior_games() {
        let rows = vec![game(1, 0, 10.0), game(2, 2, 20.0), game(3, 4, 30.0)];
        let index = TeamGameIndex::from_records(&rows);
        // Games on day 0 and day 2 are before day 3.
        let avg = index.points_allowed_before("AAA", day(3)).unwrap().unwrap();
        assert!((avg - 15.0).abs() < 1e-9);
        assert!(index.points_allowed_before("AAA", day(0)).unwrap().is_none());
        assert!(index.points_allowed_before("NOPE", day(9)).unwrap().is_none());
    }

    #[test]
    fn constant_history_has_zero_std() {
        let hist: Vec<GameRecord> = (0..11).map(|i| game(1, i, 25.0)).collect();
        let engine = FeatureEngine::new(&NoDefense);
        let v = engine
            .vector_for_date(&hist, 1, day(40), HomeAway::Home, None)
            .unwrap()
            .unwrap();
        let got = v.values[feature_index("std_points_last_5")];
        assert_eq!(got, 0.0);
    }

    #[test]
    fn parallel_fanout_matches_serial_order() {
        let histories = vec![history(12), history(13)];
        let index = TeamGameIndex::from_records(histories.iter().flatten());
        let parallel = vectors_for_players(&histories, &index).unwrap();
        let engine = FeatureEngine::new(&index);
        let mut serial = Vec::new();
        for h in &histories {
            serial.extend(engine.vectors_for_history(h).unwrap());
        }
        assert_eq!(parallel, serial);
    }
}
