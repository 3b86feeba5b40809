//! SQLite persistence for game logs, market lines, and served predictions.
//!
//! All queries are parameterized; identifiers never come from user input.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::features::DefenseLookup;
use crate::gamelog::{GameRecord, HomeAway, MarketLine, Prediction};

/// Read surface the training and prediction pipelines depend on. Kept as a
/// trait so tests can substitute an in-memory implementation.
pub trait StatRepository {
    /// Full game history for one player, ascending by date.
    fn get_game_history(&self, player_id: i64) -> Result<Vec<GameRecord>>;
    /// Every stored game row involving `team` (home or away) strictly
    /// before `before`, ascending by date.
    fn get_opponent_history(&self, team: &str, before: NaiveDate) -> Result<Vec<GameRecord>>;
    /// Most recently fetched line for a (player, date), if any.
    fn get_market_line(&self, player_id: i64, date: NaiveDate) -> Result<Option<MarketLine>>;
    fn player_ids(&self) -> Result<Vec<i64>>;
    fn players_with_lines_on(&self, date: NaiveDate) -> Result<Vec<i64>>;
}

/// Write surface for served predictions, separate from the read contract so
/// the pipeline stays read-only.
pub trait PredictionSink {
    fn upsert_prediction(&self, pred: &Prediction) -> Result<()>;
}

pub struct SqliteStatRepository {
    conn: Connection,
}

impl SqliteStatRepository {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db at {}", path.display()))?;
        let repo = Self { conn };
        repo.init_schema()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        let repo = Self { conn };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS players (
                    player_id   INTEGER PRIMARY KEY,
                    player_name TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS player_games (
                    player_id    INTEGER NOT NULL,
                    game_id      TEXT NOT NULL,
                    game_date    TEXT NOT NULL,
                    home_team    TEXT NOT NULL,
                    away_team    TEXT NOT NULL,
                    home_away    TEXT NOT NULL,
                    minutes      TEXT NOT NULL,
                    points       REAL NOT NULL,
                    rebounds     REAL NOT NULL,
                    assists      REAL NOT NULL,
                    steals       REAL NOT NULL,
                    blocks       REAL NOT NULL,
                    turnovers    REAL NOT NULL,
                    fg_made      REAL NOT NULL,
                    fg_attempted REAL NOT NULL,
                    fg_pct       REAL NOT NULL,
                    fg3_made     REAL NOT NULL,
                    fg3_attempted REAL NOT NULL,
                    fg3_pct      REAL NOT NULL,
                    ft_made      REAL NOT NULL,
                    ft_attempted REAL NOT NULL,
                    ft_pct       REAL NOT NULL,
                    plus_minus   REAL NOT NULL,
                    win_loss     TEXT NOT NULL,
                    PRIMARY KEY (player_id, game_id)
                );
                CREATE INDEX IF NOT EXISTS idx_player_games_date
                    ON player_games (player_id, game_date);
                CREATE TABLE IF NOT EXISTS market_lines (
                    player_id  INTEGER NOT NULL,
                    game_date  TEXT NOT NULL,
                    line       REAL NOT NULL,
                    fetched_at TEXT NOT NULL,
                    sportsbook TEXT NOT NULL,
                    PRIMARY KEY (player_id, game_date)
                );
                CREATE TABLE IF NOT EXISTS predictions (
                    player_id        INTEGER NOT NULL,
                    game_date        TEXT NOT NULL,
                    line             REAL NOT NULL,
                    prob_over        REAL NOT NULL,
                    confidence       REAL NOT NULL,
                    artifact_version TEXT NOT NULL,
                    generated_at     TEXT NOT NULL,
                    PRIMARY KEY (player_id, game_date)
                );",
            )
            .context("initialize sqlite schema")?;
        Ok(())
    }

    pub fn upsert_player(&self, player_id: i64, player_name: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO players (player_id, player_name) VALUES (?1, ?2)
                 ON CONFLICT(player_id) DO UPDATE SET player_name = excluded.player_name",
                params![player_id, player_name],
            )
            .context("upsert player")?;
        Ok(())
    }

    pub fn insert_game(&self, rec: &GameRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO player_games (
                    player_id, game_id, game_date, home_team, away_team, home_away,
                    minutes, points, rebounds, assists, steals, blocks, turnovers,
                    fg_made, fg_attempted, fg_pct, fg3_made, fg3_attempted, fg3_pct,
                    ft_made, ft_attempted, ft_pct, plus_minus, win_loss
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                           ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
                 ON CONFLICT(player_id, game_id) DO UPDATE SET
                    game_date = excluded.game_date,
                    minutes = excluded.minutes,
                    points = excluded.points",
                params![
                    rec.player_id,
                    rec.game_id,
                    rec.game_date,
                    rec.home_team,
                    rec.away_team,
                    rec.home_away.as_str(),
                    rec.minutes,
                    rec.points,
                    rec.rebounds,
                    rec.assists,
                    rec.steals,
                    rec.blocks,
                    rec.turnovers,
                    rec.fg_made,
                    rec.fg_attempted,
                    rec.fg_pct,
                    rec.fg3_made,
                    rec.fg3_attempted,
                    rec.fg3_pct,
                    rec.ft_made,
                    rec.ft_attempted,
                    rec.ft_pct,
                    rec.plus_minus,
                    rec.win_loss,
                ],
            )
            .context("insert game record")?;
        Ok(())
    }

    /// Store a line observation, keeping only the most recently fetched one
    /// per (player, date).
    pub fn insert_market_line(&self, line: &MarketLine) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO market_lines (player_id, game_date, line, fetched_at, sportsbook)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(player_id, game_date) DO UPDATE SET
                    line = excluded.line,
                    fetched_at = excluded.fetched_at,
                    sportsbook = excluded.sportsbook
                 WHERE excluded.fetched_at >= market_lines.fetched_at",
                params![
                    line.player_id,
                    line.game_date,
                    line.line,
                    line.fetched_at,
                    line.sportsbook,
                ],
            )
            .context("insert market line")?;
        Ok(())
    }

    pub fn predictions_for_date(&self, date: NaiveDate) -> Result<Vec<Prediction>> {
        let mut stmt = self.conn.prepare(
            "SELECT player_id, game_date, line, prob_over, confidence,
                    artifact_version, generated_at
             FROM predictions WHERE game_date = ?1 ORDER BY player_id",
        )?;
        let rows = stmt
            .query_map(params![date], |row| {
                Ok(Prediction {
                    player_id: row.get(0)?,
                    game_date: row.get(1)?,
                    line: row.get(2)?,
                    prob_over: row.get(3)?,
                    confidence: row.get(4)?,
                    artifact_version: row.get(5)?,
                    generated_at: row.get::<_, DateTime<Utc>>(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read predictions for date")?;
        Ok(rows)
    }
}

impl PredictionSink for SqliteStatRepository {
    fn upsert_prediction(&self, pred: &Prediction) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO predictions (
                    player_id, game_date, line, prob_over, confidence,
                    artifact_version, generated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(player_id, game_date) DO UPDATE SET
                    line = excluded.line,
                    prob_over = excluded.prob_over,
                    confidence = excluded.confidence,
                    artifact_version = excluded.artifact_version,
                    generated_at = excluded.generated_at",
                params![
                    pred.player_id,
                    pred.game_date,
                    pred.line,
                    pred.prob_over,
                    pred.confidence,
                    pred.artifact_version,
                    pred.generated_at,
                ],
            )
            .context("upsert prediction")?;
        Ok(())
    }
}

impl SqliteStatRepository {
    pub fn all_market_lines(&self) -> Result<Vec<MarketLine>> {
        let mut stmt = self.conn.prepare(
            "SELECT player_id, game_date, line, fetched_at, sportsbook
             FROM market_lines ORDER BY player_id, game_date",
        )?;
        let rows = stmt
            .query_map([], map_market_line)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read market lines")?;
        Ok(rows)
    }
}

fn map_market_line(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketLine> {
    Ok(MarketLine {
        player_id: row.get(0)?,
        game_date: row.get(1)?,
        line: row.get(2)?,
        fetched_at: row.get::<_, DateTime<Utc>>(3)?,
        sportsbook: row.get(4)?,
    })
}

fn map_game_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameRecord> {
    Ok(GameRecord {
        player_id: row.get(0)?,
        game_id: row.get(1)?,
        game_date: row.get(2)?,
        home_team: row.get(3)?,
        away_team: row.get(4)?,
        home_away: HomeAway::parse(&row.get::<_, String>(5)?),
        minutes: row.get(6)?,
        points: row.get(7)?,
        rebounds: row.get(8)?,
        assists: row.get(9)?,
        steals: row.get(10)?,
        blocks: row.get(11)?,
        turnovers: row.get(12)?,
        fg_made: row.get(13)?,
        fg_attempted: row.get(14)?,
        fg_pct: row.get(15)?,
        fg3_made: row.get(16)?,
        fg3_attempted: row.get(17)?,
        fg3_pct: row.get(18)?,
        ft_made: row.get(19)?,
        ft_attempted: row.get(20)?,
        ft_pct: row.get(21)?,
        plus_minus: row.get(22)?,
        win_loss: row.get(23)?,
    })
}

const GAME_COLUMNS: &str = "player_id, game_id, game_date, home_team, away_team, home_away,
    minutes, points, rebounds, assists, steals, blocks, turnovers,
    fg_made, fg_attempted, fg_pct, fg3_made, fg3_attempted, fg3_pct,
    ft_made, ft_attempted, ft_pct, plus_minus, win_loss";

impl StatRepository for SqliteStatRepository {
    fn get_game_history(&self, player_id: i64) -> Result<Vec<GameRecord>> {
        let sql = format!(
            "SELECT {GAME_COLUMNS} FROM player_games
             WHERE player_id = ?1 ORDER BY game_date, game_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![player_id], map_game_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("read game history for player {player_id}"))?;
        Ok(rows)
    }

    fn get_opponent_history(&self, team: &str, before: NaiveDate) -> Result<Vec<GameRecord>> {
        let sql = format!(
            "SELECT {GAME_COLUMNS} FROM player_games
             WHERE (home_team = ?1 OR away_team = ?1) AND game_date < ?2
             ORDER BY game_date, game_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![team, before], map_game_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("read opponent history for {team}"))?;
        Ok(rows)
    }

    fn get_market_line(&self, player_id: i64, date: NaiveDate) -> Result<Option<MarketLine>> {
        let row = self
            .conn
            .query_row(
                "SELECT player_id, game_date, line, fetched_at, sportsbook
                 FROM market_lines WHERE player_id = ?1 AND game_date = ?2",
                params![player_id, date],
                map_market_line,
            )
            .optional()
            .context("read market line")?;
        Ok(row)
    }

    fn player_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT player_id FROM player_games ORDER BY player_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("read player ids")?;
        Ok(ids)
    }

    fn players_with_lines_on(&self, date: NaiveDate) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT player_id FROM market_lines WHERE game_date = ?1 ORDER BY player_id")?;
        let ids = stmt
            .query_map(params![date], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("read players with lines")?;
        Ok(ids)
    }
}

impl DefenseLookup for SqliteStatRepository {
    fn points_allowed_before(&self, team: &str, before: NaiveDate) -> Result<Option<f64>> {
        let games = self.get_opponent_history(team, before)?;
        if games.is_empty() {
            return Ok(None);
        }
        let sum: f64 = games.iter().map(|g| g.points).sum();
        Ok(Some(sum / games.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_game(player_id: i64, game_id: &str, date: NaiveDate, points: f64) -> GameRecord {
        GameRecord {
            player_id,
            game_id: game_id.to_string(),
            game_date: date,
            home_team: "BOS".to_string(),
            away_team: "LAL".to_string(),
            home_away: HomeAway::Home,
            minutes: "33:20".to_string(),
            points,
            rebounds: 6.0,
            assists: 5.0,
            steals: 1.0,
            blocks: 1.0,
            turnovers: 3.0,
            fg_made: 9.0,
            fg_attempted: 17.0,
            fg_pct: 0.53,
            fg3_made: 2.0,
            fg3_attempted: 5.0,
            fg3_pct: 0.4,
            ft_made: 5.0,
            ft_attempted: 6.0,
            ft_pct: 0.83,
            plus_minus: 7.0,
            win_loss: "W".to_string(),
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, d).unwrap()
    }

    #[test]
    fn games_round_trip_in_date_order() {
        let repo = SqliteStatRepository::open_in_memory().unwrap();
        repo.insert_game(&sample_game(1, "b", date(3), 22.0)).unwrap();
        repo.insert_game(&sample_game(1, "a", date(1), 18.0)).unwrap();
        repo.insert_game(&sample_game(2, "c", date(2), 30.0)).unwrap();

        let hist = repo.get_game_history(1).unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].game_id, "a");
        assert_eq!(hist[1].game_id, "b");
        assert_eq!(repo.player_ids().unwrap(), vec![1, 2]);
    }

    #[test]
    fn duplicate_game_insert_updates_in_place() {
        let repo = SqliteStatRepository::open_in_memory().unwrap();
        repo.insert_game(&sample_game(1, "a", date(1), 18.0)).unwrap();
        repo.insert_game(&sample_game(1, "a", date(1), 25.0)).unwrap();
        let hist = repo.get_game_history(1).unwrap();
        assert_eq!(hist.len(), 1);
        assert!((hist[0].points - 25.0).abs() < 1e-9);
    }

    #[test]
    fn market_line_upsert_keeps_freshest_fetch() {
        let repo = SqliteStatRepository::open_in_memory().unwrap();
        let make = |hour, line| MarketLine {
            player_id: 9,
            game_date: date(10),
            line,
            fetched_at: Utc.with_ymd_and_hms(2025, 2, 10, hour, 0, 0).unwrap(),
            sportsbook: "book".to_string(),
        };
        repo.insert_market_line(&make(12, 26.5)).unwrap();
        // A stale re-fetch must not clobber the fresher row.
        repo.insert_market_line(&make(8, 24.5)).unwrap();
        let got = repo.get_market_line(9, date(10)).unwrap().unwrap();
        assert!((got.line - 26.5).abs() < 1e-9);

        repo.insert_market_line(&make(15, 27.0)).unwrap();
        let got = repo.get_market_line(9, date(10)).unwrap().unwrap();
        assert!((got.line - 27.0).abs() < 1e-9);
        assert_eq!(repo.players_with_lines_on(date(10)).unwrap(), vec![9]);
    }

    #[test]
    fn defense_lookup_uses_strictly_prior_games() {
        let repo = SqliteStatRepository::open_in_memory().unwrap();
        repo.insert_game(&sample_game(1, "a", date(1), 10.0)).unwrap();
        repo.insert_game(&sample_game(2, "b", date(2), 20.0)).unwrap();
        repo.insert_game(&sample_game(3, "c", date(5), 40.0)).unwrap();

        let avg = repo.points_allowed_before("LAL", date(3)).unwrap().unwrap();
        assert!((avg - 15.0).abs() < 1e-9);
        assert!(repo.points_allowed_before("LAL", date(1)).unwrap().is_none());
        assert!(repo.points_allowed_before("MIA", date(9)).unwrap().is_none());

        let rows = repo.get_opponent_history("LAL", date(9)).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].game_date <= w[1].game_date));
    }

    #[test]
    fn prediction_upsert_overwrites_same_key() {
        let repo = SqliteStatRepository::open_in_memory().unwrap();
        let make = |prob| Prediction {
            player_id: 4,
            game_date: date(12),
            line: 22.5,
            prob_over: prob,
            confidence: 0.6,
            artifact_version: "20250210_120000".to_string(),
            generated_at: Utc.with_ymd_and_hms(2025, 2, 11, 9, 0, 0).unwrap(),
        };
        repo.upsert_prediction(&make(0.55)).unwrap();
        repo.upsert_prediction(&make(0.61)).unwrap();
        let preds = repo.predictions_for_date(date(12)).unwrap();
        assert_eq!(preds.len(), 1);
        assert!((preds[0].prob_over - 0.61).abs() < 1e-9);
    }
}
