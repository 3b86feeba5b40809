//! End-to-end pipeline over synthetic data: ingest game logs and lines,
//! build a training set, train and save an artifact, then serve and store a
//! prediction for an unplayed date.

use chrono::{NaiveDate, TimeZone, Utc};
use std::path::PathBuf;

use propcast::artifact::ArtifactStore;
use propcast::dataset::build_training_set;
use propcast::features::{MIN_HISTORY_GAMES, TeamGameIndex, vectors_for_players};
use propcast::gamelog::{GameRecord, HomeAway, MarketLine};
use propcast::predictor::PredictionService;
use propcast::repository::{SqliteStatRepository, StatRepository};
use propcast::trainer::{TrainConfig, train};

fn scratch_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "propcast-pipeline-{tag}-{}-{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 2).unwrap() + chrono::Days::new(n as u64)
}

fn game(player_id: i64, n: u32, points: f64) -> GameRecord {
    GameRecord {
        player_id,
        game_id: format!("p{player_id}g{n:02}"),
        game_date: day(n * 2),
        home_team: "DEN".to_string(),
        away_team: "MIN".to_string(),
        home_away: if n % 2 == 0 { HomeAway::Home } else { HomeAway::Away },
        minutes: "35:30".to_string(),
        points,
        rebounds: 7.0,
        assists: 5.0,
        steals: 1.0,
        blocks: 1.0,
        turnovers: 3.0,
        fg_made: points / 2.2,
        fg_attempted: 19.0,
        fg_pct: 0.48,
        fg3_made: 2.0,
        fg3_attempted: 6.0,
        fg3_pct: 0.33,
        ft_made: 4.0,
        ft_attempted: 5.0,
        ft_pct: 0.8,
        plus_minus: 2.0,
        win_loss: "W".to_string(),
    }
}

fn market_line(player_id: i64, game_n: u32, value: f64) -> MarketLine {
    MarketLine {
        player_id,
        game_date: day(game_n * 2),
        line: value,
        fetched_at: Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap(),
        sportsbook: "synthetic".to_string(),
    }
}

/// Three players with 15-game histories and one line each on their 11th
/// game. The 16th game date is unplayed and carries a line too.
fn seed(repo: &SqliteStatRepository) {
    for p in 1..=3 {
        repo.upsert_player(p, &format!("Player {p}")).unwrap();
        for n in 0..15 {
            // Player-specific scoring level, mild game-to-game swing.
            let points = 12.0 + 4.0 * p as f64 + ((n * 3) % 7) as f64;
            repo.insert_game(&game(p, n, points)).unwrap();
        }
        // 11th game is index 10; player 1 lands under this line, 2 and 3
        // land over, so the training labels are mixed.
        repo.insert_market_line(&market_line(p, 10, 19.5 + p as f64))
            .unwrap();
        repo.insert_market_line(&market_line(p, 15, 19.5 + p as f64))
            .unwrap();
    }
}

fn seeded_repo() -> SqliteStatRepository {
    let repo = SqliteStatRepository::open_in_memory().unwrap();
    seed(&repo);
    repo
}

fn build_examples(repo: &SqliteStatRepository) -> Vec<propcast::TrainingExample> {
    let histories: Vec<Vec<GameRecord>> = repo
        .player_ids()
        .unwrap()
        .into_iter()
        .map(|p| repo.get_game_history(p).unwrap())
        .collect();
    let index = TeamGameIndex::from_records(histories.iter().flatten());
    let vectors = vectors_for_players(&histories, &index).unwrap();
    build_training_set(&vectors, repo.all_market_lines().unwrap())
}

#[test]
fn eleventh_game_lines_yield_exactly_three_examples() {
    let repo = seeded_repo();
    let examples = build_examples(&repo);
    // One in-history line per player; the future line has no realized game.
    assert_eq!(examples.len(), 3);
    for ex in &examples {
        assert_eq!(ex.game_date, day(10 * 2));
        assert!(!ex.values.is_empty());
    }
    // Each example's target had exactly MIN_HISTORY_GAMES prior games.
    let hist = repo.get_game_history(1).unwrap();
    let prior = hist.iter().filter(|g| g.game_date < day(20)).count();
    assert_eq!(prior, MIN_HISTORY_GAMES);
}

#[test]
fn rebuilding_the_training_set_is_deterministic() {
    let repo = seeded_repo();
    let a = build_examples(&repo);
    let b = build_examples(&repo);
    assert_eq!(a, b);
}

#[test]
fn train_save_load_predict_upsert_round_trip() {
    let repo = seeded_repo();
    let examples = build_examples(&repo);
    let outcome = train(&examples, &TrainConfig::default()).unwrap();
    assert!(outcome.metrics.train_samples + outcome.metrics.test_samples == 3);

    let store = ArtifactStore::new(scratch_dir("e2e"));
    let root = store.root().to_path_buf();
    let version = store.save(&outcome).unwrap();

    let service = PredictionService::new(repo, store);
    let loaded = service.load_latest().unwrap();
    assert_eq!(loaded, version);

    // The 16th game date is in the future relative to every history.
    let target = day(15 * 2);
    let predictions = service.predict_date(target).unwrap();
    assert_eq!(predictions.len(), 3);
    for p in &predictions {
        assert!((0.0..=1.0).contains(&p.prob_over), "prob = {}", p.prob_over);
        assert!((0.0..=1.0).contains(&p.confidence));
        assert_eq!(p.game_date, target);
        assert_eq!(p.artifact_version, version);
    }

    // Repeating the run overwrites in place rather than duplicating rows.
    let again = service.predict_date(target).unwrap();
    assert_eq!(again.len(), 3);

    std::fs::remove_dir_all(root).ok();
}

#[test]
fn stored_predictions_read_back_through_a_fresh_connection() {
    let dir = scratch_dir("readback");
    let db_path = dir.join("propcast.sqlite");
    let repo = SqliteStatRepository::open(&db_path).unwrap();
    seed(&repo);

    let examples = build_examples(&repo);
    let outcome = train(&examples, &TrainConfig::default()).unwrap();
    let store = ArtifactStore::new(dir.join("models"));
    store.save(&outcome).unwrap();

    let service = PredictionService::new(repo, store);
    service.load_latest().unwrap();
    let target = day(15 * 2);
    let served = service.predict_date(target).unwrap();
    assert_eq!(served.len(), 3);

    let reader = SqliteStatRepository::open(&db_path).unwrap();
    let stored = reader.predictions_for_date(target).unwrap();
    assert_eq!(stored.len(), 3);
    let keys: Vec<i64> = stored.iter().map(|p| p.player_id).collect();
    assert_eq!(keys, vec![1, 2, 3]);
    assert!(reader.predictions_for_date(day(99)).unwrap().is_empty());

    std::fs::remove_dir_all(dir).ok();
}
