use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use propcast::dataset::build_training_set;
use propcast::features::{TeamGameIndex, vectors_for_players};
use propcast::gamelog::GameRecord;
use propcast::repository::{SqliteStatRepository, StatRepository};
use propcast::trainer::{TrainConfig, train};
use propcast::ArtifactStore;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db_path = env::var("PROPCAST_DB").unwrap_or_else(|_| "propcast.sqlite".to_string());
    let model_dir = env::var("PROPCAST_MODEL_DIR").unwrap_or_else(|_| "models".to_string());

    let mut config = TrainConfig::default();
    if let Ok(seed) = env::var("PROPCAST_SEED") {
        config.seed = seed.parse().context("parse PROPCAST_SEED")?;
    }
    if env::var("PROPCAST_SKIP_TUNE").is_ok() {
        config.tune = false;
    }
    if env::var("PROPCAST_SKIP_CALIBRATE").is_ok() {
        config.calibrate = false;
    }

    let repo = SqliteStatRepository::open(PathBuf::from(&db_path).as_path())?;
    let histories: Vec<Vec<GameRecord>> = repo
        .player_ids()?
        .into_iter()
        .map(|p| repo.get_game_history(p))
        .collect::<Result<_>>()?;
    info!(db = %db_path, players = histories.len(), "loaded game histories");

    let index = TeamGameIndex::from_records(histories.iter().flatten());
    let vectors = vectors_for_players(&histories, &index)?;
    let examples = build_training_set(&vectors, repo.all_market_lines()?);
    info!(
        vectors = vectors.len(),
        examples = examples.len(),
        "training set built"
    );

    let outcome = train(&examples, &config)?;
    info!(
        family = %outcome.metrics.model_family,
        cv_auc = outcome.metrics.cv_auc_mean,
        test_auc = outcome.metrics.test_auc,
        test_brier = outcome.metrics.test_brier,
        calibrated = outcome.metrics.calibrated,
        "training complete"
    );

    let store = ArtifactStore::new(model_dir);
    let version = store.save(&outcome)?;
    println!("saved model artifact {version}");
    Ok(())
}
