use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use tracing_subscriber::EnvFilter;

use propcast::predictor::PredictionService;
use propcast::repository::SqliteStatRepository;
use propcast::ArtifactStore;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let Some(raw_date) = env::args().nth(1) else {
        bail!("usage: predict_date <YYYY-MM-DD>");
    };
    let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
        .with_context(|| format!("parse game date '{raw_date}'"))?;

    let db_path = env::var("PROPCAST_DB").unwrap_or_else(|_| "propcast.sqlite".to_string());
    let model_dir = env::var("PROPCAST_MODEL_DIR").unwrap_or_else(|_| "models".to_string());

    let repo = SqliteStatRepository::open(PathBuf::from(&db_path).as_path())?;
    let store = ArtifactStore::new(model_dir);
    let service = PredictionService::new(repo, store);
    let version = match env::var("PROPCAST_MODEL_VERSION") {
        Ok(v) => service.load_version(&v)?,
        Err(_) => service.load_latest()?,
    };

    let predictions = service.predict_date(date)?;
    if predictions.is_empty() {
        println!("no predictions for {date} (model {version})");
        return Ok(());
    }
    for p in &predictions {
        println!(
            "player {:>8}  line {:>5.1}  p(over) {:.3}  confidence {:.3}",
            p.player_id, p.line, p.prob_over, p.confidence
        );
    }
    println!("{} predictions stored (model {version})", predictions.len());
    Ok(())
}
