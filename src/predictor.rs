//! Prediction serving: an explicitly initialized service that loads one
//! artifact at a time and scores (player, date) requests against it.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use tracing::{debug, info};

use crate::artifact::{ArtifactStore, ModelArtifact};
use crate::dataset::{HOME_ONEHOT_COLUMN, POINT_LINE_COLUMN};
use crate::error::{ArtifactError, PredictError};
use crate::features::{DefenseLookup, FeatureEngine, numeric_feature_names};
use crate::gamelog::{HomeAway, Prediction};
use crate::repository::{PredictionSink, StatRepository};

/// Ordered model input columns the current feature engine produces. The
/// loaded artifact's stored schema must match this exactly.
pub fn current_schema() -> Vec<String> {
    let mut schema = numeric_feature_names();
    schema.push(POINT_LINE_COLUMN.to_string());
    schema.push(HOME_ONEHOT_COLUMN.to_string());
    schema
}

/// Serves calibrated over-probabilities. Construction does not load a
/// model; until `load_latest` or `load_version` succeeds every prediction
/// request fails with [`PredictError::Uninitialized`]. Artifact swaps
/// happen under a write lock, so concurrent readers always see one
/// consistent artifact.
pub struct PredictionService<R> {
    repo: R,
    store: ArtifactStore,
    loaded: RwLock<Option<Arc<ModelArtifact>>>,
}

impl<R> PredictionService<R> {
    pub fn new(repo: R, store: ArtifactStore) -> Self {
        Self {
            repo,
            store,
            loaded: RwLock::new(None),
        }
    }

    pub fn load_latest(&self) -> Result<String, ArtifactError> {
        let artifact = self.store.load_latest()?;
        Ok(self.install(artifact))
    }

    pub fn load_version(&self, version: &str) -> Result<String, ArtifactError> {
        let artifact = self.store.load_version(version)?;
        Ok(self.install(artifact))
    }

    fn install(&self, artifact: ModelArtifact) -> String {
        let version = artifact.version.clone();
        info!(
            version = %version,
            family = %artifact.metrics.model_family,
            "model artifact loaded"
        );
        let mut guard = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::new(artifact));
        version
    }

    pub fn loaded_version(&self) -> Option<String> {
        let guard = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|a| a.version.clone())
    }

    fn current(&self) -> Result<Arc<ModelArtifact>, PredictError> {
        let guard = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        guard.clone().ok_or(PredictError::Uninitialized)
    }
}

impl<R: StatRepository + DefenseLookup> PredictionService<R> {
    /// Probability that the player clears their line on `date`. `Ok(None)`
    /// when there is no line for the pair or the player lacks the required
    /// prior history; a missing model or schema drift is a hard error.
    pub fn predict(&self, player_id: i64, date: NaiveDate) -> Result<Option<Prediction>> {
        let artifact = self.current()?;
        check_schema(&artifact)?;

        let Some(line) = self.repo.get_market_line(player_id, date)? else {
            debug!(player_id, %date, "no market line, skipping");
            return Ok(None);
        };

        let history = self.repo.get_game_history(player_id)?;
        // Same-day context when the target game is already recorded;
        // otherwise the documented Away default with an unknown opponent.
        let context = history.iter().find(|g| g.game_date == date);
        let home_away = context.map_or(HomeAway::Away, |g| g.home_away);
        let opponent = context.map(|g| g.opponent().to_string());

        let engine = FeatureEngine::new(&self.repo);
        let Some(vector) =
            engine.vector_for_date(&history, player_id, date, home_away, opponent.as_deref())?
        else {
            debug!(player_id, %date, "insufficient prior history, skipping");
            return Ok(None);
        };

        let row = artifact
            .preprocessor
            .transform_row(&vector.values, line.line, home_away);
        let prob_over = artifact.model.predict_proba(&row);
        Ok(Some(Prediction {
            player_id,
            game_date: date,
            line: line.line,
            prob_over,
            confidence: artifact.confidence(),
            artifact_version: artifact.version.clone(),
            generated_at: Utc::now(),
        }))
    }
}

impl<R: StatRepository + DefenseLookup + PredictionSink> PredictionService<R> {
    /// Predict every player with a line on `date` and upsert the results.
    /// Skipped players are logged, not errors.
    pub fn predict_date(&self, date: NaiveDate) -> Result<Vec<Prediction>> {
        let players = self.repo.players_with_lines_on(date)?;
        let mut out = Vec::with_capacity(players.len());
        for player_id in players {
            if let Some(pred) = self
                .predict(player_id, date)
                .with_context(|| format!("predict player {player_id} on {date}"))?
            {
                self.repo.upsert_prediction(&pred)?;
                out.push(pred);
            }
        }
        info!(%date, served = out.len(), "date predictions complete");
        Ok(out)
    }
}

fn check_schema(artifact: &ModelArtifact) -> Result<(), PredictError> {
    let produced = current_schema();
    if artifact.schema == produced {
        return Ok(());
    }
    let divergence = artifact
        .schema
        .iter()
        .zip(&produced)
        .position(|(a, b)| a != b)
        .map(|i| format!("column {i}: artifact '{}' vs engine '{}'", artifact.schema[i], produced[i]))
        .unwrap_or_else(|| "column count".to_string());
    Err(PredictError::SchemaMismatch {
        version: artifact.version.clone(),
        expected: artifact.schema.len(),
        produced: produced.len(),
        divergence,
    })
}
