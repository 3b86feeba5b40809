//! Versioned model artifacts on disk: one immutable timestamped directory
//! per training run plus an atomically swapped `latest` pointer file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::CalibratedModel;
use crate::dataset::Preprocessor;
use crate::error::ArtifactError;
use crate::trainer::{EvaluationMetrics, TrainOutcome};

const ARTIFACT_FILE: &str = "artifact.json";
const METRICS_FILE: &str = "metrics.json";
const LATEST_FILE: &str = "latest";

/// Everything needed to serve predictions, as loaded from one version.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// Ordered model input columns, as fitted.
    pub schema: Vec<String>,
    pub preprocessor: Preprocessor,
    pub model: CalibratedModel,
    pub metrics: EvaluationMetrics,
}

impl ModelArtifact {
    /// Model-level confidence scalar derived from the held-out Brier score.
    pub fn confidence(&self) -> f64 {
        (1.0 - self.metrics.test_brier.sqrt()).clamp(0.0, 1.0)
    }
}

#[derive(Serialize, Deserialize)]
struct ArtifactFile {
    version: String,
    created_at: DateTime<Utc>,
    schema: Vec<String>,
    preprocessor: Preprocessor,
    model: CalibratedModel,
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a new immutable version directory and repoint `latest` at it.
    /// Returns the version id.
    pub fn save(&self, outcome: &TrainOutcome) -> Result<String> {
        let created_at = Utc::now();
        let version = self.unique_version(created_at)?;
        let dir = self.root.join(&version);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;

        let file = ArtifactFile {
            version: version.clone(),
            created_at,
            schema: outcome.preprocessor.output_columns.clone(),
            preprocessor: outcome.preprocessor.clone(),
            model: outcome.model.clone(),
        };
        let artifact_json =
            serde_json::to_string_pretty(&file).context("serialize artifact")?;
        fs::write(dir.join(ARTIFACT_FILE), artifact_json)
            .with_context(|| format!("write {} in {}", ARTIFACT_FILE, dir.display()))?;
        let metrics_json =
            serde_json::to_string_pretty(&outcome.metrics).context("serialize metrics")?;
        fs::write(dir.join(METRICS_FILE), metrics_json)
            .with_context(|| format!("write {} in {}", METRICS_FILE, dir.display()))?;

        self.point_latest(&version)
            .with_context(|| format!("update latest pointer to {version}"))?;
        info!(version = %version, root = %self.root.display(), "saved model artifact");
        Ok(version)
    }

    /// Timestamped version id; a same-second rerun gets a numeric suffix so
    /// existing versions are never overwritten.
    fn unique_version(&self, created_at: DateTime<Utc>) -> Result<String> {
        let base = created_at.format("%Y%m%d_%H%M%S").to_string();
        if !self.root.join(&base).exists() {
            return Ok(base);
        }
        for n in 2..1000 {
            let candidate = format!("{base}_{n}");
            if !self.root.join(&candidate).exists() {
                return Ok(candidate);
            }
        }
        anyhow::bail!("could not allocate a version id under {base}");
    }

    /// Pointer swap via temp file + rename, so readers see either the old
    /// or the new version, never a partial write.
    fn point_latest(&self, version: &str) -> Result<()> {
        let tmp = self.root.join(format!("{LATEST_FILE}.tmp"));
        fs::write(&tmp, version)
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, self.root.join(LATEST_FILE)).context("swap latest pointer")?;
        Ok(())
    }

    pub fn latest_version(&self) -> Result<String, ArtifactError> {
        let pointer = self.root.join(LATEST_FILE);
        if !pointer.exists() {
            return Err(ArtifactError::NoLatest(self.root.clone()));
        }
        let version = fs::read_to_string(&pointer)?;
        Ok(version.trim().to_string())
    }

    pub fn load_latest(&self) -> Result<ModelArtifact, ArtifactError> {
        let version = self.latest_version()?;
        self.load_version(&version)
    }

    pub fn load_version(&self, version: &str) -> Result<ModelArtifact, ArtifactError> {
        let dir = self.root.join(version);
        if !dir.is_dir() {
            return Err(ArtifactError::MissingVersion(version.to_string()));
        }
        let file: ArtifactFile = read_json(&dir.join(ARTIFACT_FILE), version)?;
        let metrics: EvaluationMetrics = read_json(&dir.join(METRICS_FILE), version)?;
        Ok(ModelArtifact {
            version: file.version,
            created_at: file.created_at,
            schema: file.schema,
            preprocessor: file.preprocessor,
            model: file.model,
            metrics,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    version: &str,
) -> Result<T, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::Corrupt {
            version: version.to_string(),
            reason: format!("missing {}", path.display()),
        });
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|err| ArtifactError::Corrupt {
        version: version.to_string(),
        reason: format!("{}: {err}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::{TrainConfig, train};
    use crate::features::numeric_feature_names;
    use crate::dataset::TrainingExample;
    use crate::gamelog::HomeAway;
    use chrono::NaiveDate;

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "propcast-artifact-{tag}-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn outcome() -> TrainOutcome {
        let width = numeric_feature_names().len();
        let examples: Vec<TrainingExample> = (0..30)
            .map(|i| {
                let mut values = vec![0.0; width];
                values[0] = if i % 2 == 0 { 25.0 } else { 10.0 };
                TrainingExample {
                    player_id: i,
                    game_date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap()
                        + chrono::Days::new(i as u64),
                    values,
                    home_away: HomeAway::Home,
                    line: 17.5,
                    label: if i % 2 == 0 { 1.0 } else { 0.0 },
                }
            })
            .collect();
        let config = TrainConfig {
            tune: false,
            calibrate: false,
            ..TrainConfig::default()
        };
        train(&examples, &config).unwrap()
    }

    #[test]
    fn save_then_load_latest_round_trips() {
        let root = scratch_dir("roundtrip");
        let store = ArtifactStore::new(&root);
        let outcome = outcome();
        let version = store.save(&outcome).unwrap();

        let loaded = store.load_latest().unwrap();
        assert_eq!(loaded.version, version);
        assert_eq!(loaded.schema, outcome.preprocessor.output_columns);
        assert_eq!(loaded.metrics.model_family, outcome.metrics.model_family);
        let row = vec![0.5; loaded.schema.len()];
        assert!(
            (loaded.model.predict_proba(&row) - outcome.model.predict_proba(&row)).abs() < 1e-12
        );
        let c = loaded.confidence();
        assert!((0.0..=1.0).contains(&c));
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn second_save_moves_latest_and_keeps_old_version() {
        let root = scratch_dir("versions");
        let store = ArtifactStore::new(&root);
        let outcome = outcome();
        let v1 = store.save(&outcome).unwrap();
        let v2 = store.save(&outcome).unwrap();
        assert_ne!(v1, v2);
        assert_eq!(store.latest_version().unwrap(), v2);
        // The first version remains loadable by id.
        assert_eq!(store.load_version(&v1).unwrap().version, v1);
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn missing_pointer_version_and_corruption_are_distinct_errors() {
        let root = scratch_dir("errors");
        let store = ArtifactStore::new(&root);
        assert!(matches!(store.load_latest(), Err(ArtifactError::NoLatest(_))));
        assert!(matches!(
            store.load_version("20990101_000000"),
            Err(ArtifactError::MissingVersion(v)) if v == "20990101_000000"
        ));

        let version = store.save(&outcome()).unwrap();
        fs::write(root.join(&version).join(ARTIFACT_FILE), "{ not json").unwrap();
        match store.load_version(&version) {
            Err(ArtifactError::Corrupt { version: v, .. }) => assert_eq!(v, version),
            other => panic!("expected Corrupt, got {other:?}"),
        }

        fs::remove_file(root.join(&version).join(METRICS_FILE)).unwrap();
        fs::write(
            root.join(&version).join(ARTIFACT_FILE),
            serde_json::to_string(&ArtifactFile {
                version: version.clone(),
                created_at: Utc::now(),
                schema: vec![],
                preprocessor: outcome().preprocessor,
                model: outcome().model,
            })
            .unwrap(),
        )
        .unwrap();
        assert!(matches!(
            store.load_version(&version),
            Err(ArtifactError::Corrupt { .. })
        ));
        fs::remove_dir_all(root).ok();
    }
}
