use std::path::PathBuf;

use thiserror::Error;

/// Errors from the artifact store read/write paths. Each failure mode is a
/// distinct variant so callers can tell "nothing published yet" apart from
/// "a published version is broken".
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no latest pointer in artifact root {0}")]
    NoLatest(PathBuf),
    #[error("artifact version {0} not found")]
    MissingVersion(String),
    #[error("artifact version {version} is incomplete or corrupt: {reason}")]
    Corrupt { version: String, reason: String },
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the prediction service.
#[derive(Debug, Error)]
pub enum PredictError {
    /// No artifact has been loaded. Requests fail fast instead of scoring
    /// with a placeholder model.
    #[error("no model artifact loaded; call load_latest first")]
    Uninitialized,
    /// The loaded artifact expects a different feature schema than the one
    /// the feature engine currently produces. Never auto-reconciled.
    #[error(
        "feature schema mismatch: artifact {version} expects {expected} columns, \
         feature engine produces {produced} (first divergence: {divergence})"
    )]
    SchemaMismatch {
        version: String,
        expected: usize,
        produced: usize,
        divergence: String,
    },
}

/// Errors from a training run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("training set is empty after joining features to market lines")]
    EmptyTrainingSet,
    #[error("all {0} model candidates failed to train")]
    AllCandidatesFailed(usize),
}
