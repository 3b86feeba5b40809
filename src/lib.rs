pub mod artifact;
pub mod calibration;
pub mod dataset;
pub mod error;
pub mod features;
pub mod gamelog;
pub mod metrics;
pub mod model;
pub mod predictor;
pub mod repository;
pub mod trainer;

pub use artifact::{ArtifactStore, ModelArtifact};
pub use calibration::{CalibratedModel, IsotonicCalibrator};
pub use dataset::{Preprocessor, TrainingExample, build_training_set};
pub use error::{ArtifactError, PredictError, TrainError};
pub use features::{FeatureEngine, FeatureVector, TeamGameIndex, vectors_for_players};
pub use gamelog::{GameRecord, HomeAway, MarketLine, Prediction};
pub use predictor::PredictionService;
pub use repository::{PredictionSink, SqliteStatRepository, StatRepository};
pub use trainer::{EvaluationMetrics, TrainConfig, TrainOutcome, train};
