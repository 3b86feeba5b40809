//! Candidate training, selection, grid tuning, and calibration over a
//! labeled training set. The outcome wraps the most refined model together
//! with the fitted preprocessor and a full metrics record.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::{CalibratedModel, IsotonicCalibrator};
use crate::dataset::{Preprocessor, TrainingExample, TrainingMatrix};
use crate::error::TrainError;
use crate::metrics::{brier_score, roc_auc};
use crate::model::{
    BoostParams, FittedModel, ForestParams, LogisticParams, fit_gradient_boost, fit_logistic,
    fit_random_forest,
};

#[derive(Debug, Clone, Copy)]
pub struct TrainConfig {
    pub seed: u64,
    pub test_fraction: f64,
    pub cv_folds: usize,
    pub tune: bool,
    pub calibrate: bool,
    /// Calibration is kept only if it does not worsen held-out Brier by
    /// more than this.
    pub brier_tolerance: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            test_fraction: 0.2,
            cv_folds: 5,
            tune: true,
            calibrate: true,
            brier_tolerance: 1e-4,
        }
    }
}

/// Tuning needs enough rows for the grid scores to mean anything.
const MIN_TUNE_SAMPLES: usize = 10;

/// Per-candidate scores, including failed candidates with their reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateReport {
    pub family: String,
    pub cv_auc_mean: f64,
    pub cv_auc_std: f64,
    pub test_auc: f64,
    pub test_brier: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub model_family: String,
    pub cv_auc_mean: f64,
    pub cv_auc_std: f64,
    pub test_auc: f64,
    pub test_brier: f64,
    pub uncalibrated_test_auc: f64,
    pub uncalibrated_test_brier: f64,
    pub calibrated: bool,
    pub train_samples: usize,
    pub test_samples: usize,
    pub feature_count: usize,
    pub hyperparameters: serde_json::Value,
    pub candidates: Vec<CandidateReport>,
    /// (output column, normalized importance), in column order.
    pub feature_importance: Vec<(String, f64)>,
}

#[derive(Debug)]
pub struct TrainOutcome {
    pub model: CalibratedModel,
    pub preprocessor: Preprocessor,
    pub metrics: EvaluationMetrics,
}

#[derive(Debug, Clone, Copy)]
enum CandidateSpec {
    Logistic(LogisticParams),
    Forest(ForestParams),
    Boost(BoostParams),
}

impl CandidateSpec {
    fn family(&self) -> &'static str {
        match self {
            CandidateSpec::Logistic(_) => "logistic",
            CandidateSpec::Forest(_) => "random_forest",
            CandidateSpec::Boost(_) => "gradient_boost",
        }
    }

    fn fit(&self, rows: &[Vec<f64>], labels: &[f64]) -> Result<FittedModel> {
        match self {
            CandidateSpec::Logistic(p) => fit_logistic(rows, labels, *p),
            CandidateSpec::Forest(p) => fit_random_forest(rows, labels, *p),
            CandidateSpec::Boost(p) => fit_gradient_boost(rows, labels, *p),
        }
    }

    fn hyperparameters(&self) -> serde_json::Value {
        match self {
            CandidateSpec::Logistic(p) => serde_json::to_value(p),
            CandidateSpec::Forest(p) => serde_json::to_value(p),
            CandidateSpec::Boost(p) => serde_json::to_value(p),
        }
        .unwrap_or(serde_json::Value::Null)
    }

    fn grid(&self) -> Vec<CandidateSpec> {
        match self {
            CandidateSpec::Logistic(base) => [0.001, 0.01, 0.1, 1.0]
                .iter()
                .map(|&l2| CandidateSpec::Logistic(LogisticParams { l2, ..*base }))
                .collect(),
            CandidateSpec::Forest(base) => {
                let mut out = Vec::new();
                for n_trees in [50, 100] {
                    for max_depth in [5, 10] {
                        out.push(CandidateSpec::Forest(ForestParams {
                            n_trees,
                            max_depth,
                            ..*base
                        }));
                    }
                }
                out
            }
            CandidateSpec::Boost(base) => {
                let mut out = Vec::new();
                for learning_rate in [0.05, 0.1] {
                    for n_trees in [50, 100] {
                        for max_depth in [2, 3] {
                            out.push(CandidateSpec::Boost(BoostParams {
                                learning_rate,
                                n_trees,
                                max_depth,
                                ..*base
                            }));
                        }
                    }
                }
                out
            }
        }
    }
}

/// Run the full selection pipeline: split, candidate CV + held-out scoring,
/// best-by-AUC selection, grid tuning, isotonic calibration with an
/// acceptance gate, and a metrics record covering every stage.
pub fn train(examples: &[TrainingExample], config: &TrainConfig) -> Result<TrainOutcome> {
    if examples.is_empty() {
        return Err(TrainError::EmptyTrainingSet.into());
    }

    let (train_idx, test_idx) = shuffle_split(examples.len(), config.test_fraction, config.seed);
    let train_examples: Vec<TrainingExample> =
        train_idx.iter().map(|&i| examples[i].clone()).collect();
    let test_examples: Vec<TrainingExample> =
        test_idx.iter().map(|&i| examples[i].clone()).collect();

    let preprocessor = Preprocessor::fit(&train_examples).context("fit preprocessor")?;
    let train = preprocessor.transform(&train_examples);
    let test = preprocessor.transform(&test_examples);
    info!(
        train = train.len(),
        test = test.len(),
        features = preprocessor.output_columns.len(),
        "training set split"
    );

    let candidates = [
        CandidateSpec::Logistic(LogisticParams::default()),
        CandidateSpec::Forest(ForestParams {
            seed: config.seed,
            ..ForestParams::default()
        }),
        CandidateSpec::Boost(BoostParams {
            seed: config.seed,
            ..BoostParams::default()
        }),
    ];

    let mut reports = Vec::with_capacity(candidates.len());
    let mut fitted: Vec<(CandidateSpec, FittedModel, f64, f64)> = Vec::new();
    for spec in candidates {
        match evaluate_candidate(&spec, &train, &test, config) {
            Ok((model, report)) => {
                info!(
                    family = %report.family,
                    cv_auc = report.cv_auc_mean,
                    test_auc = report.test_auc,
                    test_brier = report.test_brier,
                    "candidate evaluated"
                );
                fitted.push((spec, model, report.test_auc, report.test_brier));
                reports.push(report);
            }
            Err(err) => {
                warn!(family = spec.family(), error = %err, "candidate failed, excluded");
                reports.push(CandidateReport {
                    family: spec.family().to_string(),
                    cv_auc_mean: 0.0,
                    cv_auc_std: 0.0,
                    test_auc: 0.0,
                    test_brier: 0.0,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    if fitted.is_empty() {
        return Err(TrainError::AllCandidatesFailed(candidates.len()).into());
    }

    // Highest held-out AUC wins; ties break toward the lower Brier.
    fitted.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
    });
    let (mut best_spec, mut best_model, _, _) = fitted.swap_remove(0);
    info!(family = best_spec.family(), "selected best candidate");

    if config.tune {
        if train.len() >= MIN_TUNE_SAMPLES {
            (best_spec, best_model) = tune_candidate(best_spec, best_model, &train, config)?;
        } else {
            info!(
                samples = train.len(),
                "skipping hyperparameter tuning on small training split"
            );
        }
    }

    let raw_test = best_model.predict_batch(&test.rows);
    let uncalibrated_test_auc = auc_or_default(&raw_test, &test.labels, "held-out");
    let uncalibrated_test_brier = brier_score(&raw_test, &test.labels);

    let mut model = CalibratedModel::uncalibrated(best_model);
    let mut test_auc = uncalibrated_test_auc;
    let mut test_brier = uncalibrated_test_brier;
    if config.calibrate {
        if let Some(calibrator) = fit_oof_calibrator(&best_spec, &train, config)? {
            let cal_probs: Vec<f64> = raw_test.iter().map(|&p| calibrator.apply(p)).collect();
            let cal_auc = auc_or_default(&cal_probs, &test.labels, "calibrated held-out");
            let cal_brier = brier_score(&cal_probs, &test.labels);
            if test.is_empty() || cal_brier <= uncalibrated_test_brier + config.brier_tolerance {
                info!(
                    brier_before = uncalibrated_test_brier,
                    brier_after = cal_brier,
                    "calibration accepted"
                );
                model.calibrator = Some(calibrator);
                test_auc = cal_auc;
                test_brier = cal_brier;
            } else {
                warn!(
                    brier_before = uncalibrated_test_brier,
                    brier_after = cal_brier,
                    "calibration worsened held-out Brier, keeping raw model"
                );
            }
        } else {
            info!("too few out-of-fold samples, skipping calibration");
        }
    }

    let selected = reports
        .iter()
        .find(|r| r.family == best_spec.family() && r.error.is_none());
    let importance = model.model.feature_importance();
    let metrics = EvaluationMetrics {
        model_family: best_spec.family().to_string(),
        cv_auc_mean: selected.map_or(0.5, |r| r.cv_auc_mean),
        cv_auc_std: selected.map_or(0.0, |r| r.cv_auc_std),
        test_auc,
        test_brier,
        uncalibrated_test_auc,
        uncalibrated_test_brier,
        calibrated: model.is_calibrated(),
        train_samples: train.len(),
        test_samples: test.len(),
        feature_count: preprocessor.output_columns.len(),
        hyperparameters: best_spec.hyperparameters(),
        candidates: reports,
        feature_importance: preprocessor
            .output_columns
            .iter()
            .cloned()
            .zip(importance)
            .collect(),
    };

    Ok(TrainOutcome {
        model,
        preprocessor,
        metrics,
    })
}

fn evaluate_candidate(
    spec: &CandidateSpec,
    train: &TrainingMatrix,
    test: &TrainingMatrix,
    config: &TrainConfig,
) -> Result<(FittedModel, CandidateReport)> {
    let (cv_auc_mean, cv_auc_std) = cross_validated_auc(spec, train, config)?;
    let model = spec.fit(&train.rows, &train.labels)?;
    let probs = model.predict_batch(&test.rows);
    let test_auc = auc_or_default(&probs, &test.labels, spec.family());
    let test_brier = brier_score(&probs, &test.labels);
    let report = CandidateReport {
        family: spec.family().to_string(),
        cv_auc_mean,
        cv_auc_std,
        test_auc,
        test_brier,
        error: None,
    };
    Ok((model, report))
}

fn tune_candidate(
    spec: CandidateSpec,
    current: FittedModel,
    train: &TrainingMatrix,
    config: &TrainConfig,
) -> Result<(CandidateSpec, FittedModel)> {
    let mut best = (spec, f64::NEG_INFINITY);
    for candidate in spec.grid() {
        match cross_validated_auc(&candidate, train, config) {
            Ok((mean, _)) if mean > best.1 => best = (candidate, mean),
            Ok(_) => {}
            Err(err) => {
                warn!(family = candidate.family(), error = %err, "grid point failed, skipped")
            }
        }
    }
    if best.1 == f64::NEG_INFINITY {
        return Ok((spec, current));
    }
    info!(
        family = best.0.family(),
        cv_auc = best.1,
        params = %best.0.hyperparameters(),
        "tuned hyperparameters"
    );
    let model = best.0.fit(&train.rows, &train.labels)?;
    Ok((best.0, model))
}

/// Mean and std of fold AUC over a k-fold pass. Folds with undefined AUC
/// (single-class) count as 0.5; with fewer than two rows CV is skipped and
/// reported as (0.5, 0.0).
fn cross_validated_auc(
    spec: &CandidateSpec,
    train: &TrainingMatrix,
    config: &TrainConfig,
) -> Result<(f64, f64)> {
    let folds = fold_assignment(train.len(), config.cv_folds, config.seed);
    let Some(folds) = folds else {
        return Ok((0.5, 0.0));
    };

    let mut fold_aucs = Vec::with_capacity(folds.len());
    for fold in &folds {
        let fit_idx: Vec<usize> = (0..train.len()).filter(|i| !fold.contains(i)).collect();
        let fit_split = train.select(&fit_idx);
        let eval_split = train.select(fold);
        let model = spec.fit(&fit_split.rows, &fit_split.labels)?;
        let probs = model.predict_batch(&eval_split.rows);
        fold_aucs.push(roc_auc(&probs, &eval_split.labels).unwrap_or(0.5));
    }

    let mean = fold_aucs.iter().sum::<f64>() / fold_aucs.len() as f64;
    let var = fold_aucs.iter().map(|a| (a - mean) * (a - mean)).sum::<f64>()
        / fold_aucs.len() as f64;
    Ok((mean, var.sqrt()))
}

/// Pooled out-of-fold predictions over the training split, then a PAV fit.
fn fit_oof_calibrator(
    spec: &CandidateSpec,
    train: &TrainingMatrix,
    config: &TrainConfig,
) -> Result<Option<IsotonicCalibrator>> {
    let Some(folds) = fold_assignment(train.len(), config.cv_folds, config.seed) else {
        return Ok(None);
    };

    let mut scores = Vec::with_capacity(train.len());
    let mut labels = Vec::with_capacity(train.len());
    for fold in &folds {
        let fit_idx: Vec<usize> = (0..train.len()).filter(|i| !fold.contains(i)).collect();
        let fit_split = train.select(&fit_idx);
        let model = spec.fit(&fit_split.rows, &fit_split.labels)?;
        for &i in fold {
            scores.push(model.predict_proba(&train.rows[i]));
            labels.push(train.labels[i]);
        }
    }
    Ok(IsotonicCalibrator::fit(&scores, &labels))
}

fn auc_or_default(probs: &[f64], labels: &[f64], what: &str) -> f64 {
    match roc_auc(probs, labels) {
        Some(auc) => auc,
        None => {
            warn!(split = what, "AUC undefined (single class), recording 0.5");
            0.5
        }
    }
}

/// Seeded shuffle split. The training side always keeps at least one row;
/// the test side may be empty for tiny inputs.
fn shuffle_split(n: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let test_n = ((n as f64 * test_fraction).round() as usize).min(n.saturating_sub(1));
    let test = indices.split_off(n - test_n);
    (indices, test)
}

/// k shuffled folds, each fold used once for evaluation. None when there are
/// not at least two rows; the fold count shrinks to the row count.
fn fold_assignment(n: usize, k: usize, seed: u64) -> Option<Vec<Vec<usize>>> {
    if n < 2 {
        return None;
    }
    let k = k.clamp(2, n);
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    indices.shuffle(&mut rng);
    let mut folds = vec![Vec::new(); k];
    for (pos, idx) in indices.into_iter().enumerate() {
        folds[pos % k].push(idx);
    }
    Some(folds)
}
