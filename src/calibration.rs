//! Isotonic probability calibration via pool-adjacent-violators, fit on
//! out-of-fold predictions and applied as a monotone interpolating map.

use serde::{Deserialize, Serialize};

use crate::model::FittedModel;

/// A fitted monotone map from raw scores to calibrated probabilities.
/// `xs`/`ys` are the pooled block centers in ascending order; application
/// interpolates linearly between them and clamps outside the fitted range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsotonicCalibrator {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl IsotonicCalibrator {
    /// Pool-adjacent-violators over (score, label) pairs. Returns None when
    /// fewer than two samples are available, in which case calibration is
    /// skipped upstream.
    pub fn fit(scores: &[f64], labels: &[f64]) -> Option<Self> {
        if scores.len() < 2 || scores.len() != labels.len() {
            return None;
        }
        let mut pairs: Vec<(f64, f64)> =
            scores.iter().copied().zip(labels.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Blocks of (x sum, y sum, weight); merge backwards while the mean
        // of the last block is below its predecessor's.
        let mut blocks: Vec<(f64, f64, f64)> = Vec::with_capacity(pairs.len());
        for (x, y) in pairs {
            blocks.push((x, y, 1.0));
            while blocks.len() >= 2 {
                let last = blocks[blocks.len() - 1];
                let prev = blocks[blocks.len() - 2];
                if last.1 / last.2 >= prev.1 / prev.2 {
                    break;
                }
                blocks.pop();
                if let Some(top) = blocks.last_mut() {
                    top.0 += last.0;
                    top.1 += last.1;
                    top.2 += last.2;
                }
            }
        }

        let xs: Vec<f64> = blocks.iter().map(|(x, _, w)| x / w).collect();
        let ys: Vec<f64> = blocks
            .iter()
            .map(|(_, y, w)| (y / w).clamp(0.0, 1.0))
            .collect();
        Some(Self { xs, ys })
    }

    pub fn apply(&self, score: f64) -> f64 {
        let n = self.xs.len();
        if n == 0 {
            return score.clamp(0.0, 1.0);
        }
        if score <= self.xs[0] {
            return self.ys[0];
        }
        if score >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let hi = self.xs.partition_point(|&x| x < score);
        let lo = hi - 1;
        let span = self.xs[hi] - self.xs[lo];
        if span <= 0.0 {
            return self.ys[hi];
        }
        let t = (score - self.xs[lo]) / span;
        self.ys[lo] + t * (self.ys[hi] - self.ys[lo])
    }
}

/// The serving model: a fitted candidate plus an optional calibration map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratedModel {
    pub model: FittedModel,
    pub calibrator: Option<IsotonicCalibrator>,
}

impl CalibratedModel {
    pub fn uncalibrated(model: FittedModel) -> Self {
        Self {
            model,
            calibrator: None,
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let raw = self.model.predict_proba(row);
        match &self.calibrator {
            Some(cal) => cal.apply(raw),
            None => raw,
        }
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|r| self.predict_proba(r)).collect()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrator.is_some()
    }
}
