//! Candidate model families, hand-rolled over f64 slices so fitted models
//! serialize cleanly into artifacts: L2 logistic regression, a bagged random
//! forest, and gradient-boosted regression trees on the logistic loss.

use anyhow::{Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogisticParams {
    pub l2: f64,
    pub learning_rate: f64,
    pub epochs: usize,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            l2: 0.1,
            learning_rate: 0.1,
            epochs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_leaf: 2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 3,
            learning_rate: 0.1,
            min_samples_leaf: 2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub params: LogisticParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    pub fn predict(&self, row: &[f64]) -> f64 {
        match self {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row.get(*feature).copied().unwrap_or(0.0) <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    pub trees: Vec<TreeNode>,
    pub params: ForestParams,
    importance: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostModel {
    pub base_score: f64,
    pub trees: Vec<TreeNode>,
    pub params: BoostParams,
    importance: Vec<f64>,
}

/// A fitted candidate, self-contained and serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FittedModel {
    Logistic(LogisticModel),
    RandomForest(ForestModel),
    GradientBoost(BoostModel),
}

impl FittedModel {
    pub fn family(&self) -> &'static str {
        match self {
            FittedModel::Logistic(_) => "logistic",
            FittedModel::RandomForest(_) => "random_forest",
            FittedModel::GradientBoost(_) => "gradient_boost",
        }
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        match self {
            FittedModel::Logistic(m) => {
                let z: f64 = m
                    .weights
                    .iter()
                    .zip(row)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + m.bias;
                sigmoid(z)
            }
            FittedModel::RandomForest(m) => {
                if m.trees.is_empty() {
                    return 0.5;
                }
                let sum: f64 = m.trees.iter().map(|t| t.predict(row)).sum();
                (sum / m.trees.len() as f64).clamp(0.0, 1.0)
            }
            FittedModel::GradientBoost(m) => {
                let mut score = m.base_score;
                for tree in &m.trees {
                    score += m.params.learning_rate * tree.predict(row);
                }
                sigmoid(score)
            }
        }
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|r| self.predict_proba(r)).collect()
    }

    /// Per-input-column importance, normalized to sum to 1. Absolute
    /// coefficients for the linear model, accumulated variance reduction
    /// for the tree ensembles.
    pub fn feature_importance(&self) -> Vec<f64> {
        let raw = match self {
            FittedModel::Logistic(m) => m.weights.iter().map(|w| w.abs()).collect(),
            FittedModel::RandomForest(m) => m.importance.clone(),
            FittedModel::GradientBoost(m) => m.importance.clone(),
        };
        normalize(raw)
    }
}

fn normalize(mut raw: Vec<f64>) -> Vec<f64> {
    let total: f64 = raw.iter().sum();
    if total > 0.0 {
        for v in &mut raw {
            *v /= total;
        }
    }
    raw
}

fn check_shape(rows: &[Vec<f64>], labels: &[f64]) -> Result<usize> {
    if rows.is_empty() || rows.len() != labels.len() {
        bail!(
            "model fit needs matching non-empty rows and labels (got {} rows, {} labels)",
            rows.len(),
            labels.len()
        );
    }
    let width = rows[0].len();
    if width == 0 || rows.iter().any(|r| r.len() != width) {
        bail!("model fit needs rectangular non-empty rows");
    }
    Ok(width)
}

/// Batch gradient descent on the L2-regularized logistic loss. The bias
/// term is not regularized.
pub fn fit_logistic(rows: &[Vec<f64>], labels: &[f64], params: LogisticParams) -> Result<FittedModel> {
    let width = check_shape(rows, labels)?;
    let n = rows.len() as f64;
    let mut weights = vec![0.0_f64; width];
    let mut bias = 0.0_f64;

    for _ in 0..params.epochs {
        let mut grad_w = vec![0.0_f64; width];
        let mut grad_b = 0.0_f64;
        for (row, &y) in rows.iter().zip(labels) {
            let z: f64 = weights.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() + bias;
            let err = sigmoid(z) - y;
            for (g, &x) in grad_w.iter_mut().zip(row) {
                *g += err * x;
            }
            grad_b += err;
        }
        for (w, g) in weights.iter_mut().zip(&grad_w) {
            *w -= params.learning_rate * (g / n + params.l2 * *w);
        }
        bias -= params.learning_rate * grad_b / n;
    }

    Ok(FittedModel::Logistic(LogisticModel {
        weights,
        bias,
        params,
    }))
}

struct TreeFitter<'a> {
    rows: &'a [Vec<f64>],
    targets: &'a [f64],
    max_depth: usize,
    min_samples_leaf: usize,
    /// Features considered at each split; None means all of them.
    features_per_split: Option<usize>,
    importance: Vec<f64>,
}

impl<'a> TreeFitter<'a> {
    fn fit(&mut self, indices: &[usize], depth: usize, rng: &mut StdRng) -> TreeNode {
        let mean = self.mean_target(indices);
        if depth >= self.max_depth
            || indices.len() < 2 * self.min_samples_leaf
            || self.is_pure(indices)
        {
            return TreeNode::Leaf { value: mean };
        }

        let Some((feature, threshold, reduction)) = self.best_split(indices, rng) else {
            return TreeNode::Leaf { value: mean };
        };
        self.importance[feature] += reduction;

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .copied()
            .partition(|&i| self.rows[i][feature] <= threshold);
        TreeNode::Split {
            feature,
            threshold,
            left: Box::new(self.fit(&left_idx, depth + 1, rng)),
            right: Box::new(self.fit(&right_idx, depth + 1, rng)),
        }
    }

    fn mean_target(&self, indices: &[usize]) -> f64 {
        indices.iter().map(|&i| self.targets[i]).sum::<f64>() / indices.len().max(1) as f64
    }

    fn is_pure(&self, indices: &[usize]) -> bool {
        let first = self.targets[indices[0]];
        indices.iter().all(|&i| (self.targets[i] - first).abs() < 1e-12)
    }

    /// Exhaustive threshold scan per candidate feature, scored by total
    /// squared-error reduction, computed with prefix sums over the sorted
    /// column.
    fn best_split(&self, indices: &[usize], rng: &mut StdRng) -> Option<(usize, f64, f64)> {
        let width = self.rows[0].len();
        let candidates: Vec<usize> = match self.features_per_split {
            Some(k) if k < width => sample_indices(width, k, rng),
            _ => (0..width).collect(),
        };

        let total_sum: f64 = indices.iter().map(|&i| self.targets[i]).sum();
        let total_sq: f64 = indices.iter().map(|&i| self.targets[i].powi(2)).sum();
        let n = indices.len() as f64;
        let parent_sse = total_sq - total_sum * total_sum / n;

        let mut best: Option<(usize, f64, f64)> = None;
        for feature in candidates {
            let mut sorted: Vec<(f64, f64)> = indices
                .iter()
                .map(|&i| (self.rows[i][feature], self.targets[i]))
                .collect();
            sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for split_at in 1..sorted.len() {
                left_sum += sorted[split_at - 1].1;
                left_sq += sorted[split_at - 1].1.powi(2);
                // No split between equal values.
                if sorted[split_at].0 <= sorted[split_at - 1].0 {
                    continue;
                }
                if split_at < self.min_samples_leaf
                    || sorted.len() - split_at < self.min_samples_leaf
                {
                    continue;
                }
                let nl = split_at as f64;
                let nr = n - nl;
                let right_sum = total_sum - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / nl)
                    + (right_sq - right_sum * right_sum / nr);
                let reduction = parent_sse - sse;
                if reduction > best.map_or(1e-12, |(_, _, r)| r) {
                    let threshold = (sorted[split_at - 1].0 + sorted[split_at].0) / 2.0;
                    best = Some((feature, threshold, reduction));
                }
            }
        }
        best
    }
}

fn sample_indices(width: usize, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..width).collect();
    for i in 0..k {
        let j = rng.gen_range(i..width);
        pool.swap(i, j);
    }
    pool.truncate(k);
    pool
}

/// Bagged regression trees over 0/1 labels with sqrt-feature subsampling;
/// the averaged leaf means are the class probability.
pub fn fit_random_forest(
    rows: &[Vec<f64>],
    labels: &[f64],
    params: ForestParams,
) -> Result<FittedModel> {
    let width = check_shape(rows, labels)?;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let features_per_split = ((width as f64).sqrt().round() as usize).max(1);
    let mut trees = Vec::with_capacity(params.n_trees);
    let mut importance = vec![0.0_f64; width];

    for _ in 0..params.n_trees {
        let sample: Vec<usize> = (0..rows.len()).map(|_| rng.gen_range(0..rows.len())).collect();
        let mut fitter = TreeFitter {
            rows,
            targets: labels,
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            features_per_split: Some(features_per_split),
            importance: vec![0.0; width],
        };
        trees.push(fitter.fit(&sample, 0, &mut rng));
        for (acc, v) in importance.iter_mut().zip(&fitter.importance) {
            *acc += v;
        }
    }

    Ok(FittedModel::RandomForest(ForestModel {
        trees,
        params,
        importance,
    }))
}

/// Gradient boosting on the logistic loss: each tree is a regression fit to
/// the residual y - sigmoid(F), added to the score with shrinkage.
pub fn fit_gradient_boost(
    rows: &[Vec<f64>],
    labels: &[f64],
    params: BoostParams,
) -> Result<FittedModel> {
    let width = check_shape(rows, labels)?;
    let pos_rate = (labels.iter().sum::<f64>() / labels.len() as f64).clamp(1e-6, 1.0 - 1e-6);
    let base_score = (pos_rate / (1.0 - pos_rate)).ln();

    let mut scores = vec![base_score; rows.len()];
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut trees = Vec::with_capacity(params.n_trees);
    let mut importance = vec![0.0_f64; width];
    let all_indices: Vec<usize> = (0..rows.len()).collect();

    for _ in 0..params.n_trees {
        let residuals: Vec<f64> = labels
            .iter()
            .zip(&scores)
            .map(|(&y, &f)| y - sigmoid(f))
            .collect();
        let mut fitter = TreeFitter {
            rows,
            targets: &residuals,
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            features_per_split: None,
            importance: vec![0.0; width],
        };
        let tree = fitter.fit(&all_indices, 0, &mut rng);
        for (acc, v) in importance.iter_mut().zip(&fitter.importance) {
            *acc += v;
        }
        for (score, row) in scores.iter_mut().zip(rows) {
            *score += params.learning_rate * tree.predict(row);
        }
        trees.push(tree);
    }

    Ok(FittedModel::GradientBoost(BoostModel {
        base_score,
        trees,
        params,
        importance,
    }))
}
