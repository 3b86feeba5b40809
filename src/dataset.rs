//! Training-set construction: join feature vectors to market lines, derive
//! labels, and fit the impute/scale/encode transform that serving replays.

use std::collections::HashMap;

use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureVector, numeric_feature_names};
use crate::gamelog::{HomeAway, MarketLine, dedup_latest_lines};

/// Name of the synthesized numeric column carrying the bookmaker line.
pub const POINT_LINE_COLUMN: &str = "point_line";
/// One-hot output for the home/away category, first category (away) dropped.
pub const HOME_ONEHOT_COLUMN: &str = "home_away_home";

/// One labeled row: a feature vector matched to a line, with the binary
/// outcome (1.0 when realized points reached the line).
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub player_id: i64,
    pub game_date: NaiveDate,
    pub values: Vec<f64>,
    pub home_away: HomeAway,
    pub line: f64,
    pub label: f64,
}

/// Inner-join feature vectors to deduplicated market lines on
/// (player_id, game_date). Vectors without a line, lines without a vector,
/// and vectors without a realized outcome are all dropped silently.
pub fn build_training_set(
    vectors: &[FeatureVector],
    lines: Vec<MarketLine>,
) -> Vec<TrainingExample> {
    let lines = dedup_latest_lines(lines);
    let by_key: HashMap<(i64, NaiveDate), f64> = lines
        .into_iter()
        .map(|l| ((l.player_id, l.game_date), l.line))
        .collect();

    let mut out = Vec::new();
    for v in vectors {
        let Some(&line) = by_key.get(&(v.player_id, v.game_date)) else {
            continue;
        };
        let Some(points) = v.realized_points else {
            continue;
        };
        out.push(TrainingExample {
            player_id: v.player_id,
            game_date: v.game_date,
            values: v.values.clone(),
            home_away: v.home_away,
            line,
            label: if points >= line { 1.0 } else { 0.0 },
        });
    }
    out
}

/// Fitted impute-and-standardize transform over the numeric columns plus the
/// one-hot home/away encoding. Fit once on the training split and persisted
/// in the artifact; serving replays the identical column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocessor {
    /// Numeric input columns in order: the shared feature names, then
    /// [`POINT_LINE_COLUMN`].
    pub numeric_columns: Vec<String>,
    pub medians: Vec<f64>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    /// Output columns in model order: standardized numerics, then
    /// [`HOME_ONEHOT_COLUMN`].
    pub output_columns: Vec<String>,
}

const STD_FLOOR: f64 = 1e-6;

impl Preprocessor {
    pub fn fit(examples: &[TrainingExample]) -> Result<Self> {
        if examples.is_empty() {
            bail!("cannot fit preprocessor on an empty training set");
        }
        let mut numeric_columns = numeric_feature_names();
        numeric_columns.push(POINT_LINE_COLUMN.to_string());
        let width = numeric_columns.len();

        let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(examples.len()); width];
        for ex in examples {
            for (j, &v) in numeric_row(ex).iter().enumerate() {
                columns[j].push(v);
            }
        }

        let mut medians = Vec::with_capacity(width);
        let mut means = Vec::with_capacity(width);
        let mut stds = Vec::with_capacity(width);
        for col in &columns {
            let median = finite_median(col);
            let filled: Vec<f64> = col
                .iter()
                .map(|&v| if v.is_finite() { v } else { median })
                .collect();
            let mean = filled.iter().sum::<f64>() / filled.len() as f64;
            let var = filled.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
                / filled.len() as f64;
            medians.push(median);
            means.push(mean);
            stds.push(var.sqrt().max(STD_FLOOR));
        }

        let mut output_columns = numeric_columns.clone();
        output_columns.push(HOME_ONEHOT_COLUMN.to_string());

        Ok(Self {
            numeric_columns,
            medians,
            means,
            stds,
            output_columns,
        })
    }

    /// Transform one row into model input, in the fitted column order.
    pub fn transform_row(&self, values: &[f64], line: f64, home_away: HomeAway) -> Vec<f64> {
        let mut raw: Vec<f64> = Vec::with_capacity(self.numeric_columns.len());
        raw.extend_from_slice(values);
        raw.push(line);
        // Schema completeness: absent trailing columns come in as missing.
        raw.resize(self.numeric_columns.len(), f64::NAN);

        let mut out: Vec<f64> = raw
            .iter()
            .enumerate()
            .map(|(j, &v)| {
                let v = if v.is_finite() { v } else { self.medians[j] };
                (v - self.means[j]) / self.stds[j]
            })
            .collect();
        out.push(match home_away {
            HomeAway::Home => 1.0,
            HomeAway::Away => 0.0,
        });
        out
    }

    pub fn transform(&self, examples: &[TrainingExample]) -> TrainingMatrix {
        let rows = examples
            .iter()
            .map(|ex| self.transform_row(&ex.values, ex.line, ex.home_away))
            .collect();
        TrainingMatrix {
            rows,
            labels: examples.iter().map(|ex| ex.label).collect(),
            player_ids: examples.iter().map(|ex| ex.player_id).collect(),
        }
    }
}

fn numeric_row(ex: &TrainingExample) -> Vec<f64> {
    let mut row = ex.values.clone();
    row.push(ex.line);
    row
}

fn finite_median(col: &[f64]) -> f64 {
    let mut finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = finite.len();
    if n % 2 == 1 {
        finite[n / 2]
    } else {
        (finite[n / 2 - 1] + finite[n / 2]) / 2.0
    }
}

/// Preprocessed model input. `player_ids` is carried for traceability only
/// and is never part of `rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMatrix {
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
    pub player_ids: Vec<i64>,
}

impl TrainingMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn select(&self, indices: &[usize]) -> TrainingMatrix {
        TrainingMatrix {
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            player_ids: indices.iter().map(|&i| self.player_ids[i]).collect(),
        }
    }
}
