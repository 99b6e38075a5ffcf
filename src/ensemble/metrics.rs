//! Held-out quality metrics used to rank sub-models

use super::output::{EnsembleOutput, PredictionKind};
use crate::error::{KolosalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LOG_LOSS_EPS: f64 = 1e-15;

/// Metric used to rank sub-models on the held-out set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityMetric {
    /// Mean absolute error
    L1,
    /// Mean squared error
    L2,
    /// Root mean squared error
    Rmse,
    /// Fraction of examples whose predicted class matches the label
    Accuracy,
    /// Mean negative log-likelihood of the label
    LogLoss,
}

impl QualityMetric {
    /// Metric used when the configuration does not name one
    pub fn default_for(kind: PredictionKind) -> Self {
        match kind {
            PredictionKind::Regression => QualityMetric::L1,
            PredictionKind::BinaryClassification | PredictionKind::MultiClassClassification => {
                QualityMetric::Accuracy
            }
        }
    }

    pub fn higher_is_better(self) -> bool {
        matches!(self, QualityMetric::Accuracy)
    }

    pub fn supports(self, kind: PredictionKind) -> bool {
        match self {
            QualityMetric::L1 | QualityMetric::L2 | QualityMetric::Rmse => {
                kind == PredictionKind::Regression
            }
            QualityMetric::Accuracy | QualityMetric::LogLoss => kind.is_classification(),
        }
    }

    /// Score one model's predictions against the labels
    pub fn score<T: EnsembleOutput>(self, predictions: &[T], labels: &[f32]) -> Result<f64> {
        if predictions.len() != labels.len() {
            return Err(KolosalError::ShapeError {
                expected: format!("{} predictions", labels.len()),
                actual: format!("{} predictions", predictions.len()),
            });
        }
        if labels.is_empty() {
            return Err(KolosalError::InvalidArgument(
                "cannot score a model on an empty evaluation set".to_string(),
            ));
        }
        let n = labels.len() as f64;
        let pairs = predictions.iter().zip(labels.iter().map(|&l| f64::from(l)));

        let score = match self {
            QualityMetric::L1 => pairs.map(|(p, y)| (p.value(0) - y).abs()).sum::<f64>() / n,
            QualityMetric::L2 => pairs.map(|(p, y)| (p.value(0) - y).powi(2)).sum::<f64>() / n,
            QualityMetric::Rmse => {
                (pairs.map(|(p, y)| (p.value(0) - y).powi(2)).sum::<f64>() / n).sqrt()
            }
            QualityMetric::Accuracy => {
                let correct = pairs
                    .filter(|(p, y)| p.predicted_class() as f64 == y.round())
                    .count();
                correct as f64 / n
            }
            QualityMetric::LogLoss => {
                pairs
                    .map(|(p, y)| {
                        let prob = p.class_probability(y.round().max(0.0) as usize);
                        -prob.clamp(LOG_LOSS_EPS, 1.0).ln()
                    })
                    .sum::<f64>()
                    / n
            }
        };
        Ok(score)
    }

    /// `true` when `a` ranks strictly ahead of `b`
    pub fn is_better(self, a: f64, b: f64) -> bool {
        if self.higher_is_better() {
            a > b
        } else {
            a < b
        }
    }

    /// Order two scores best-first. Total, so NaN never breaks a sort.
    pub fn compare(self, a: f64, b: f64) -> std::cmp::Ordering {
        let ord = a.total_cmp(&b);
        if self.higher_is_better() {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl fmt::Display for QualityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityMetric::L1 => "l1",
            QualityMetric::L2 => "l2",
            QualityMetric::Rmse => "rmse",
            QualityMetric::Accuracy => "accuracy",
            QualityMetric::LogLoss => "logLoss",
        };
        f.write_str(name)
    }
}

impl FromStr for QualityMetric {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "l1" | "mae" => Ok(QualityMetric::L1),
            "l2" | "mse" => Ok(QualityMetric::L2),
            "rmse" => Ok(QualityMetric::Rmse),
            "accuracy" => Ok(QualityMetric::Accuracy),
            "logLoss" | "logloss" => Ok(QualityMetric::LogLoss),
            other => Err(KolosalError::ConfigError(format!(
                "unknown quality metric '{other}'"
            ))),
        }
    }
}
