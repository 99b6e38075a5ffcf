//! Pairwise diversity between sub-models on the shared held-out set.
//!
//! Every measure returns one [`ModelDiversity`] per unordered pair `(i, j)`
//! with `i` before `j` in the order the models were given, so downstream
//! ranking is deterministic. Higher values mean more diverse.

use super::cache::PredictionTable;
use super::output::{EnsembleOutput, OutputShape, PredictionKind};
use crate::error::{KolosalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Diversity score for one pair of pool models
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelDiversity {
    /// Pool index of the first model
    pub model_x: usize,
    /// Pool index of the second model
    pub model_y: usize,
    /// Non-negative; higher is more diverse
    pub diversity: f64,
}

/// Strategy scoring how differently two or more models predict
pub trait DiversityMeasure<T: EnsembleOutput>: Send + Sync {
    /// Diversity of a single pair of prediction sequences
    fn pair(&self, a: &[T], b: &[T]) -> Result<f64>;

    /// Score every pair among `models` (pool indices into `table`)
    fn compute(&self, models: &[usize], table: &PredictionTable<T>) -> Result<Vec<ModelDiversity>> {
        if models.len() < 2 {
            return Err(KolosalError::InvalidArgument(format!(
                "diversity needs at least 2 models, got {}",
                models.len()
            )));
        }
        let predictions = models
            .iter()
            .map(|&m| table.model(m))
            .collect::<Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(models.len() * (models.len() - 1) / 2);
        for i in 0..models.len() {
            for j in (i + 1)..models.len() {
                let diversity = self.pair(predictions[i], predictions[j])?;
                if !diversity.is_finite() {
                    return Err(KolosalError::InvalidArgument(format!(
                        "diversity between models {} and {} is {diversity}",
                        models[i], models[j]
                    )));
                }
                records.push(ModelDiversity {
                    model_x: models[i],
                    model_y: models[j],
                    diversity,
                });
            }
        }
        Ok(records)
    }
}

/// Diversity metric named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiversityMetric {
    /// Regression: mean absolute difference. Classification: fraction of
    /// examples whose predicted class differs.
    #[default]
    Disagreement,
    /// `1 - pearson(a, b)` over all stored elements
    Correlation,
    /// Mean total-variation distance between normalised class scores
    Divergence,
}

impl DiversityMetric {
    pub fn supports(self, kind: PredictionKind) -> bool {
        match self {
            DiversityMetric::Disagreement | DiversityMetric::Correlation => true,
            DiversityMetric::Divergence => kind.shape() == OutputShape::Vector,
        }
    }

    /// Instantiate the measure for `kind`
    pub fn measure<T: EnsembleOutput>(self, kind: PredictionKind) -> Result<Box<dyn DiversityMeasure<T>>> {
        kind.ensure_output::<T>()?;
        if !self.supports(kind) {
            return Err(KolosalError::ConfigError(format!(
                "diversity metric {self} is not available for {kind}"
            )));
        }
        Ok(match self {
            DiversityMetric::Disagreement => Box::new(Disagreement::new(kind)),
            DiversityMetric::Correlation => Box::new(CorrelationDistance),
            DiversityMetric::Divergence => Box::new(Divergence),
        })
    }
}

impl fmt::Display for DiversityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiversityMetric::Disagreement => "disagreement",
            DiversityMetric::Correlation => "correlation",
            DiversityMetric::Divergence => "divergence",
        };
        f.write_str(name)
    }
}

impl FromStr for DiversityMetric {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disagreement" => Ok(DiversityMetric::Disagreement),
            "correlation" => Ok(DiversityMetric::Correlation),
            "divergence" => Ok(DiversityMetric::Divergence),
            other => Err(KolosalError::ConfigError(format!(
                "unknown diversity metric '{other}'"
            ))),
        }
    }
}

fn check_pair<T: EnsembleOutput>(a: &[T], b: &[T]) -> Result<()> {
    if a.len() != b.len() {
        return Err(KolosalError::InvalidArgument(format!(
            "prediction sequences differ in length: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    if a.is_empty() {
        return Err(KolosalError::InvalidArgument(
            "diversity needs at least one evaluation example".to_string(),
        ));
    }
    for p in a.iter().chain(b) {
        p.validate()?;
    }
    if let Some((x, y)) = a.iter().zip(b).find(|(x, y)| x.dimension() != y.dimension()) {
        return Err(KolosalError::InvalidArgument(format!(
            "class cardinality mismatch: {} vs {}",
            x.dimension(),
            y.dimension()
        )));
    }
    Ok(())
}

/// Disagreement between two models
#[derive(Debug, Clone, Copy)]
pub struct Disagreement {
    kind: PredictionKind,
}

impl Disagreement {
    pub fn new(kind: PredictionKind) -> Self {
        Self { kind }
    }
}

impl<T: EnsembleOutput> DiversityMeasure<T> for Disagreement {
    fn pair(&self, a: &[T], b: &[T]) -> Result<f64> {
        check_pair(a, b)?;
        let n = a.len() as f64;
        let total: f64 = match self.kind {
            PredictionKind::Regression => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x.value(0) - y.value(0)).abs())
                .sum(),
            _ => a
                .iter()
                .zip(b)
                .filter(|(x, y)| x.predicted_class() != y.predicted_class())
                .count() as f64,
        };
        Ok(total / n)
    }
}

/// Streaming co-moment accumulator (Welford) for Pearson correlation
#[derive(Debug, Default, Clone, Copy)]
struct CoMoments {
    n: f64,
    mean_x: f64,
    mean_y: f64,
    m2_x: f64,
    m2_y: f64,
    c_xy: f64,
}

impl CoMoments {
    fn push(&mut self, x: f64, y: f64) {
        self.n += 1.0;
        let dx = x - self.mean_x;
        self.mean_x += dx / self.n;
        let dy = y - self.mean_y;
        self.mean_y += dy / self.n;
        self.m2_x += dx * (x - self.mean_x);
        self.m2_y += dy * (y - self.mean_y);
        self.c_xy += dx * (y - self.mean_y);
    }

    fn correlation(&self) -> Option<f64> {
        if self.m2_x <= 0.0 || self.m2_y <= 0.0 {
            return None;
        }
        Some((self.c_xy / (self.m2_x.sqrt() * self.m2_y.sqrt())).clamp(-1.0, 1.0))
    }
}

/// `1 - pearson` distance, in `[0, 2]`
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationDistance;

impl<T: EnsembleOutput> DiversityMeasure<T> for CorrelationDistance {
    fn pair(&self, a: &[T], b: &[T]) -> Result<f64> {
        check_pair(a, b)?;
        let mut moments = CoMoments::default();
        let mut identical = true;
        for (x, y) in a.iter().zip(b) {
            for k in 0..x.dimension() {
                let (vx, vy) = (x.value(k), y.value(k));
                identical &= vx == vy;
                moments.push(vx, vy);
            }
        }
        Ok(match moments.correlation() {
            Some(r) => 1.0 - r,
            // A constant series has no correlation to speak of.
            None if identical => 0.0,
            None => 1.0,
        })
    }
}

/// Mean total-variation distance between class distributions
#[derive(Debug, Clone, Copy, Default)]
pub struct Divergence;

impl<T: EnsembleOutput> DiversityMeasure<T> for Divergence {
    fn pair(&self, a: &[T], b: &[T]) -> Result<f64> {
        check_pair(a, b)?;
        let total: f64 = a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let l1: f64 = (0..x.n_classes())
                    .map(|c| (x.class_probability(c) - y.class_probability(c)).abs())
                    .sum();
                0.5 * l1
            })
            .sum();
        Ok(total / a.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::ClassScores;

    fn scalar_table(rows: Vec<Vec<f32>>) -> PredictionTable<f32> {
        let n = rows[0].len();
        PredictionTable::new(rows, vec![0.0; n]).unwrap()
    }

    #[test]
    fn test_regression_disagreement_is_mean_abs_diff() {
        let d = Disagreement::new(PredictionKind::Regression);
        let v = DiversityMeasure::<f32>::pair(&d, &[1.0, 2.0, 3.0], &[2.0, 2.0, 5.0]).unwrap();
        assert!((v - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_binary_disagreement_counts_class_flips() {
        let d = Disagreement::new(PredictionKind::BinaryClassification);
        let v = DiversityMeasure::<f32>::pair(&d, &[0.9, 0.1, 0.6, 0.4], &[0.8, 0.7, 0.2, 0.3]).unwrap();
        assert!((v - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_multiclass_disagreement_uses_argmax() {
        let d = Disagreement::new(PredictionKind::MultiClassClassification);
        let a = vec![ClassScores::dense(vec![0.7, 0.3]), ClassScores::dense(vec![0.1, 0.9])];
        let b = vec![
            ClassScores::sparse(2, vec![0], vec![1.0]).unwrap(),
            ClassScores::sparse(2, vec![0], vec![1.0]).unwrap(),
        ];
        assert!((d.pair(&a, &b).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_multiclass_cardinality_mismatch() {
        let d = Disagreement::new(PredictionKind::MultiClassClassification);
        let a = vec![ClassScores::dense(vec![0.7, 0.3])];
        let b = vec![ClassScores::dense(vec![0.7, 0.2, 0.1])];
        assert!(matches!(d.pair(&a, &b), Err(KolosalError::InvalidArgument(_))));
    }

    #[test]
    fn test_correlation_distance() {
        let c = CorrelationDistance;
        let up = [1.0f32, 2.0, 3.0, 4.0];
        let down = [4.0f32, 3.0, 2.0, 1.0];
        assert!(DiversityMeasure::<f32>::pair(&c, &up, &up).unwrap().abs() < 1e-9);
        assert!((DiversityMeasure::<f32>::pair(&c, &up, &down).unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(DiversityMeasure::<f32>::pair(&c, &[1.0, 1.0], &[1.0, 1.0]).unwrap(), 0.0);
        assert_eq!(DiversityMeasure::<f32>::pair(&c, &[1.0, 1.0], &[1.0, 2.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_correlation_is_stable_with_large_offsets() {
        let c = CorrelationDistance;
        let a: Vec<f32> = (0..1000).map(|i| 1.0e6 + (i % 7) as f32).collect();
        let b = a.clone();
        assert!(DiversityMeasure::<f32>::pair(&c, &a, &b).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_divergence() {
        let a = vec![ClassScores::dense(vec![1.0, 0.0])];
        let b = vec![ClassScores::dense(vec![0.0, 1.0])];
        assert!((Divergence.pair(&a, &b).unwrap() - 1.0).abs() < 1e-9);
        assert!(Divergence.pair(&a, &a).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_compute_orders_pairs() {
        let table = scalar_table(vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![3.0, 3.0]]);
        let d = Disagreement::new(PredictionKind::Regression);
        let records = d.compute(&[2, 0, 1], &table).unwrap();
        let pairs: Vec<(usize, usize)> = records.iter().map(|r| (r.model_x, r.model_y)).collect();
        assert_eq!(pairs, vec![(2, 0), (2, 1), (0, 1)]);
        assert!((records[0].diversity - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_requires_two_models() {
        let table = scalar_table(vec![vec![0.0]]);
        let d = Disagreement::new(PredictionKind::Regression);
        assert!(matches!(d.compute(&[0], &table), Err(KolosalError::InvalidArgument(_))));
        assert!(matches!(d.compute(&[0, 4], &table), Err(KolosalError::InvalidArgument(_))));
    }

    #[test]
    fn test_compute_rejects_non_finite_diversity() {
        let table = scalar_table(vec![vec![0.0, 1.0], vec![f32::NAN, 1.0], vec![2.0, 2.0]]);
        let d = Disagreement::new(PredictionKind::Regression);
        assert!(matches!(d.compute(&[0, 1, 2], &table), Err(KolosalError::InvalidArgument(_))));
        assert!(matches!(
            CorrelationDistance.compute(&[0, 1], &table),
            Err(KolosalError::InvalidArgument(_))
        ));
        assert!(d.compute(&[0, 2], &table).is_ok());
    }

    #[test]
    fn test_pair_rejects_malformed_sparse() {
        let a = vec![ClassScores::dense(vec![0.5, 0.5])];
        let b = vec![ClassScores::Sparse {
            len: 2,
            indices: vec![5],
            values: vec![1.0],
        }];
        assert!(matches!(Divergence.pair(&a, &b), Err(KolosalError::InvalidArgument(_))));
    }

    #[test]
    fn test_metric_support() {
        assert!(DiversityMetric::Divergence
            .measure::<f32>(PredictionKind::Regression)
            .is_err());
        assert!(DiversityMetric::Divergence
            .measure::<ClassScores>(PredictionKind::MultiClassClassification)
            .is_ok());
        assert!(DiversityMetric::Disagreement
            .measure::<ClassScores>(PredictionKind::Regression)
            .is_err());
        assert_eq!("correlation".parse::<DiversityMetric>().unwrap(), DiversityMetric::Correlation);
    }
}
