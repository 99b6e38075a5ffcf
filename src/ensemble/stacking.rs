//! Stacking combiner: a linear meta-model over the retained models' outputs
//!
//! The meta-model is fitted once, on the held-out predictions of the
//! retained models, and is read-only afterwards. Regression uses ridge
//! least squares, binary classification an L2-regularised logistic model,
//! and multiclass one ridge head per class over one-hot targets.

use super::cache::PredictionTable;
use super::combiner::OutputCombiner;
use super::output::{EnsembleOutput, PredictionKind};
use crate::config::StackingConfig;
use crate::error::{KolosalError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Pivot magnitude below which Gauss-Jordan treats the system as singular
const SINGULAR_PIVOT: f64 = 1e-10;

/// Solve `a x = b` for symmetric positive-definite `a` by Cholesky.
///
/// A non-positive pivot triggers one retry with a small diagonal jitter.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }
    let jitter = 1e-8 * a.diag().iter().map(|v| v.abs()).sum::<f64>() / n.max(1) as f64;

    'attempt: for ridge in [0.0, jitter] {
        let mut l = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l[[i, k]] * l[[j, k]];
                }
                if i == j {
                    let diag = a[[i, i]] + ridge - sum;
                    if diag <= 0.0 {
                        continue 'attempt;
                    }
                    l[[i, i]] = diag.sqrt();
                } else {
                    l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
                }
            }
        }

        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let sum: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
            y[i] = (b[i] - sum) / l[[i, i]];
        }
        let mut x = Array1::<f64>::zeros(n);
        for i in (0..n).rev() {
            let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
            x[i] = (y[i] - sum) / l[[i, i]];
        }
        return Some(x);
    }
    None
}

/// Gauss-Jordan elimination with partial pivoting on `[a | b]`
fn gauss_jordan_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut aug = Array2::<f64>::zeros((n, n + 1));
    aug.slice_mut(ndarray::s![.., ..n]).assign(a);
    aug.column_mut(n).assign(b);

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&r, &s| aug[[r, col]].abs().total_cmp(&aug[[s, col]].abs()))?;
        if aug[[pivot_row, col]].abs() < SINGULAR_PIVOT {
            return None;
        }
        if pivot_row != col {
            for j in 0..=n {
                aug.swap([col, j], [pivot_row, j]);
            }
        }
        let pivot = aug[[col, col]];
        aug.row_mut(col).mapv_inplace(|v| v / pivot);
        for row in 0..n {
            if row != col {
                let factor = aug[[row, col]];
                if factor != 0.0 {
                    for j in 0..=n {
                        aug[[row, j]] -= factor * aug[[col, j]];
                    }
                }
            }
        }
    }
    Some(aug.column(n).to_owned())
}

/// One linear output of the meta-model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearHead {
    coefficients: Array1<f64>,
    intercept: f64,
}

impl LinearHead {
    fn decision(&self, x: ArrayView1<'_, f64>) -> f64 {
        self.coefficients.dot(&x) + self.intercept
    }

    /// Ridge least squares with an unpenalised intercept
    fn fit_ridge(x: &Array2<f64>, y: &Array1<f64>, alpha: f64) -> Result<Self> {
        let x_mean = x.mean_axis(Axis(0)).ok_or_else(|| {
            KolosalError::InvalidArgument("stacking needs at least one held-out example".to_string())
        })?;
        let y_mean = y.mean().unwrap_or(0.0);
        let x_c = x - &x_mean.view().insert_axis(Axis(0));
        let y_c = y - y_mean;

        let mut xtx = x_c.t().dot(&x_c);
        for i in 0..xtx.nrows() {
            xtx[[i, i]] += alpha;
        }
        let xty = x_c.t().dot(&y_c);

        let coefficients = cholesky_solve(&xtx, &xty)
            .or_else(|| gauss_jordan_solve(&xtx, &xty))
            .ok_or_else(|| {
                KolosalError::ComputationError(
                    "stacking meta-model system is singular; increase stacking.alpha".to_string(),
                )
            })?;
        let intercept = y_mean - coefficients.dot(&x_mean);
        Ok(Self {
            coefficients,
            intercept,
        })
    }

    /// L2-regularised logistic regression by batch gradient descent
    fn fit_logistic(x: &Array2<f64>, y: &Array1<f64>, config: &StackingConfig) -> Self {
        let n_samples = x.nrows() as f64;
        let mut weights = Array1::<f64>::zeros(x.ncols());
        let mut bias = 0.0;

        for _ in 0..config.max_iter {
            let probs = (x.dot(&weights) + bias).mapv(sigmoid);
            let errors = &probs - y;
            let dw = x.t().dot(&errors) / n_samples + config.alpha * &weights;
            let db = errors.mean().unwrap_or(0.0);

            let grad_norm = (dw.mapv(|v| v * v).sum() + db * db).sqrt();
            if grad_norm < config.tol {
                break;
            }
            weights = weights - config.learning_rate * dw;
            bias -= config.learning_rate * db;
        }
        Self {
            coefficients: weights,
            intercept: bias,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Combiner feeding the concatenated retained predictions to a fitted meta-model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackingCombiner {
    prediction_kind: PredictionKind,
    n_models: usize,
    /// Elements contributed by each model's prediction
    width: usize,
    heads: Vec<LinearHead>,
}

impl StackingCombiner {
    /// Fit the meta-model on the held-out predictions of `retained`
    pub fn fit<T: EnsembleOutput>(
        kind: PredictionKind,
        config: &StackingConfig,
        table: &PredictionTable<T>,
        retained: &[usize],
    ) -> Result<Self> {
        kind.ensure_output::<T>()?;
        if retained.is_empty() {
            return Err(KolosalError::InvalidArgument(
                "stacking needs at least one retained model".to_string(),
            ));
        }
        let n_examples = table.n_examples();
        if n_examples == 0 {
            return Err(KolosalError::InvalidArgument(
                "stacking needs at least one held-out example".to_string(),
            ));
        }

        let columns = retained
            .iter()
            .map(|&i| table.model(i))
            .collect::<Result<Vec<_>>>()?;
        let width = columns[0][0].dimension();
        let mut data = Vec::with_capacity(n_examples * retained.len() * width);
        for e in 0..n_examples {
            for column in &columns {
                let p = &column[e];
                if p.dimension() != width {
                    return Err(KolosalError::InvalidArgument(format!(
                        "held-out prediction {e} has dimension {} but expected {width}",
                        p.dimension()
                    )));
                }
                p.extend_features(&mut data);
            }
        }
        let x = Array2::from_shape_vec((n_examples, retained.len() * width), data)?;
        let labels: Array1<f64> = table.labels().iter().map(|&l| f64::from(l)).collect();

        let heads = match kind {
            PredictionKind::Regression => vec![LinearHead::fit_ridge(&x, &labels, config.alpha)?],
            PredictionKind::BinaryClassification => {
                let targets = labels.mapv(|l| if l >= 0.5 { 1.0 } else { 0.0 });
                vec![LinearHead::fit_logistic(&x, &targets, config)]
            }
            PredictionKind::MultiClassClassification => (0..width)
                .map(|class| {
                    let targets = labels.mapv(|l| if l.round() as usize == class { 1.0 } else { 0.0 });
                    LinearHead::fit_ridge(&x, &targets, config.alpha)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        tracing::debug!(
            kind = %kind,
            n_models = retained.len(),
            n_features = x.ncols(),
            n_examples,
            "Fitted stacking meta-model"
        );
        Ok(Self {
            prediction_kind: kind,
            n_models: retained.len(),
            width,
            heads,
        })
    }

    pub fn kind(&self) -> PredictionKind {
        self.prediction_kind
    }

    /// Number of retained models the meta-model expects
    pub fn n_models(&self) -> usize {
        self.n_models
    }
}

impl<T: EnsembleOutput> OutputCombiner<T> for StackingCombiner {
    fn combine(&self, predictions: &[T]) -> Result<T> {
        if predictions.len() != self.n_models {
            return Err(KolosalError::InvalidArgument(format!(
                "stacking meta-model expects {} predictions, got {}",
                self.n_models,
                predictions.len()
            )));
        }
        let mut features = Vec::with_capacity(self.n_models * self.width);
        for (i, p) in predictions.iter().enumerate() {
            p.validate()
                .map_err(|e| KolosalError::InvalidArgument(format!("prediction {i}: {e}")))?;
            if p.dimension() != self.width {
                return Err(KolosalError::InvalidArgument(format!(
                    "prediction {i} has dimension {} but the meta-model expects {}",
                    p.dimension(),
                    self.width
                )));
            }
            p.extend_features(&mut features);
        }

        let x = ArrayView1::from(features.as_slice());
        let outputs = self
            .heads
            .iter()
            .map(|head| {
                let z = head.decision(x);
                if self.prediction_kind == PredictionKind::BinaryClassification {
                    sigmoid(z)
                } else {
                    z
                }
            })
            .collect();
        Ok(T::from_dense(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::ClassScores;
    use ndarray::array;

    fn config() -> StackingConfig {
        StackingConfig {
            alpha: 1e-6,
            ..StackingConfig::default()
        }
    }

    #[test]
    fn test_solvers_agree() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let chol = cholesky_solve(&a, &b).unwrap();
        let gj = gauss_jordan_solve(&a, &b).unwrap();
        assert!((&chol - &gj).mapv(f64::abs).sum() < 1e-10);
        assert!((a.dot(&chol) - &b).mapv(f64::abs).sum() < 1e-10);
    }

    #[test]
    fn test_singular_system() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 2.0];
        assert!(gauss_jordan_solve(&a, &b).is_none());
    }

    #[test]
    fn test_regression_meta_model_follows_accurate_model() {
        let table = PredictionTable::new(
            vec![vec![1.0f32, 2.0, 3.0, 4.0, 5.0], vec![5.0, 1.0, 4.0, 2.0, 3.0]],
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap();
        let stack = StackingCombiner::fit(PredictionKind::Regression, &config(), &table, &[0, 1]).unwrap();
        let out = stack.combine(&[3.0f32, 4.0]).unwrap();
        assert!((out - 3.0).abs() < 1e-3, "got {out}");
    }

    #[test]
    fn test_binary_meta_model() {
        let table = PredictionTable::new(
            vec![vec![0.9f32, 0.1, 0.8, 0.2], vec![0.5, 0.5, 0.5, 0.5]],
            vec![1.0, 0.0, 1.0, 0.0],
        )
        .unwrap();
        let stack = StackingCombiner::fit(
            PredictionKind::BinaryClassification,
            &StackingConfig::default(),
            &table,
            &[0, 1],
        )
        .unwrap();
        let high = stack.combine(&[0.9f32, 0.5]).unwrap();
        let low = stack.combine(&[0.1f32, 0.5]).unwrap();
        assert!(high > 0.5 && low < 0.5, "high={high} low={low}");
    }

    #[test]
    fn test_multiclass_meta_model() {
        let labels = vec![0.0f32, 1.0, 2.0, 0.0, 1.0, 2.0];
        let accurate: Vec<ClassScores> = labels
            .iter()
            .map(|&l| ClassScores::one_hot(l as usize, 3))
            .collect();
        let uniform = vec![ClassScores::dense(vec![1.0 / 3.0; 3]); labels.len()];
        let table = PredictionTable::new(vec![accurate, uniform], labels).unwrap();

        let stack = StackingCombiner::fit(
            PredictionKind::MultiClassClassification,
            &StackingConfig::default(),
            &table,
            &[0, 1],
        )
        .unwrap();
        let out = stack
            .combine(&[ClassScores::one_hot(2, 3), ClassScores::dense(vec![1.0 / 3.0; 3])])
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out.argmax(), 2);
    }

    #[test]
    fn test_rejects_malformed_sparse_prediction() {
        let labels = vec![0.0f32, 1.0];
        let preds: Vec<ClassScores> = labels.iter().map(|&l| ClassScores::one_hot(l as usize, 2)).collect();
        let table = PredictionTable::new(vec![preds.clone(), preds], labels).unwrap();
        let stack = StackingCombiner::fit(
            PredictionKind::MultiClassClassification,
            &StackingConfig::default(),
            &table,
            &[0, 1],
        )
        .unwrap();
        let malformed = ClassScores::Sparse {
            len: 2,
            indices: vec![1, 0],
            values: vec![0.5, 0.5],
        };
        assert!(matches!(
            stack.combine(&[ClassScores::one_hot(0, 2), malformed]),
            Err(KolosalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_arity_is_fixed() {
        let table = PredictionTable::new(vec![vec![1.0f32, 2.0], vec![2.0, 1.0]], vec![1.0, 2.0]).unwrap();
        let stack = StackingCombiner::fit(PredictionKind::Regression, &config(), &table, &[1, 0]).unwrap();
        assert_eq!(stack.n_models(), 2);
        assert!(matches!(
            stack.combine(&[1.0f32]),
            Err(KolosalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_output_type() {
        let table = PredictionTable::new(vec![vec![1.0f32]], vec![1.0]).unwrap();
        assert!(StackingCombiner::fit(
            PredictionKind::MultiClassClassification,
            &config(),
            &table,
            &[0]
        )
        .is_err());
    }

    #[test]
    fn test_serde_keeps_fitted_state() {
        let table = PredictionTable::new(
            vec![vec![1.0f32, 2.0, 3.0], vec![0.0, 1.0, 0.0]],
            vec![1.5, 2.5, 3.5],
        )
        .unwrap();
        let stack = StackingCombiner::fit(PredictionKind::Regression, &config(), &table, &[0, 1]).unwrap();
        let json = serde_json::to_string(&stack).unwrap();
        let back: StackingCombiner = serde_json::from_str(&json).unwrap();
        let a: f32 = stack.combine(&[2.0f32, 1.0]).unwrap();
        let b: f32 = back.combine(&[2.0f32, 1.0]).unwrap();
        assert!((a - b).abs() < 1e-6);
    }
}
