//! Prediction kinds and the numeric-vector abstraction shared by every
//! selector, diversity measure and combiner.
//!
//! Sub-model outputs are stored at `f32` precision. Anything that accumulates
//! over them (means, correlations, meta-model fitting) works in `f64`.

use crate::error::{KolosalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shape of a single prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputShape {
    /// One value per example (regression score or binary probability)
    Scalar,
    /// One score per class
    Vector,
}

/// What the ensemble predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PredictionKind {
    Regression,
    /// Scalar probability of the positive class
    BinaryClassification,
    MultiClassClassification,
}

impl PredictionKind {
    /// Output shape produced by models of this kind
    pub fn shape(self) -> OutputShape {
        match self {
            PredictionKind::Regression | PredictionKind::BinaryClassification => OutputShape::Scalar,
            PredictionKind::MultiClassClassification => OutputShape::Vector,
        }
    }

    pub fn is_classification(self) -> bool {
        !matches!(self, PredictionKind::Regression)
    }

    /// Fail fast when a kind is paired with the wrong output type.
    pub fn ensure_output<T: EnsembleOutput>(self) -> Result<()> {
        if self.shape() != T::SHAPE {
            return Err(KolosalError::InvalidArgument(format!(
                "prediction kind {} expects {:?} outputs, got {:?}",
                self,
                self.shape(),
                T::SHAPE
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PredictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PredictionKind::Regression => "regression",
            PredictionKind::BinaryClassification => "binaryClassification",
            PredictionKind::MultiClassClassification => "multiClassClassification",
        };
        f.write_str(name)
    }
}

impl FromStr for PredictionKind {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regression" => Ok(PredictionKind::Regression),
            "binaryClassification" | "binary" => Ok(PredictionKind::BinaryClassification),
            "multiClassClassification" | "multiclass" => Ok(PredictionKind::MultiClassClassification),
            other => Err(KolosalError::ConfigError(format!(
                "unknown prediction kind '{other}'"
            ))),
        }
    }
}

/// Capability set the ensemble algorithms need from a prediction value.
///
/// Implemented for `f32` (scalar kinds) and [`ClassScores`] (multiclass).
pub trait EnsembleOutput: Clone + fmt::Debug + Send + Sync + 'static {
    const SHAPE: OutputShape;

    /// Number of elements (1 for scalars, class count for vectors)
    fn dimension(&self) -> usize;

    /// Element `index` widened to `f64`
    fn value(&self, index: usize) -> f64;

    /// Add `weight * self` element-wise into `acc`, touching stored entries only.
    fn accumulate(&self, acc: &mut [f64], weight: f64);

    /// Narrow an `f64` buffer back into a prediction
    fn from_dense(values: Vec<f64>) -> Self;

    /// Class this prediction votes for
    fn predicted_class(&self) -> usize;

    /// Number of classes a vote can go to
    fn n_classes(&self) -> usize;

    /// Probability mass assigned to `class`
    fn class_probability(&self, class: usize) -> f64;

    /// Prediction that puts all of its mass on `class`
    fn one_hot(class: usize, n_classes: usize) -> Self;

    /// Append this prediction as meta-features
    fn extend_features(&self, out: &mut Vec<f64>);

    /// Check the structural invariants of a value handed over by a predictor
    /// or the serialisation layer.
    fn validate(&self) -> Result<()>;
}

impl EnsembleOutput for f32 {
    const SHAPE: OutputShape = OutputShape::Scalar;

    fn dimension(&self) -> usize {
        1
    }

    fn value(&self, _index: usize) -> f64 {
        f64::from(*self)
    }

    fn accumulate(&self, acc: &mut [f64], weight: f64) {
        acc[0] += weight * f64::from(*self);
    }

    fn from_dense(values: Vec<f64>) -> Self {
        values.first().copied().unwrap_or(0.0) as f32
    }

    fn predicted_class(&self) -> usize {
        usize::from(*self >= 0.5)
    }

    fn n_classes(&self) -> usize {
        2
    }

    fn class_probability(&self, class: usize) -> f64 {
        let p = f64::from(*self).clamp(0.0, 1.0);
        match class {
            0 => 1.0 - p,
            1 => p,
            _ => 0.0,
        }
    }

    fn one_hot(class: usize, _n_classes: usize) -> Self {
        if class == 1 {
            1.0
        } else {
            0.0
        }
    }

    fn extend_features(&self, out: &mut Vec<f64>) {
        out.push(f64::from(*self));
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-class scores of a multiclass model, dense or sparse.
///
/// Sparse indices are strictly increasing; entries that are not stored are 0.
/// Deserialisation goes through [`ClassScores::sparse`], so a decoded value
/// always holds that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClassScoresRepr")]
pub enum ClassScores {
    Dense(Vec<f32>),
    Sparse {
        len: usize,
        indices: Vec<usize>,
        values: Vec<f32>,
    },
}

impl ClassScores {
    pub fn dense(values: Vec<f32>) -> Self {
        ClassScores::Dense(values)
    }

    /// Build a sparse vector, validating index order and bounds.
    pub fn sparse(len: usize, indices: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        check_sparse(len, &indices, &values)?;
        Ok(ClassScores::Sparse { len, indices, values })
    }

    /// Class count
    pub fn len(&self) -> usize {
        match self {
            ClassScores::Dense(values) => values.len(),
            ClassScores::Sparse { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, ClassScores::Sparse { .. })
    }

    /// Score of `class`, 0 when not stored
    pub fn get(&self, class: usize) -> f32 {
        match self {
            ClassScores::Dense(values) => values.get(class).copied().unwrap_or(0.0),
            ClassScores::Sparse { indices, values, .. } => indices
                .binary_search(&class)
                .ok()
                .and_then(|pos| values.get(pos).copied())
                .unwrap_or(0.0),
        }
    }

    /// Iterate the explicitly stored `(class, score)` entries
    pub fn stored(&self) -> Stored<'_> {
        match self {
            ClassScores::Dense(values) => Stored::Dense(values.iter().enumerate()),
            ClassScores::Sparse { indices, values, .. } => {
                Stored::Sparse(indices.iter().zip(values.iter()))
            }
        }
    }

    pub fn to_dense(&self) -> Vec<f32> {
        match self {
            ClassScores::Dense(values) => values.clone(),
            ClassScores::Sparse { len, .. } => {
                let mut out = vec![0.0; *len];
                for (class, score) in self.stored() {
                    if let Some(slot) = out.get_mut(class) {
                        *slot = score;
                    }
                }
                out
            }
        }
    }

    /// Sum of all scores in `f64`
    pub fn sum(&self) -> f64 {
        self.stored().map(|(_, v)| f64::from(v)).sum()
    }

    /// Highest-scoring class; ties go to the lowest index.
    pub fn argmax(&self) -> usize {
        let mut best: Option<(usize, f32)> = None;
        for (class, score) in self.stored() {
            match best {
                Some((_, s)) if score <= s => {}
                _ => best = Some((class, score)),
            }
        }
        if let ClassScores::Sparse { len, indices, .. } = self {
            // Implicit zeros compete too.
            let first_missing = (0..*len)
                .zip(indices.iter().copied().chain(std::iter::repeat(usize::MAX)))
                .find(|(i, stored)| i != stored)
                .map(|(i, _)| i);
            if let Some(zero_class) = first_missing {
                match best {
                    Some((class, score)) if score > 0.0 || (score == 0.0 && class < zero_class) => {}
                    _ => best = Some((zero_class, 0.0)),
                }
            }
        }
        best.map(|(class, _)| class).unwrap_or(0)
    }
}

fn check_sparse(len: usize, indices: &[usize], values: &[f32]) -> Result<()> {
    if indices.len() != values.len() {
        return Err(KolosalError::InvalidArgument(format!(
            "sparse vector has {} indices but {} values",
            indices.len(),
            values.len()
        )));
    }
    if indices.windows(2).any(|w| w[0] >= w[1]) {
        return Err(KolosalError::InvalidArgument(
            "sparse indices must be strictly increasing".to_string(),
        ));
    }
    if let Some(&last) = indices.last() {
        if last >= len {
            return Err(KolosalError::InvalidArgument(format!(
                "sparse index {last} out of range for length {len}"
            )));
        }
    }
    Ok(())
}

/// Wire form of [`ClassScores`], validated on the way in
#[derive(Deserialize)]
enum ClassScoresRepr {
    Dense(Vec<f32>),
    Sparse {
        len: usize,
        indices: Vec<usize>,
        values: Vec<f32>,
    },
}

impl TryFrom<ClassScoresRepr> for ClassScores {
    type Error = KolosalError;

    fn try_from(repr: ClassScoresRepr) -> Result<Self> {
        match repr {
            ClassScoresRepr::Dense(values) => Ok(ClassScores::Dense(values)),
            ClassScoresRepr::Sparse { len, indices, values } => ClassScores::sparse(len, indices, values),
        }
    }
}

/// Iterator over stored entries of a [`ClassScores`]
pub enum Stored<'a> {
    Dense(std::iter::Enumerate<std::slice::Iter<'a, f32>>),
    Sparse(std::iter::Zip<std::slice::Iter<'a, usize>, std::slice::Iter<'a, f32>>),
}

impl Iterator for Stored<'_> {
    type Item = (usize, f32);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Stored::Dense(it) => it.next().map(|(i, &v)| (i, v)),
            Stored::Sparse(it) => it.next().map(|(&i, &v)| (i, v)),
        }
    }
}

impl From<Vec<f32>> for ClassScores {
    fn from(values: Vec<f32>) -> Self {
        ClassScores::Dense(values)
    }
}

impl EnsembleOutput for ClassScores {
    const SHAPE: OutputShape = OutputShape::Vector;

    fn dimension(&self) -> usize {
        self.len()
    }

    fn value(&self, index: usize) -> f64 {
        f64::from(self.get(index))
    }

    fn accumulate(&self, acc: &mut [f64], weight: f64) {
        for (class, score) in self.stored() {
            if let Some(slot) = acc.get_mut(class) {
                *slot += weight * f64::from(score);
            }
        }
    }

    fn from_dense(values: Vec<f64>) -> Self {
        ClassScores::Dense(values.into_iter().map(|v| v as f32).collect())
    }

    fn predicted_class(&self) -> usize {
        self.argmax()
    }

    fn n_classes(&self) -> usize {
        self.len()
    }

    fn class_probability(&self, class: usize) -> f64 {
        if class >= self.len() {
            return 0.0;
        }
        let total: f64 = self.stored().map(|(_, v)| f64::from(v.max(0.0))).sum();
        if total > 0.0 {
            f64::from(self.get(class).max(0.0)) / total
        } else {
            1.0 / self.len() as f64
        }
    }

    fn one_hot(class: usize, n_classes: usize) -> Self {
        ClassScores::Sparse {
            len: n_classes,
            indices: vec![class],
            values: vec![1.0],
        }
    }

    fn extend_features(&self, out: &mut Vec<f64>) {
        let start = out.len();
        out.resize(start + self.len(), 0.0);
        self.accumulate(&mut out[start..], 1.0);
    }

    fn validate(&self) -> Result<()> {
        match self {
            ClassScores::Dense(_) => Ok(()),
            ClassScores::Sparse { len, indices, values } => check_sparse(*len, indices, values),
        }
    }
}
