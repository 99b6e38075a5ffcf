//! Trained sub-models and the feature subsets they were trained on

use super::output::EnsembleOutput;
use crate::error::{KolosalError, Result};
use ndarray::{ArrayView1, Axis, CowArray, Ix1};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trained base model producing one prediction per input row
pub trait Predictor: Send + Sync {
    type Output: EnsembleOutput;

    /// Predict a single row already projected onto this model's features
    fn predict(&self, features: ArrayView1<'_, f64>) -> Result<Self::Output>;
}

/// Owned, type-erased predictor as stored in the pool
pub type BoxedPredictor<T> = Box<dyn Predictor<Output = T>>;

impl<T: EnsembleOutput> Predictor for BoxedPredictor<T> {
    type Output = T;

    fn predict(&self, features: ArrayView1<'_, f64>) -> Result<T> {
        (**self).predict(features)
    }
}

/// Adapter turning a closure into a [`Predictor`]
pub struct FnPredictor<F, T> {
    f: F,
    _output: std::marker::PhantomData<fn() -> T>,
}

impl<F, T> FnPredictor<F, T>
where
    F: Fn(ArrayView1<'_, f64>) -> Result<T> + Send + Sync,
    T: EnsembleOutput,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _output: std::marker::PhantomData,
        }
    }
}

impl<F, T> Predictor for FnPredictor<F, T>
where
    F: Fn(ArrayView1<'_, f64>) -> Result<T> + Send + Sync,
    T: EnsembleOutput,
{
    type Output = T;

    fn predict(&self, features: ArrayView1<'_, f64>) -> Result<T> {
        (self.f)(features)
    }
}

/// Feature indices a sub-model sees
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureSubset {
    /// Every input feature, passed through unchanged
    #[default]
    All,
    /// Ordered, duplicate-free subset of input feature indices
    Indices(Vec<usize>),
}

impl FeatureSubset {
    /// Build a subset; an empty list means all features.
    pub fn from_indices(indices: Vec<usize>) -> Result<Self> {
        if indices.is_empty() {
            return Ok(FeatureSubset::All);
        }
        let mut seen = indices.clone();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            return Err(KolosalError::InvalidArgument(
                "feature subset contains duplicate indices".to_string(),
            ));
        }
        Ok(FeatureSubset::Indices(indices))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FeatureSubset::All)
    }

    pub fn indices(&self) -> Option<&[usize]> {
        match self {
            FeatureSubset::All => None,
            FeatureSubset::Indices(indices) => Some(indices),
        }
    }

    /// Check every index against the feature space size
    pub fn validate(&self, n_features: usize) -> Result<()> {
        if let FeatureSubset::Indices(indices) = self {
            if let Some(&bad) = indices.iter().find(|&&i| i >= n_features) {
                return Err(KolosalError::InvalidArgument(format!(
                    "feature index {bad} out of range for {n_features} features"
                )));
            }
        }
        Ok(())
    }

    /// Project a row onto this subset; `All` borrows the row as-is.
    pub fn project<'a>(&self, row: ArrayView1<'a, f64>) -> Result<CowArray<'a, f64, Ix1>> {
        match self {
            FeatureSubset::All => Ok(CowArray::from(row)),
            FeatureSubset::Indices(indices) => {
                self.validate(row.len())?;
                Ok(CowArray::from(row.select(Axis(0), indices)))
            }
        }
    }
}

/// A trained predictor bound to the feature subset it was trained on
pub struct FeatureSubsetModel<T> {
    predictor: BoxedPredictor<T>,
    features: FeatureSubset,
    name: Option<String>,
}

impl<T: EnsembleOutput> FeatureSubsetModel<T> {
    /// Wrap a predictor that uses every feature
    pub fn new<P>(predictor: P) -> Self
    where
        P: Predictor<Output = T> + 'static,
    {
        Self {
            predictor: Box::new(predictor),
            features: FeatureSubset::All,
            name: None,
        }
    }

    /// Wrap a predictor trained on a feature subset
    pub fn with_features<P>(predictor: P, features: FeatureSubset) -> Self
    where
        P: Predictor<Output = T> + 'static,
    {
        Self {
            predictor: Box::new(predictor),
            features,
            name: None,
        }
    }

    /// Attach a display name used in logs and metadata
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn features(&self) -> &FeatureSubset {
        &self.features
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Project `row` onto the model's features and predict
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> Result<T> {
        let projected = self.features.project(row)?;
        self.predictor.predict(projected.view())
    }
}

impl<T> fmt::Debug for FeatureSubsetModel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSubsetModel")
            .field("name", &self.name)
            .field("features", &self.features)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sum_model() -> FnPredictor<impl Fn(ArrayView1<'_, f64>) -> Result<f32> + Send + Sync, f32> {
        FnPredictor::new(|x: ArrayView1<'_, f64>| Ok(x.sum() as f32))
    }

    #[test]
    fn test_empty_indices_mean_all() {
        assert_eq!(FeatureSubset::from_indices(vec![]).unwrap(), FeatureSubset::All);
    }

    #[test]
    fn test_duplicate_indices_rejected() {
        assert!(matches!(
            FeatureSubset::from_indices(vec![1, 3, 1]),
            Err(KolosalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_bounds() {
        let subset = FeatureSubset::from_indices(vec![0, 4]).unwrap();
        assert!(subset.validate(5).is_ok());
        assert!(subset.validate(4).is_err());
        assert!(FeatureSubset::All.validate(0).is_ok());
    }

    #[test]
    fn test_projection_keeps_subset_order() {
        let row = array![10.0, 20.0, 30.0, 40.0];
        let subset = FeatureSubset::from_indices(vec![3, 1]).unwrap();
        let projected = subset.project(row.view()).unwrap();
        assert_eq!(projected.to_vec(), vec![40.0, 20.0]);
    }

    #[test]
    fn test_predict_row_respects_subset() {
        let row = array![1.0, 2.0, 3.0];
        let full = FeatureSubsetModel::new(sum_model());
        let partial = FeatureSubsetModel::with_features(
            sum_model(),
            FeatureSubset::from_indices(vec![0, 2]).unwrap(),
        )
        .named("partial");

        assert_eq!(full.predict_row(row.view()).unwrap(), 6.0);
        assert_eq!(partial.predict_row(row.view()).unwrap(), 4.0);
        assert_eq!(partial.name(), Some("partial"));
    }

    #[test]
    fn test_projection_out_of_range() {
        let row = array![1.0, 2.0];
        let model = FeatureSubsetModel::with_features(
            sum_model(),
            FeatureSubset::from_indices(vec![5]).unwrap(),
        );
        assert!(matches!(
            model.predict_row(row.view()),
            Err(KolosalError::InvalidArgument(_))
        ));
    }
}
