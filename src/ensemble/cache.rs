//! Held-out predictions of every pool model, indexed by pool position.
//!
//! Evaluators write into a [`PredictionCache`] (one write per model, from any
//! thread). [`PredictionCache::freeze`] is the barrier: it checks every slot
//! was filled and yields an immutable [`PredictionTable`] that selectors and
//! combiners read.

use super::output::EnsembleOutput;
use super::predictor::FeatureSubsetModel;
use crate::error::{KolosalError, Result};
use crate::utils::ParallelConfig;
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::sync::OnceLock;
use std::time::Instant;

/// Write-once prediction slots, one per pool model
#[derive(Debug)]
pub struct PredictionCache<T> {
    slots: Vec<OnceLock<Vec<T>>>,
    labels: Vec<f32>,
}

impl<T: EnsembleOutput> PredictionCache<T> {
    /// Create empty slots for `n_models` over an evaluation set with `labels`
    pub fn new(n_models: usize, labels: Vec<f32>) -> Self {
        Self {
            slots: (0..n_models).map(|_| OnceLock::new()).collect(),
            labels,
        }
    }

    pub fn n_models(&self) -> usize {
        self.slots.len()
    }

    pub fn n_examples(&self) -> usize {
        self.labels.len()
    }

    /// Store the predictions of model `index`. Each slot accepts one write.
    pub fn insert(&self, index: usize, predictions: Vec<T>) -> Result<()> {
        let slot = self.slots.get(index).ok_or_else(|| {
            KolosalError::InvalidArgument(format!(
                "model index {index} out of range for a pool of {}",
                self.slots.len()
            ))
        })?;
        if predictions.len() != self.labels.len() {
            return Err(KolosalError::InvalidArgument(format!(
                "model {index} produced {} predictions for {} evaluation examples",
                predictions.len(),
                self.labels.len()
            )));
        }
        if let Some((example, err)) = predictions
            .iter()
            .enumerate()
            .find_map(|(example, p)| p.validate().err().map(|e| (example, e)))
        {
            return Err(KolosalError::InvalidArgument(format!(
                "model {index} example {example}: {err}"
            )));
        }
        slot.set(predictions).map_err(|_| {
            KolosalError::InvalidArgument(format!("predictions for model {index} already cached"))
        })
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|slot| slot.get().is_some())
    }

    /// Close the cache for writing once every model has been evaluated.
    pub fn freeze(self) -> Result<PredictionTable<T>> {
        let mut predictions = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.into_iter().enumerate() {
            let preds = slot.into_inner().ok_or_else(|| {
                KolosalError::InvalidArgument(format!("no cached predictions for model {index}"))
            })?;
            predictions.push(preds);
        }
        Ok(PredictionTable {
            predictions,
            labels: self.labels,
        })
    }
}

/// Frozen `model -> predictions` table over a shared evaluation set
#[derive(Debug, Clone)]
pub struct PredictionTable<T> {
    predictions: Vec<Vec<T>>,
    labels: Vec<f32>,
}

impl<T: EnsembleOutput> PredictionTable<T> {
    /// Build a table directly from complete predictions.
    pub fn new(predictions: Vec<Vec<T>>, labels: Vec<f32>) -> Result<Self> {
        if let Some((index, preds)) = predictions
            .iter()
            .enumerate()
            .find(|(_, p)| p.len() != labels.len())
        {
            return Err(KolosalError::InvalidArgument(format!(
                "model {index} has {} predictions for {} labels",
                preds.len(),
                labels.len()
            )));
        }
        for (index, preds) in predictions.iter().enumerate() {
            for p in preds {
                p.validate()
                    .map_err(|e| KolosalError::InvalidArgument(format!("model {index}: {e}")))?;
            }
        }
        Ok(Self { predictions, labels })
    }

    pub fn n_models(&self) -> usize {
        self.predictions.len()
    }

    pub fn n_examples(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Predictions of the model at pool position `index`
    pub fn model(&self, index: usize) -> Result<&[T]> {
        self.predictions
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                KolosalError::InvalidArgument(format!(
                    "no cached predictions for model {index} ({} cached)",
                    self.predictions.len()
                ))
            })
    }

    /// Fail unless the table covers exactly a pool of `pool_size` models.
    pub fn ensure_covers(&self, pool_size: usize) -> Result<()> {
        if self.predictions.len() != pool_size {
            return Err(KolosalError::InvalidArgument(format!(
                "prediction cache holds {} models but the pool has {pool_size}",
                self.predictions.len()
            )));
        }
        Ok(())
    }
}

/// Evaluate every pool model on the held-out rows, one rayon task per model.
pub fn evaluate_pool<T: EnsembleOutput>(
    pool: &[FeatureSubsetModel<T>],
    rows: ArrayView2<'_, f64>,
    labels: &[f32],
    parallel: &ParallelConfig,
) -> Result<PredictionTable<T>> {
    if rows.nrows() != labels.len() {
        return Err(KolosalError::ShapeError {
            expected: format!("{} labels", rows.nrows()),
            actual: format!("{} labels", labels.len()),
        });
    }
    for (index, model) in pool.iter().enumerate() {
        model.features().validate(rows.ncols()).map_err(|e| {
            KolosalError::InvalidArgument(format!("model {index}: {e}"))
        })?;
    }

    let start = Instant::now();
    let cache = PredictionCache::new(pool.len(), labels.to_vec());
    parallel.install(|| {
        pool.par_iter().enumerate().try_for_each(|(index, model)| {
            let predictions = rows
                .outer_iter()
                .map(|row| model.predict_row(row))
                .collect::<Result<Vec<T>>>()
                .map_err(|e| KolosalError::inference(index, e))?;
            cache.insert(index, predictions)
        })
    })??;

    tracing::debug!(
        n_models = pool.len(),
        n_examples = rows.nrows(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Evaluated model pool on held-out rows"
    );
    cache.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::predictor::FnPredictor;
    use ndarray::{array, ArrayView1};
    use std::sync::Arc;

    #[test]
    fn test_insert_is_write_once() {
        let cache: PredictionCache<f32> = PredictionCache::new(2, vec![0.0, 1.0]);
        cache.insert(0, vec![0.1, 0.9]).unwrap();
        assert!(matches!(
            cache.insert(0, vec![0.2, 0.8]),
            Err(KolosalError::InvalidArgument(_))
        ));
        assert!(cache.insert(5, vec![0.2, 0.8]).is_err());
        assert!(cache.insert(1, vec![0.2]).is_err());
    }

    #[test]
    fn test_freeze_requires_every_model() {
        let cache: PredictionCache<f32> = PredictionCache::new(2, vec![1.0]);
        cache.insert(0, vec![1.0]).unwrap();
        assert!(!cache.is_complete());
        assert!(matches!(cache.freeze(), Err(KolosalError::InvalidArgument(_))));
    }

    #[test]
    fn test_concurrent_writers_then_freeze() {
        let cache: Arc<PredictionCache<f32>> = Arc::new(PredictionCache::new(8, vec![0.0; 3]));
        std::thread::scope(|s| {
            for i in 0..8 {
                let cache = Arc::clone(&cache);
                s.spawn(move || cache.insert(i, vec![i as f32; 3]).unwrap());
            }
        });
        let cache = Arc::try_unwrap(cache).unwrap();
        let table = cache.freeze().unwrap();
        assert_eq!(table.n_models(), 8);
        assert_eq!(table.model(5).unwrap(), &[5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_table_validates_lengths() {
        assert!(PredictionTable::new(vec![vec![1.0f32, 2.0], vec![1.0]], vec![0.0, 0.0]).is_err());
        let table = PredictionTable::new(vec![vec![1.0f32, 2.0]], vec![0.0, 0.0]).unwrap();
        assert!(table.ensure_covers(1).is_ok());
        assert!(table.ensure_covers(2).is_err());
        assert!(table.model(1).is_err());
    }

    #[test]
    fn test_evaluate_pool_projects_features() {
        let rows = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let pool = vec![
            FeatureSubsetModel::new(FnPredictor::new(|x: ArrayView1<'_, f64>| Ok(x.sum() as f32))),
            FeatureSubsetModel::with_features(
                FnPredictor::new(|x: ArrayView1<'_, f64>| Ok(x.sum() as f32)),
                crate::ensemble::FeatureSubset::from_indices(vec![2]).unwrap(),
            ),
        ];
        let table = evaluate_pool(&pool, rows.view(), &[0.0, 1.0], &ParallelConfig::default()).unwrap();
        assert_eq!(table.model(0).unwrap(), &[6.0, 15.0]);
        assert_eq!(table.model(1).unwrap(), &[3.0, 6.0]);
    }

    #[test]
    fn test_malformed_class_scores_rejected() {
        use crate::ensemble::ClassScores;
        let bad = ClassScores::Sparse {
            len: 2,
            indices: vec![5],
            values: vec![1.0],
        };
        let cache: PredictionCache<ClassScores> = PredictionCache::new(1, vec![0.0]);
        assert!(matches!(
            cache.insert(0, vec![bad.clone()]),
            Err(KolosalError::InvalidArgument(_))
        ));
        assert!(!cache.is_complete());
        assert!(PredictionTable::new(vec![vec![bad]], vec![0.0]).is_err());
    }

    #[test]
    fn test_evaluate_pool_tags_failing_model() {
        let rows = array![[1.0], [2.0]];
        let pool = vec![
            FeatureSubsetModel::new(FnPredictor::new(|_: ArrayView1<'_, f64>| Ok(1.0f32))),
            FeatureSubsetModel::new(FnPredictor::new(|_: ArrayView1<'_, f64>| {
                Err::<f32, _>(KolosalError::ComputationError("diverged".to_string()))
            })),
        ];
        let err = evaluate_pool(&pool, rows.view(), &[0.0, 1.0], &ParallelConfig::default()).unwrap_err();
        assert!(matches!(err, KolosalError::InferenceFailure { model_index: 1, .. }));
    }
}
