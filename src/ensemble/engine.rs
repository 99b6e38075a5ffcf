//! Ensemble predictor and the engine that builds it
//!
//! [`EnsembleEngine`] holds the Unbuilt → Ready transition: it selects the
//! retained models, constructs the combiner and publishes an immutable
//! [`EnsemblePredictor`] behind an `Arc`. Once published, the predictor
//! exposes no mutating operations and serves any number of concurrent callers.

use super::cache::{evaluate_pool, PredictionTable};
use super::combiner::{Combiner, OutputCombiner};
use super::output::{ClassScores, EnsembleOutput, PredictionKind};
use super::predictor::{FeatureSubset, FeatureSubsetModel};
use super::selector::build_selector;
use crate::config::{CombinerKind, EnsembleConfig};
use crate::error::{KolosalError, Result};
use crate::utils::WorkerPool;
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Ensemble over scalar predictions (regression, binary probabilities)
pub type ScalarEnsemble = EnsemblePredictor<f32>;

/// Ensemble over per-class score vectors
pub type MulticlassEnsemble = EnsemblePredictor<ClassScores>;

/// What the serialisation layer needs to reconstruct a predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleMetadata {
    pub n_models: usize,
    pub prediction_kind: PredictionKind,
    pub combiner_kind: CombinerKind,
    /// Feature subset of each retained model, in retained order
    pub feature_subsets: Vec<FeatureSubset>,
    pub model_names: Vec<Option<String>>,
}

/// Retained models plus the combiner that merges their outputs
#[derive(Debug)]
pub struct EnsemblePredictor<T> {
    kind: PredictionKind,
    models: Vec<FeatureSubsetModel<T>>,
    combiner: Combiner,
}

impl<T: EnsembleOutput> EnsemblePredictor<T> {
    /// Assemble a ready predictor; `models` must be in retained order.
    pub fn new(kind: PredictionKind, models: Vec<FeatureSubsetModel<T>>, combiner: Combiner) -> Result<Self> {
        kind.ensure_output::<T>()?;
        if models.is_empty() {
            return Err(KolosalError::InvalidArgument(
                "an ensemble needs at least one retained model".to_string(),
            ));
        }
        combiner.check_compatible(kind, models.len())?;
        Ok(Self {
            kind,
            models,
            combiner,
        })
    }

    /// Predict one row with every retained model, then combine.
    pub fn predict(&self, row: ArrayView1<'_, f64>) -> Result<T> {
        let predictions = self
            .models
            .iter()
            .enumerate()
            .map(|(index, model)| {
                model
                    .predict_row(row)
                    .map_err(|e| KolosalError::inference(index, e))
            })
            .collect::<Result<Vec<T>>>()?;
        self.combiner.combine(&predictions)
    }

    /// Predict every row on `workers`; output order matches `rows`.
    pub fn predict_batch(&self, rows: ArrayView2<'_, f64>, workers: &WorkerPool) -> Result<Vec<T>> {
        let start = Instant::now();
        let predictions = workers.install(|| {
            rows.axis_iter(Axis(0))
                .into_par_iter()
                .with_min_len(workers.chunk_size())
                .map(|row| self.predict(row))
                .collect::<Result<Vec<T>>>()
        })?;

        tracing::debug!(
            n_rows = rows.nrows(),
            n_models = self.models.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ensemble batch prediction complete"
        );
        Ok(predictions)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn kind(&self) -> PredictionKind {
        self.kind
    }

    pub fn combiner(&self) -> &Combiner {
        &self.combiner
    }

    /// Retained models in combination order
    pub fn models(&self) -> &[FeatureSubsetModel<T>] {
        &self.models
    }

    pub fn metadata(&self) -> EnsembleMetadata {
        EnsembleMetadata {
            n_models: self.models.len(),
            prediction_kind: self.kind,
            combiner_kind: self.combiner.kind(),
            feature_subsets: self.models.iter().map(|m| m.features().clone()).collect(),
            model_names: self.models.iter().map(|m| m.name().map(str::to_string)).collect(),
        }
    }
}

/// Builds ensembles from a trained pool and serves the latest one
#[derive(Debug)]
pub struct EnsembleEngine<T> {
    kind: PredictionKind,
    config: EnsembleConfig,
    predictor: Option<Arc<EnsemblePredictor<T>>>,
    /// Built on first batch prediction, then reused
    workers: OnceLock<WorkerPool>,
}

impl<T: EnsembleOutput> EnsembleEngine<T> {
    /// Create an unbuilt engine; the configuration is validated for `kind`.
    pub fn new(kind: PredictionKind, config: EnsembleConfig) -> Result<Self> {
        kind.ensure_output::<T>()?;
        config.validate(kind)?;
        Ok(Self {
            kind,
            config,
            predictor: None,
            workers: OnceLock::new(),
        })
    }

    pub fn kind(&self) -> PredictionKind {
        self.kind
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.predictor.is_some()
    }

    /// Evaluate the pool on held-out rows with the configured parallelism
    pub fn evaluate(
        &self,
        pool: &[FeatureSubsetModel<T>],
        rows: ArrayView2<'_, f64>,
        labels: &[f32],
    ) -> Result<PredictionTable<T>> {
        evaluate_pool(pool, rows, labels, &self.config.parallel)
    }

    /// Select from `pool`, construct the combiner and publish the predictor.
    ///
    /// `table` must hold the held-out predictions of every pool model, indexed
    /// by pool position. Models that are not retained are dropped.
    pub fn build(
        &mut self,
        pool: Vec<FeatureSubsetModel<T>>,
        table: &PredictionTable<T>,
    ) -> Result<Arc<EnsemblePredictor<T>>> {
        let start = Instant::now();
        let pool_size = pool.len();
        table.ensure_covers(pool_size)?;

        let selector = build_selector::<T>(&self.config, self.kind)?;
        let subset = selector.select(&pool, table)?;
        let combiner = Combiner::build(&self.config, self.kind, table, subset.indices())?;
        let models = subset.take_from(pool)?;

        let predictor = self.publish(models, combiner)?;
        tracing::info!(
            kind = %self.kind,
            selector = selector.name(),
            combiner = %predictor.combiner().kind(),
            pool = pool_size,
            retained = predictor.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ensemble built"
        );
        Ok(predictor)
    }

    /// Combine already-chosen models without selection.
    ///
    /// Only combiners that need no held-out predictions are available here.
    pub fn combine_models(&mut self, models: Vec<FeatureSubsetModel<T>>) -> Result<Arc<EnsemblePredictor<T>>> {
        let combiner = Combiner::untrained(&self.config)?;
        let predictor = self.publish(models, combiner)?;
        tracing::info!(
            kind = %self.kind,
            combiner = %predictor.combiner().kind(),
            retained = predictor.len(),
            "Ensemble assembled from pre-selected models"
        );
        Ok(predictor)
    }

    fn publish(&mut self, models: Vec<FeatureSubsetModel<T>>, combiner: Combiner) -> Result<Arc<EnsemblePredictor<T>>> {
        let predictor = Arc::new(EnsemblePredictor::new(self.kind, models, combiner)?);
        self.predictor = Some(Arc::clone(&predictor));
        Ok(predictor)
    }

    /// Shared handle to the ready predictor
    pub fn predictor(&self) -> Result<Arc<EnsemblePredictor<T>>> {
        self.predictor.clone().ok_or_else(|| {
            KolosalError::InvalidState("ensemble has not been built yet".to_string())
        })
    }

    pub fn predict(&self, row: ArrayView1<'_, f64>) -> Result<T> {
        self.ready()?.predict(row)
    }

    pub fn predict_batch(&self, rows: ArrayView2<'_, f64>) -> Result<Vec<T>> {
        let predictor = self.ready()?;
        predictor.predict_batch(rows, self.workers()?)
    }

    fn workers(&self) -> Result<&WorkerPool> {
        if let Some(workers) = self.workers.get() {
            return Ok(workers);
        }
        // A racing caller may build a second pool; only one is kept.
        let built = self.config.parallel.build_pool()?;
        Ok(self.workers.get_or_init(|| built))
    }

    fn ready(&self) -> Result<&EnsemblePredictor<T>> {
        self.predictor.as_deref().ok_or_else(|| {
            KolosalError::InvalidState("ensemble has not been built yet".to_string())
        })
    }
}
