//! Kolosal Ensemble - selective ensembles over a pool of trained sub-models
//!
//! Given base models trained on feature subsets and their predictions on a
//! shared held-out set, this crate decides which models to keep and how to
//! merge their outputs at inference time.
//!
//! # Modules
//!
//! - [`ensemble`] - Prediction cache, diversity, selection, combination and the ensemble predictor
//! - [`config`] - Ensemble configuration (JSON, builder methods, validation)
//! - [`error`] - Crate-wide error type
//! - [`utils`] - Parallel processing helpers
//!
//! # Example
//!
//! ```
//! use kolosal_ensemble::prelude::*;
//! use ndarray::{array, ArrayView1};
//!
//! let pool: Vec<FeatureSubsetModel<f32>> = (0..3)
//!     .map(|i| {
//!         FeatureSubsetModel::with_features(
//!             FnPredictor::new(|x: ArrayView1<'_, f64>| Ok(x.sum() as f32)),
//!             FeatureSubset::from_indices(vec![i]).unwrap(),
//!         )
//!     })
//!     .collect();
//!
//! let holdout = array![[1.0, 2.0, 3.0], [2.0, 2.0, 2.0]];
//! let labels = [2.0, 2.0];
//!
//! let mut engine = EnsembleEngine::new(PredictionKind::Regression, EnsembleConfig::default())?;
//! let table = engine.evaluate(&pool, holdout.view(), &labels)?;
//! let predictor = engine.build(pool, &table)?;
//! assert_eq!(predictor.predict(array![1.0, 5.0, 9.0].view())?, 5.0);
//! # Ok::<(), KolosalError>(())
//! ```

// Core error handling
pub mod error;

pub mod config;
pub mod ensemble;
pub mod utils;

pub use error::{KolosalError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{KolosalError, Result};

    // Configuration
    pub use crate::config::{
        CombinerKind, EnsembleConfig, RetainedCount, SelectorKind, StackingConfig, TieBreakPolicy,
    };

    // Ensemble
    pub use crate::ensemble::{
        ClassScores, Combiner, DiversityMetric, EnsembleEngine, EnsembleOutput, EnsemblePredictor,
        FeatureSubset, FeatureSubsetModel, FnPredictor, MulticlassEnsemble, OutputCombiner,
        PredictionKind, PredictionTable, Predictor, QualityMetric, ScalarEnsemble,
    };

    // Parallelism
    pub use crate::utils::{ParallelConfig, WorkerPool};
}
