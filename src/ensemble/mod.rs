//! Ensemble module
//!
//! Builds a selective ensemble out of a pool of trained sub-models:
//! - Held-out prediction cache (write-once, then frozen)
//! - Quality and pairwise diversity metrics
//! - Sub-model selection (all, best, best-diverse)
//! - Output combination (median, average, majority vote, stacking)
//! - Immutable ensemble predictor for concurrent inference

mod cache;
mod combiner;
mod diversity;
mod engine;
mod metrics;
mod output;
mod predictor;
mod selector;
mod stacking;

pub use cache::{evaluate_pool, PredictionCache, PredictionTable};
pub use combiner::{Average, Combiner, MajorityVote, Median, OutputCombiner};
pub use diversity::{
    CorrelationDistance, Disagreement, DiversityMeasure, DiversityMetric, Divergence, ModelDiversity,
};
pub use engine::{EnsembleEngine, EnsembleMetadata, EnsemblePredictor, MulticlassEnsemble, ScalarEnsemble};
pub use metrics::QualityMetric;
pub use output::{ClassScores, EnsembleOutput, OutputShape, PredictionKind, Stored};
pub use predictor::{BoxedPredictor, FeatureSubset, FeatureSubsetModel, FnPredictor, Predictor};
pub use selector::{
    build_selector, quality_scores, AllSelector, BestDiverseSelector, BestPerformanceSelector,
    RetainedSubset, SubModelSelector,
};
pub use stacking::StackingCombiner;
