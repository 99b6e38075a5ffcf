//! Combiners merging the retained models' predictions into one
//!
//! Inputs arrive one per retained model, in retained order. Every combiner
//! is a pure function of that ordered slice.

use super::cache::PredictionTable;
use super::metrics::QualityMetric;
use super::output::{EnsembleOutput, PredictionKind};
use super::stacking::StackingCombiner;
use crate::config::{CombinerKind, EnsembleConfig, TieBreakPolicy};
use crate::error::{KolosalError, Result};
use serde::{Deserialize, Serialize};

/// Floor applied to lower-is-better scores before inverting them into weights
const QUALITY_WEIGHT_EPS: f64 = 1e-12;

/// Merges one prediction per retained model into the ensemble prediction
pub trait OutputCombiner<T: EnsembleOutput>: Send + Sync {
    fn combine(&self, predictions: &[T]) -> Result<T>;
}

/// Check the inputs are non-empty, well formed and share one dimension;
/// returns it.
fn check_inputs<T: EnsembleOutput>(predictions: &[T]) -> Result<usize> {
    let first = predictions.first().ok_or_else(|| {
        KolosalError::InvalidArgument("cannot combine an empty prediction list".to_string())
    })?;
    for (index, p) in predictions.iter().enumerate() {
        p.validate()
            .map_err(|e| KolosalError::InvalidArgument(format!("prediction {index}: {e}")))?;
    }
    let dim = first.dimension();
    if let Some((index, other)) = predictions
        .iter()
        .enumerate()
        .find(|(_, p)| p.dimension() != dim)
    {
        return Err(KolosalError::InvalidArgument(format!(
            "prediction {index} has dimension {} but prediction 0 has {dim}",
            other.dimension()
        )));
    }
    Ok(dim)
}

fn median_of(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Element-wise median
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Median;

impl<T: EnsembleOutput> OutputCombiner<T> for Median {
    fn combine(&self, predictions: &[T]) -> Result<T> {
        let dim = check_inputs(predictions)?;
        let mut column = Vec::with_capacity(predictions.len());
        let mut out = Vec::with_capacity(dim);
        for k in 0..dim {
            column.clear();
            column.extend(predictions.iter().map(|p| p.value(k)));
            out.push(median_of(&mut column));
        }
        Ok(T::from_dense(out))
    }
}

/// Element-wise mean, optionally weighted per retained model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AverageRepr")]
pub struct Average {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weights: Option<Vec<f64>>,
}

/// Persisted form of [`Average`]; weights are re-checked on load.
#[derive(Deserialize)]
struct AverageRepr {
    #[serde(default)]
    weights: Option<Vec<f64>>,
}

impl TryFrom<AverageRepr> for Average {
    type Error = KolosalError;

    fn try_from(repr: AverageRepr) -> Result<Self> {
        match repr.weights {
            Some(weights) => Average::weighted(weights),
            None => Ok(Average::new()),
        }
    }
}

impl Average {
    /// Unweighted mean
    pub fn new() -> Self {
        Self::default()
    }

    /// Weighted mean; weights are non-negative with a positive sum.
    pub fn weighted(weights: Vec<f64>) -> Result<Self> {
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(KolosalError::InvalidArgument(
                "average weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(KolosalError::InvalidArgument(
                "average weights must have a positive sum".to_string(),
            ));
        }
        Ok(Self {
            weights: Some(weights),
        })
    }

    /// Weights derived from held-out quality scores
    pub fn from_quality(metric: QualityMetric, scores: &[f64]) -> Result<Self> {
        let weights = scores
            .iter()
            .map(|&s| {
                if metric.higher_is_better() {
                    s
                } else {
                    1.0 / (s + QUALITY_WEIGHT_EPS)
                }
            })
            .collect();
        Self::weighted(weights)
    }

    pub fn weights(&self) -> Option<&[f64]> {
        self.weights.as_deref()
    }
}

impl<T: EnsembleOutput> OutputCombiner<T> for Average {
    fn combine(&self, predictions: &[T]) -> Result<T> {
        let dim = check_inputs(predictions)?;
        let mut acc = vec![0.0f64; dim];
        let total = match &self.weights {
            Some(weights) => {
                if weights.len() != predictions.len() {
                    return Err(KolosalError::InvalidArgument(format!(
                        "{} weights for {} predictions",
                        weights.len(),
                        predictions.len()
                    )));
                }
                for (p, &w) in predictions.iter().zip(weights) {
                    p.accumulate(&mut acc, w);
                }
                weights.iter().sum::<f64>()
            }
            None => {
                for p in predictions {
                    p.accumulate(&mut acc, 1.0);
                }
                predictions.len() as f64
            }
        };
        acc.iter_mut().for_each(|v| *v /= total);
        Ok(T::from_dense(acc))
    }
}

/// One vote per model for its predicted class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MajorityVote {
    #[serde(default)]
    tie_break: TieBreakPolicy,
}

impl MajorityVote {
    pub fn new(tie_break: TieBreakPolicy) -> Self {
        Self { tie_break }
    }

    pub fn tie_break(&self) -> TieBreakPolicy {
        self.tie_break
    }
}

impl<T: EnsembleOutput> OutputCombiner<T> for MajorityVote {
    fn combine(&self, predictions: &[T]) -> Result<T> {
        check_inputs(predictions)?;
        let n_classes = predictions[0].n_classes();
        if n_classes == 0 {
            return Err(KolosalError::InvalidArgument(
                "cannot vote over an empty class vector".to_string(),
            ));
        }

        let classes: Vec<usize> = predictions.iter().map(EnsembleOutput::predicted_class).collect();
        let mut votes = vec![0usize; n_classes];
        for &c in &classes {
            votes[c] += 1;
        }
        let top = votes.iter().copied().max().unwrap_or(0);
        let tied: Vec<usize> = (0..n_classes).filter(|&c| votes[c] == top).collect();

        let winner = match (tied.as_slice(), self.tie_break) {
            ([only], _) => *only,
            (_, TieBreakPolicy::LowestIndex) => tied[0],
            (_, TieBreakPolicy::FirstInserted) => classes
                .iter()
                .copied()
                .find(|&c| votes[c] == top)
                .unwrap_or(tied[0]),
            (_, TieBreakPolicy::HighestConfidence) => {
                let mut best = (tied[0], f64::NEG_INFINITY);
                for &c in &tied {
                    let confidence: f64 = predictions.iter().map(|p| p.class_probability(c)).sum();
                    if confidence > best.1 {
                        best = (c, confidence);
                    }
                }
                best.0
            }
        };
        Ok(T::one_hot(winner, n_classes))
    }
}

/// Configured combiner, serialisable with its fitted state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Combiner {
    Median,
    Average(Average),
    Vote(MajorityVote),
    Stacking(StackingCombiner),
}

impl Combiner {
    /// Build the configured combiner for the retained pool indices.
    ///
    /// Quality weights and the stacking meta-model are fitted on the retained
    /// models' held-out predictions in `table`.
    pub fn build<T: EnsembleOutput>(
        config: &EnsembleConfig,
        kind: PredictionKind,
        table: &PredictionTable<T>,
        retained: &[usize],
    ) -> Result<Self> {
        let combiner = match config.combiner_kind {
            CombinerKind::Average if config.weight_by_quality => {
                let metric = config.quality_metric_for(kind);
                let scores = retained
                    .iter()
                    .map(|&i| metric.score(table.model(i)?, table.labels()))
                    .collect::<Result<Vec<_>>>()?;
                Combiner::Average(Average::from_quality(metric, &scores)?)
            }
            CombinerKind::Stacking => Combiner::Stacking(StackingCombiner::fit(
                kind,
                &config.stacking,
                table,
                retained,
            )?),
            _ => Self::untrained(config)?,
        };
        combiner.check_compatible(kind, retained.len())?;
        Ok(combiner)
    }

    /// Combiner that needs no held-out predictions
    pub fn untrained(config: &EnsembleConfig) -> Result<Self> {
        match config.combiner_kind {
            CombinerKind::Median => Ok(Combiner::Median),
            CombinerKind::Average if config.weight_by_quality => Err(KolosalError::InvalidArgument(
                "quality-weighted averaging needs held-out predictions".to_string(),
            )),
            CombinerKind::Average => Ok(Combiner::Average(Average::new())),
            CombinerKind::Vote => Ok(Combiner::Vote(MajorityVote::new(config.tie_break_policy))),
            CombinerKind::Stacking => Err(KolosalError::InvalidArgument(
                "stacking needs held-out predictions to fit its meta-model".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> CombinerKind {
        match self {
            Combiner::Median => CombinerKind::Median,
            Combiner::Average(_) => CombinerKind::Average,
            Combiner::Vote(_) => CombinerKind::Vote,
            Combiner::Stacking(_) => CombinerKind::Stacking,
        }
    }

    /// Fail unless this combiner can serve `n_models` models of `kind`
    pub fn check_compatible(&self, kind: PredictionKind, n_models: usize) -> Result<()> {
        match self {
            Combiner::Vote(_) if !kind.is_classification() => Err(KolosalError::InvalidArgument(
                format!("vote combiner cannot serve {kind} models"),
            )),
            Combiner::Average(avg) => match avg.weights() {
                Some(w) if w.len() != n_models => Err(KolosalError::InvalidArgument(format!(
                    "average combiner has {} weights for {n_models} models",
                    w.len()
                ))),
                _ => Ok(()),
            },
            Combiner::Stacking(stack) if stack.kind() != kind || stack.n_models() != n_models => {
                Err(KolosalError::InvalidArgument(format!(
                    "stacking meta-model was fitted for {} {} models, not {n_models} {kind} models",
                    stack.n_models(),
                    stack.kind()
                )))
            }
            _ => Ok(()),
        }
    }
}

impl<T: EnsembleOutput> OutputCombiner<T> for Combiner {
    fn combine(&self, predictions: &[T]) -> Result<T> {
        match self {
            Combiner::Median => Median.combine(predictions),
            Combiner::Average(avg) => avg.combine(predictions),
            Combiner::Vote(vote) => vote.combine(predictions),
            Combiner::Stacking(stack) => stack.combine(predictions),
        }
    }
}
