//! Sub-model selection (pruning the trained pool to the retained subset)
//!
//! Selectors only read the pool and the frozen prediction table. They return
//! a [`RetainedSubset`] of pool indices; [`RetainedSubset::take_from`] then
//! moves the retained models out of the pool and drops the rest.

use super::cache::PredictionTable;
use super::diversity::DiversityMeasure;
use super::metrics::QualityMetric;
use super::output::{EnsembleOutput, PredictionKind};
use super::predictor::FeatureSubsetModel;
use crate::config::{EnsembleConfig, RetainedCount, SelectorKind};
use crate::error::{KolosalError, Result};

/// Ordered, duplicate-free pool indices chosen by a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedSubset {
    indices: Vec<usize>,
}

impl RetainedSubset {
    /// Validate `indices` against a pool of `pool_size` models
    pub fn new(indices: Vec<usize>, pool_size: usize) -> Result<Self> {
        let mut seen = vec![false; pool_size];
        for &i in &indices {
            match seen.get_mut(i) {
                None => {
                    return Err(KolosalError::InvalidArgument(format!(
                        "retained index {i} out of range for a pool of {pool_size}"
                    )))
                }
                Some(true) => {
                    return Err(KolosalError::InvalidArgument(format!(
                        "model {i} retained twice"
                    )))
                }
                Some(flag) => *flag = true,
            }
        }
        Ok(Self { indices })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Move the retained models out of `pool`, in retained order.
    pub fn take_from<T>(&self, pool: Vec<FeatureSubsetModel<T>>) -> Result<Vec<FeatureSubsetModel<T>>> {
        let pool_size = pool.len();
        let mut slots: Vec<Option<FeatureSubsetModel<T>>> = pool.into_iter().map(Some).collect();
        self.indices
            .iter()
            .map(|&i| {
                slots.get_mut(i).and_then(Option::take).ok_or_else(|| {
                    KolosalError::InvalidArgument(format!(
                        "retained index {i} not available in a pool of {pool_size}"
                    ))
                })
            })
            .collect()
    }
}

/// Strategy choosing which trained models join the ensemble
pub trait SubModelSelector<T: EnsembleOutput>: Send + Sync {
    fn select(&self, pool: &[FeatureSubsetModel<T>], table: &PredictionTable<T>) -> Result<RetainedSubset>;

    /// Configuration name of this selector
    fn name(&self) -> &'static str;
}

/// Held-out quality of every pool model, in pool order.
///
/// Fails when a model scores NaN or infinity, which is what a single
/// non-finite held-out prediction does to the regression metrics.
pub fn quality_scores<T: EnsembleOutput>(
    metric: QualityMetric,
    table: &PredictionTable<T>,
) -> Result<Vec<f64>> {
    (0..table.n_models())
        .map(|i| {
            let score = metric.score(table.model(i)?, table.labels())?;
            if !score.is_finite() {
                return Err(KolosalError::InvalidArgument(format!(
                    "model {i} has a non-finite {metric} score on the held-out set"
                )));
            }
            Ok(score)
        })
        .collect()
}

/// Pool indices best-first; equal scores keep insertion order.
fn rank_by_quality(metric: QualityMetric, scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| metric.compare(scores[a], scores[b]));
    order
}

/// Keeps the whole pool
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSelector;

impl<T: EnsembleOutput> SubModelSelector<T> for AllSelector {
    fn select(&self, pool: &[FeatureSubsetModel<T>], _table: &PredictionTable<T>) -> Result<RetainedSubset> {
        RetainedSubset::new((0..pool.len()).collect(), pool.len())
    }

    fn name(&self) -> &'static str {
        "all"
    }
}

/// Keeps the top models by held-out quality
#[derive(Debug, Clone, Copy)]
pub struct BestPerformanceSelector {
    metric: QualityMetric,
    retained: RetainedCount,
    proportion: f64,
}

impl BestPerformanceSelector {
    pub fn new(metric: QualityMetric, retained: RetainedCount, proportion: f64) -> Self {
        Self {
            metric,
            retained,
            proportion,
        }
    }
}

impl<T: EnsembleOutput> SubModelSelector<T> for BestPerformanceSelector {
    fn select(&self, pool: &[FeatureSubsetModel<T>], table: &PredictionTable<T>) -> Result<RetainedSubset> {
        if pool.is_empty() {
            return RetainedSubset::new(Vec::new(), 0);
        }
        table.ensure_covers(pool.len())?;

        let scores = quality_scores(self.metric, table)?;
        let target = self.retained.resolve(pool.len(), self.proportion);
        let mut ranking = rank_by_quality(self.metric, &scores);
        ranking.truncate(target);

        tracing::info!(
            pool = pool.len(),
            retained = ranking.len(),
            metric = %self.metric,
            "Selected best sub-models"
        );
        RetainedSubset::new(ranking, pool.len())
    }

    fn name(&self) -> &'static str {
        "best"
    }
}

/// Seeds with the best model, then greedily adds the candidate with the
/// highest mean diversity against everything retained so far.
pub struct BestDiverseSelector<T: EnsembleOutput> {
    measure: Box<dyn DiversityMeasure<T>>,
    metric: QualityMetric,
    retained: RetainedCount,
    proportion: f64,
    min_diversity: f64,
}

impl<T: EnsembleOutput> BestDiverseSelector<T> {
    pub fn new(measure: Box<dyn DiversityMeasure<T>>, metric: QualityMetric, retained: RetainedCount) -> Self {
        Self {
            measure,
            metric,
            retained,
            proportion: 0.5,
            min_diversity: 0.0,
        }
    }

    /// Share of the pool kept when the retained count is `auto`
    pub fn with_proportion(mut self, proportion: f64) -> Self {
        self.proportion = proportion;
        self
    }

    /// Stop early once the best candidate's mean diversity drops below this
    pub fn with_min_diversity(mut self, threshold: f64) -> Self {
        self.min_diversity = threshold;
        self
    }
}

impl<T: EnsembleOutput> SubModelSelector<T> for BestDiverseSelector<T> {
    fn select(&self, pool: &[FeatureSubsetModel<T>], table: &PredictionTable<T>) -> Result<RetainedSubset> {
        let n = pool.len();
        if n < 2 {
            return Err(KolosalError::InvalidArgument(format!(
                "best-diverse selection needs more than one model, got {n}"
            )));
        }
        table.ensure_covers(n)?;

        let scores = quality_scores(self.metric, table)?;
        let all: Vec<usize> = (0..n).collect();
        let mut pairwise = vec![0.0f64; n * n];
        for record in self.measure.compute(&all, table)? {
            pairwise[record.model_x * n + record.model_y] = record.diversity;
            pairwise[record.model_y * n + record.model_x] = record.diversity;
        }

        let target = self.retained.resolve(n, self.proportion);
        let seed = rank_by_quality(self.metric, &scores)[0];
        let mut retained = vec![seed];
        let mut candidates: Vec<usize> = all.into_iter().filter(|&i| i != seed).collect();

        while retained.len() < target && !candidates.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (pos, &c) in candidates.iter().enumerate() {
                let mean = retained.iter().map(|&r| pairwise[c * n + r]).sum::<f64>()
                    / retained.len() as f64;
                // Candidates are visited in pool order, so a full tie keeps the earlier one.
                let wins = match best {
                    None => true,
                    Some((best_pos, best_mean)) => {
                        mean > best_mean
                            || (mean == best_mean
                                && self.metric.is_better(scores[c], scores[candidates[best_pos]]))
                    }
                };
                if wins {
                    best = Some((pos, mean));
                }
            }

            let Some((pos, mean)) = best else { break };
            if mean < self.min_diversity {
                tracing::debug!(
                    candidate = candidates[pos],
                    diversity = mean,
                    threshold = self.min_diversity,
                    "Stopping diverse selection below threshold"
                );
                break;
            }
            let chosen = candidates.remove(pos);
            tracing::debug!(
                round = retained.len(),
                model = chosen,
                diversity = mean,
                quality = scores[chosen],
                "Added diverse sub-model"
            );
            retained.push(chosen);
        }

        tracing::info!(
            pool = n,
            retained = retained.len(),
            metric = %self.metric,
            "Selected best-diverse sub-models"
        );
        RetainedSubset::new(retained, n)
    }

    fn name(&self) -> &'static str {
        "bestDiverse"
    }
}

/// Build the configured selector for `kind`
pub fn build_selector<T: EnsembleOutput>(
    config: &EnsembleConfig,
    kind: PredictionKind,
) -> Result<Box<dyn SubModelSelector<T>>> {
    kind.ensure_output::<T>()?;
    let metric = config.quality_metric_for(kind);
    Ok(match config.selector_kind {
        SelectorKind::All => Box::new(AllSelector),
        SelectorKind::Best => Box::new(BestPerformanceSelector::new(
            metric,
            config.retained_count,
            config.selection_proportion,
        )),
        SelectorKind::BestDiverse => Box::new(
            BestDiverseSelector::new(
                config.diversity_metric.measure::<T>(kind)?,
                metric,
                config.retained_count,
            )
            .with_proportion(config.selection_proportion)
            .with_min_diversity(config.min_diversity),
        ),
    })
}
