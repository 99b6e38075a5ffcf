//! Ensemble configuration
//!
//! Chooses the sub-model selector, the output combiner and their parameters.
//! Loaded from JSON (camelCase keys) or assembled with the `with_*` builders.

use crate::ensemble::{DiversityMetric, PredictionKind, QualityMetric};
use crate::error::{KolosalError, Result};
use crate::utils::ParallelConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Sub-model selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectorKind {
    /// Keep the whole pool
    #[default]
    All,
    /// Keep the top models by held-out quality
    Best,
    /// Greedy quality seed, then most-diverse additions
    BestDiverse,
}

/// Output combination policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CombinerKind {
    #[default]
    Median,
    Average,
    Vote,
    Stacking,
}

/// How majority-vote ties are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreakPolicy {
    /// Tied class voted for by the earliest retained model
    FirstInserted,
    /// Lowest tied class index
    #[default]
    LowestIndex,
    /// Tied class with the largest summed class probability
    HighestConfidence,
}

/// How many sub-models to retain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "RetainedCountRepr", into = "RetainedCountRepr")]
pub enum RetainedCount {
    /// `ceil(selection_proportion * pool)`
    #[default]
    Auto,
    Fixed(usize),
}

impl RetainedCount {
    /// Resolve against a pool, clamped to `[1, pool_size]`.
    pub fn resolve(self, pool_size: usize, proportion: f64) -> usize {
        let n = match self {
            RetainedCount::Auto => (proportion * pool_size as f64).ceil() as usize,
            RetainedCount::Fixed(n) => n,
        };
        n.clamp(1, pool_size.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RetainedCountRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<RetainedCountRepr> for RetainedCount {
    type Error = String;

    fn try_from(repr: RetainedCountRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            RetainedCountRepr::Count(0) => Err("retainedCount must be positive".to_string()),
            RetainedCountRepr::Count(n) => Ok(RetainedCount::Fixed(n)),
            RetainedCountRepr::Keyword(s) if s == "auto" => Ok(RetainedCount::Auto),
            RetainedCountRepr::Keyword(s) => Err(format!(
                "retainedCount must be a positive integer or \"auto\", got \"{s}\""
            )),
        }
    }
}

impl From<RetainedCount> for RetainedCountRepr {
    fn from(count: RetainedCount) -> Self {
        match count {
            RetainedCount::Auto => RetainedCountRepr::Keyword("auto".to_string()),
            RetainedCount::Fixed(n) => RetainedCountRepr::Count(n),
        }
    }
}

/// Meta-model settings for the stacking combiner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackingConfig {
    /// L2 regularization strength
    pub alpha: f64,
    /// Gradient-descent iterations (binary meta-model)
    pub max_iter: usize,
    /// Gradient-descent step (binary meta-model)
    pub learning_rate: f64,
    /// Convergence tolerance on the gradient norm
    pub tol: f64,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            alpha: 1e-3,
            max_iter: 1000,
            learning_rate: 0.1,
            tol: 1e-6,
        }
    }
}

/// Configuration for building an ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnsembleConfig {
    pub selector_kind: SelectorKind,
    pub combiner_kind: CombinerKind,
    pub diversity_metric: DiversityMetric,
    /// Ranking metric; `None` picks the default for the prediction kind
    pub quality_metric: Option<QualityMetric>,
    pub retained_count: RetainedCount,
    /// Share of the pool kept when `retained_count` is `auto`
    pub selection_proportion: f64,
    /// Best-diverse stops once no candidate reaches this mean diversity
    pub min_diversity: f64,
    pub tie_break_policy: TieBreakPolicy,
    /// Weight the average combiner by held-out quality
    pub weight_by_quality: bool,
    pub stacking: StackingConfig,
    pub parallel: ParallelConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            selector_kind: SelectorKind::All,
            combiner_kind: CombinerKind::Median,
            diversity_metric: DiversityMetric::Disagreement,
            quality_metric: None,
            retained_count: RetainedCount::Auto,
            selection_proportion: 0.5,
            min_diversity: 0.0,
            tie_break_policy: TieBreakPolicy::LowestIndex,
            weight_by_quality: false,
            stacking: StackingConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

impl EnsembleConfig {
    /// Create a new ensemble configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selector(mut self, kind: SelectorKind) -> Self {
        self.selector_kind = kind;
        self
    }

    pub fn with_combiner(mut self, kind: CombinerKind) -> Self {
        self.combiner_kind = kind;
        self
    }

    pub fn with_diversity_metric(mut self, metric: DiversityMetric) -> Self {
        self.diversity_metric = metric;
        self
    }

    pub fn with_quality_metric(mut self, metric: QualityMetric) -> Self {
        self.quality_metric = Some(metric);
        self
    }

    pub fn with_retained_count(mut self, count: RetainedCount) -> Self {
        self.retained_count = count;
        self
    }

    pub fn with_selection_proportion(mut self, proportion: f64) -> Self {
        self.selection_proportion = proportion;
        self
    }

    pub fn with_min_diversity(mut self, threshold: f64) -> Self {
        self.min_diversity = threshold;
        self
    }

    pub fn with_tie_break(mut self, policy: TieBreakPolicy) -> Self {
        self.tie_break_policy = policy;
        self
    }

    pub fn with_quality_weights(mut self) -> Self {
        self.weight_by_quality = true;
        self
    }

    pub fn with_stacking(mut self, stacking: StackingConfig) -> Self {
        self.stacking = stacking;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Quality metric in effect for `kind`
    pub fn quality_metric_for(&self, kind: PredictionKind) -> QualityMetric {
        self.quality_metric
            .unwrap_or_else(|| QualityMetric::default_for(kind))
    }

    /// Parse a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| KolosalError::ConfigError(e.to_string()))
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration makes sense for `kind`
    pub fn validate(&self, kind: PredictionKind) -> Result<()> {
        if !(self.selection_proportion > 0.0 && self.selection_proportion <= 1.0) {
            return Err(KolosalError::ConfigError(format!(
                "selectionProportion must be in (0, 1], got {}",
                self.selection_proportion
            )));
        }
        if !self.min_diversity.is_finite() || self.min_diversity < 0.0 {
            return Err(KolosalError::ConfigError(format!(
                "minDiversity must be a non-negative number, got {}",
                self.min_diversity
            )));
        }
        if self.retained_count == RetainedCount::Fixed(0) {
            return Err(KolosalError::ConfigError(
                "retainedCount must be positive".to_string(),
            ));
        }
        let quality = self.quality_metric_for(kind);
        if !quality.supports(kind) {
            return Err(KolosalError::ConfigError(format!(
                "quality metric {quality} is not available for {kind}"
            )));
        }
        if self.selector_kind == SelectorKind::BestDiverse && !self.diversity_metric.supports(kind) {
            return Err(KolosalError::ConfigError(format!(
                "diversity metric {} is not available for {kind}",
                self.diversity_metric
            )));
        }
        if self.combiner_kind == CombinerKind::Vote && !kind.is_classification() {
            return Err(KolosalError::ConfigError(
                "vote combiner requires a classification kind".to_string(),
            ));
        }
        if self.combiner_kind == CombinerKind::Stacking
            && kind == PredictionKind::BinaryClassification
            && self.stacking.max_iter == 0
        {
            return Err(KolosalError::ConfigError(
                "stacking.maxIter must be positive for binary classification".to_string(),
            ));
        }
        if self.stacking.alpha < 0.0 {
            return Err(KolosalError::ConfigError(format!(
                "stacking.alpha must be >= 0, got {}",
                self.stacking.alpha
            )));
        }
        if self.parallel.n_threads == Some(0) {
            return Err(KolosalError::ConfigError(
                "parallel.nThreads must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

macro_rules! config_enum_names {
    ($ty:ty, $label:literal, { $($variant:path => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }

        impl FromStr for $ty {
            type Err = KolosalError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(KolosalError::ConfigError(format!(
                        concat!("unknown ", $label, " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

config_enum_names!(SelectorKind, "selector kind", {
    SelectorKind::All => "all",
    SelectorKind::Best => "best",
    SelectorKind::BestDiverse => "bestDiverse",
});

config_enum_names!(CombinerKind, "combiner kind", {
    CombinerKind::Median => "median",
    CombinerKind::Average => "average",
    CombinerKind::Vote => "vote",
    CombinerKind::Stacking => "stacking",
});

config_enum_names!(TieBreakPolicy, "tie-break policy", {
    TieBreakPolicy::FirstInserted => "firstInserted",
    TieBreakPolicy::LowestIndex => "lowestIndex",
    TieBreakPolicy::HighestConfidence => "highestConfidence",
});

impl FromStr for RetainedCount {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "auto" {
            return Ok(RetainedCount::Auto);
        }
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(RetainedCount::Fixed(n)),
            _ => Err(KolosalError::ConfigError(format!(
                "retainedCount must be a positive integer or \"auto\", got \"{s}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EnsembleConfig::default();
        assert_eq!(config.selector_kind, SelectorKind::All);
        assert_eq!(config.combiner_kind, CombinerKind::Median);
        assert_eq!(config.retained_count, RetainedCount::Auto);
        assert!(config.validate(PredictionKind::Regression).is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = EnsembleConfig::new()
            .with_selector(SelectorKind::BestDiverse)
            .with_combiner(CombinerKind::Vote)
            .with_retained_count(RetainedCount::Fixed(3))
            .with_tie_break(TieBreakPolicy::HighestConfidence);

        assert_eq!(config.selector_kind, SelectorKind::BestDiverse);
        assert_eq!(config.combiner_kind, CombinerKind::Vote);
        assert_eq!(config.retained_count, RetainedCount::Fixed(3));
        assert_eq!(config.tie_break_policy, TieBreakPolicy::HighestConfidence);
    }

    #[test]
    fn test_parse_json_surface() {
        let json = r#"{
            "selectorKind": "bestDiverse",
            "combinerKind": "vote",
            "diversityMetric": "disagreement",
            "retainedCount": "auto",
            "tieBreakPolicy": "firstInserted"
        }"#;
        let config = EnsembleConfig::from_json_str(json).unwrap();
        assert_eq!(config.selector_kind, SelectorKind::BestDiverse);
        assert_eq!(config.combiner_kind, CombinerKind::Vote);
        assert_eq!(config.retained_count, RetainedCount::Auto);
        assert_eq!(config.tie_break_policy, TieBreakPolicy::FirstInserted);
        assert_eq!(config.selection_proportion, 0.5);

        let config = EnsembleConfig::from_json_str(r#"{"retainedCount": 4}"#).unwrap();
        assert_eq!(config.retained_count, RetainedCount::Fixed(4));
    }

    #[test]
    fn test_rejects_bad_retained_count() {
        assert!(EnsembleConfig::from_json_str(r#"{"retainedCount": 0}"#).is_err());
        assert!(EnsembleConfig::from_json_str(r#"{"retainedCount": "many"}"#).is_err());
        assert!("0".parse::<RetainedCount>().is_err());
        assert_eq!("7".parse::<RetainedCount>().unwrap(), RetainedCount::Fixed(7));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EnsembleConfig::new()
            .with_selector(SelectorKind::Best)
            .with_retained_count(RetainedCount::Fixed(2))
            .with_quality_metric(QualityMetric::L2);
        let json = config.to_json().unwrap();
        assert_eq!(EnsembleConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!("bestDiverse".parse::<SelectorKind>().unwrap(), SelectorKind::BestDiverse);
        assert_eq!(CombinerKind::Stacking.to_string(), "stacking");
        assert_eq!(
            "highestConfidence".parse::<TieBreakPolicy>().unwrap(),
            TieBreakPolicy::HighestConfidence
        );
        assert!("random".parse::<SelectorKind>().is_err());
    }

    #[test]
    fn test_resolve_retained_count() {
        assert_eq!(RetainedCount::Auto.resolve(5, 0.5), 3);
        assert_eq!(RetainedCount::Auto.resolve(1, 0.1), 1);
        assert_eq!(RetainedCount::Fixed(10).resolve(4, 0.5), 4);
    }

    #[test]
    fn test_validate_kind_compatibility() {
        let vote = EnsembleConfig::new().with_combiner(CombinerKind::Vote);
        assert!(vote.validate(PredictionKind::Regression).is_err());
        assert!(vote.validate(PredictionKind::MultiClassClassification).is_ok());

        let divergence = EnsembleConfig::new()
            .with_selector(SelectorKind::BestDiverse)
            .with_diversity_metric(DiversityMetric::Divergence);
        assert!(divergence.validate(PredictionKind::Regression).is_err());
        assert!(divergence.validate(PredictionKind::MultiClassClassification).is_ok());

        let metric = EnsembleConfig::new().with_quality_metric(QualityMetric::Accuracy);
        assert!(metric.validate(PredictionKind::Regression).is_err());

        let proportion = EnsembleConfig::new().with_selection_proportion(0.0);
        assert!(proportion.validate(PredictionKind::Regression).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ensemble.json");
        std::fs::write(&path, r#"{"selectorKind": "best", "retainedCount": 2}"#).unwrap();
        let config = EnsembleConfig::from_file(&path).unwrap();
        assert_eq!(config.selector_kind, SelectorKind::Best);
        assert!(matches!(
            EnsembleConfig::from_file(dir.path().join("missing.json")),
            Err(KolosalError::IoError(_))
        ));
    }
}
