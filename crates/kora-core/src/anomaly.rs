//! Outlier detection over a bounded per-tag history window.
//!
//! Two strategies are chosen by availability: an offline-trained per-tag
//! Gaussian baseline when one exists for the tag, otherwise a fixed safety
//! threshold. Detection never fails; problems surface as a zero-confidence
//! result whose explanation names the cause.

use crate::error::ModelError;
use crate::tags::TagId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;
pub const DEFAULT_SAFETY_LIMIT: f64 = 100.0;

const MIN_FIT_SAMPLES: usize = 2;
const NORMAL_HEURISTIC_CONFIDENCE: f64 = 0.5;

/// Most recent readings for one tag.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_back();
        }
        self.values.push_front(value);
    }

    /// Values ordered newest-first.
    pub fn newest_first(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    Model,
    Threshold,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyResult {
    pub tag_id: TagId,
    pub is_anomaly: bool,
    /// Always within `[0, 1]`; zero when detection could not run.
    pub confidence: f64,
    pub explanation: String,
    pub window_size: usize,
    pub strategy: DetectionStrategy,
}

impl AnomalyResult {
    fn unavailable(tag_id: &TagId, window_size: usize, cause: String) -> Self {
        Self {
            tag_id: tag_id.clone(),
            is_anomaly: false,
            confidence: 0.0,
            explanation: format!("detection unavailable: {cause}"),
            window_size,
            strategy: DetectionStrategy::Unavailable,
        }
    }
}

/// Learned distribution of one tag's values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std: f64,
    pub samples: usize,
}

impl Baseline {
    /// Welford's online mean/variance over the finite values.
    pub fn fit(tag: &TagId, values: &[f64]) -> Result<Self, ModelError> {
        let mut count = 0usize;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for &value in values.iter().filter(|v| v.is_finite()) {
            count += 1;
            let delta = value - mean;
            mean += delta / count as f64;
            m2 += delta * (value - mean);
        }
        if count < MIN_FIT_SAMPLES {
            return Err(ModelError::InsufficientSamples {
                tag: tag.to_string(),
                samples: count,
                required: MIN_FIT_SAMPLES,
            });
        }
        Ok(Self {
            mean,
            std: (m2 / (count - 1) as f64).sqrt(),
            samples: count,
        })
    }

    /// Standard deviation with a floor, so a flat baseline never divides by zero.
    pub fn effective_std(&self) -> f64 {
        let floor = (self.mean.abs() * 1e-3).max(1e-6);
        self.std.max(floor)
    }

    fn validate(&self, tag: &TagId) -> Result<(), ModelError> {
        let reason = if !self.mean.is_finite() {
            "mean is not finite"
        } else if !self.std.is_finite() || self.std < 0.0 {
            "std must be finite and non-negative"
        } else if self.samples == 0 {
            "no samples"
        } else {
            return Ok(());
        };
        Err(ModelError::InvalidBaseline {
            tag: tag.to_string(),
            reason: reason.to_string(),
        })
    }
}

fn default_z_threshold() -> f64 {
    DEFAULT_Z_THRESHOLD
}

/// Unsupervised per-tag outlier scorer, trained offline and stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default)]
    baselines: BTreeMap<TagId, Baseline>,
}

impl BaselineModel {
    pub fn new(z_threshold: f64) -> Self {
        Self {
            z_threshold,
            baselines: BTreeMap::new(),
        }
    }

    pub fn fit_tag(&mut self, tag: &TagId, values: &[f64]) -> Result<Baseline, ModelError> {
        let baseline = Baseline::fit(tag, values)?;
        self.baselines.insert(tag.clone(), baseline);
        Ok(baseline)
    }

    pub fn baseline(&self, tag: &TagId) -> Option<&Baseline> {
        self.baselines.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &TagId> {
        self.baselines.keys()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let model: Self =
            serde_json::from_str(raw).map_err(|e| ModelError::Corrupt(e.to_string()))?;
        if !model.z_threshold.is_finite() || model.z_threshold <= 0.0 {
            return Err(ModelError::Corrupt(format!(
                "z_threshold must be positive, got {}",
                model.z_threshold
            )));
        }
        for (tag, baseline) in &model.baselines {
            baseline.validate(tag)?;
        }
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ModelError::Corrupt(e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fixed-constant heuristic used when no trained baseline is available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdHeuristic {
    pub safety_limit: f64,
}

impl Default for ThresholdHeuristic {
    fn default() -> Self {
        Self {
            safety_limit: DEFAULT_SAFETY_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    model: Option<BaselineModel>,
    fallback: ThresholdHeuristic,
}

impl AnomalyDetector {
    pub fn new(fallback: ThresholdHeuristic) -> Self {
        Self {
            model: None,
            fallback,
        }
    }

    pub fn with_model(mut self, model: BaselineModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Load the model at `path`; on failure log it and run on the fallback.
    pub fn from_model_file(path: &Path, fallback: ThresholdHeuristic) -> Self {
        match BaselineModel::load(path) {
            Ok(model) => {
                log::info!(
                    "Loaded anomaly model from {} ({} tags)",
                    path.display(),
                    model.len()
                );
                Self::new(fallback).with_model(model)
            }
            Err(e) => {
                log::warn!(
                    "Anomaly model unavailable ({}); using safety threshold {}",
                    e,
                    fallback.safety_limit
                );
                Self::new(fallback)
            }
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Score the newest value of `history` (ordered newest-first).
    pub fn detect(&self, tag_id: &TagId, history: &[f64]) -> AnomalyResult {
        let window_size = history.len();
        let Some(&latest) = history.first() else {
            return AnomalyResult::unavailable(tag_id, 0, "no readings in window".to_string());
        };
        if !latest.is_finite() {
            return AnomalyResult::unavailable(
                tag_id,
                window_size,
                format!("latest value {latest} is not finite"),
            );
        }

        if let Some(model) = &self.model {
            if let Some(baseline) = model.baseline(tag_id) {
                return match score_baseline(model.z_threshold, baseline, tag_id, latest) {
                    Ok((is_anomaly, confidence, explanation)) => AnomalyResult {
                        tag_id: tag_id.clone(),
                        is_anomaly,
                        confidence,
                        explanation,
                        window_size,
                        strategy: DetectionStrategy::Model,
                    },
                    Err(e) => {
                        log::warn!("Anomaly model failed for {}: {}", tag_id, e);
                        AnomalyResult::unavailable(tag_id, window_size, format!("model error: {e}"))
                    }
                };
            }
        }

        let (is_anomaly, confidence, explanation) = score_threshold(&self.fallback, latest);
        AnomalyResult {
            tag_id: tag_id.clone(),
            is_anomaly,
            confidence,
            explanation,
            window_size,
            strategy: DetectionStrategy::Threshold,
        }
    }
}

fn score_baseline(
    z_threshold: f64,
    baseline: &Baseline,
    tag_id: &TagId,
    latest: f64,
) -> Result<(bool, f64, String), ModelError> {
    baseline.validate(tag_id)?;
    if !z_threshold.is_finite() || z_threshold <= 0.0 {
        return Err(ModelError::Corrupt(format!(
            "z_threshold must be positive, got {z_threshold}"
        )));
    }

    let std = baseline.effective_std();
    let z = (latest - baseline.mean).abs() / std;
    let upper = baseline.mean + z_threshold * std;
    let lower = baseline.mean - z_threshold * std;

    if z > z_threshold {
        let confidence = (1.0 - 0.5 * (z_threshold / z).powi(2)).clamp(0.0, 1.0);
        let explanation = if latest > baseline.mean {
            format!(
                "value {latest:.2} exceeds learned threshold {upper:.2} (mean {:.2}, z-score {z:.1})",
                baseline.mean
            )
        } else {
            format!(
                "value {latest:.2} falls below learned threshold {lower:.2} (mean {:.2}, z-score {z:.1})",
                baseline.mean
            )
        };
        Ok((true, confidence, explanation))
    } else {
        let confidence = (1.0 - 0.5 * (z / z_threshold).powi(2)).clamp(0.0, 1.0);
        Ok((
            false,
            confidence,
            format!(
                "value {latest:.2} within learned range [{lower:.2}, {upper:.2}] (z-score {z:.1})"
            ),
        ))
    }
}

fn score_threshold(heuristic: &ThresholdHeuristic, latest: f64) -> (bool, f64, String) {
    let limit = heuristic.safety_limit;
    if latest > limit {
        let excess = (latest - limit) / limit.abs().max(1.0);
        let confidence = (0.9 + 0.1 * excess.min(1.0)).min(1.0);
        (
            true,
            confidence,
            format!("value {latest:.2} exceeds safety threshold {limit:.2}"),
        )
    } else {
        (
            false,
            NORMAL_HEURISTIC_CONFIDENCE,
            format!("value {latest:.2} is within safety threshold {limit:.2}"),
        )
    }
}
