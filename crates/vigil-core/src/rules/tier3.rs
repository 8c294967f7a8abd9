//! Tier 3 — ML inference over the ordered feature vector.
//!
//! The active model follows the IsolationForest convention (higher
//! raw score = more normal). The tier negates it into
//! `normalized = 0.5 - raw` and fires when that clears the configured
//! threshold, with the action mapped from the same bands as Tier 1.

use std::sync::Arc;

use super::{DetectionTier, action_for_score};
use crate::config::Tier3Config;
use crate::ml::{AnomalyModel, IsolationForestModel, ModelMetadata, ModelPool, NormalizationParams};
use crate::model::{Alert, AlertTier, AnalyzedEvent};

pub struct MlTier {
    cfg: Tier3Config,
    pool: Arc<ModelPool>,
    normalization: Vec<NormalizationParams>,
}

impl MlTier {
    /// Load the model described by the metadata sidecar. Failure is
    /// surfaced to the caller, which disables the tier with a warning.
    pub fn from_metadata_file(cfg: &Tier3Config) -> std::io::Result<Self> {
        let meta = ModelMetadata::load(std::path::Path::new(&cfg.model_metadata_path))?;
        let model = Arc::new(IsolationForestModel::from_metadata(&meta));
        let pool = Arc::new(ModelPool::new());
        pool.swap(model);
        Ok(Self {
            cfg: cfg.clone(),
            pool,
            normalization: meta.normalization(),
        })
    }

    /// Build around an existing pool (tests, custom runtimes).
    pub fn with_pool(cfg: Tier3Config, pool: Arc<ModelPool>) -> Self {
        Self {
            cfg,
            pool,
            normalization: Vec::new(),
        }
    }

    /// Normalization parameters from the sidecar, for wiring into the
    /// engine's feature manager.
    pub fn normalization(&self) -> &[NormalizationParams] {
        &self.normalization
    }

    /// The hot-swap pool; swapping in a new model takes effect on the
    /// next event. The caller is responsible for clearing the feature
    /// cache when it swaps.
    pub fn pool(&self) -> Arc<ModelPool> {
        Arc::clone(&self.pool)
    }
}

impl DetectionTier for MlTier {
    fn name(&self) -> &'static str {
        "tier3"
    }

    fn evaluate(&mut self, event: &Arc<AnalyzedEvent>) -> Vec<Alert> {
        if event.feature_vector.is_empty() {
            return Vec::new();
        }
        let Some(model) = self.pool.active() else {
            return Vec::new();
        };

        let raw = model.score(&event.feature_vector);
        let normalized = 0.5 - raw;
        if normalized < self.cfg.anomaly_score_threshold {
            return Vec::new();
        }

        let score_100 = (normalized * 100.0).clamp(0.0, 100.0);
        let alert = Alert::new(
            Arc::clone(event),
            format!("ML anomaly score {normalized:.3} from {}", model.name()),
            AlertTier::Tier3Ml,
            action_for_score(score_100),
            normalized,
        )
        .with_feature_note("High ML Anomaly Score");
        vec![alert]
    }
}
