//! Anomaly model loading and hot-swapping.
//!
//! The scorer follows the scikit-learn IsolationForest convention:
//! higher raw score = more normal. The JSON metadata sidecar carries
//! both the per-feature normalization parameters and the serialized
//! trees, so one file fully describes a deployed model.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::info;

use super::features::{FEATURE_VECTOR_SIZE, NormalizationParams};

/// Slots in the hot-swap pool.
pub const MODEL_POOL_SIZE: usize = 4;

pub trait AnomalyModel: Send + Sync {
    /// Raw anomaly score; higher = more normal.
    fn score(&self, features: &[f32]) -> f64;
    fn name(&self) -> &str;
}

/// One node of a serialized isolation tree. Leaves carry `size`; splits
/// carry a feature index, threshold and child indices.
#[derive(Clone, Debug, Deserialize)]
pub struct TreeNode {
    #[serde(default)]
    pub feature: usize,
    #[serde(default)]
    pub threshold: f32,
    #[serde(default)]
    pub left: i32,
    #[serde(default)]
    pub right: i32,
    /// Samples that reached this node during training; > 0 for leaves.
    #[serde(default)]
    pub size: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IsolationTree {
    pub nodes: Vec<TreeNode>,
}

/// Sidecar layout: normalization parameters + forest.
#[derive(Debug, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub feature_means: Vec<f64>,
    #[serde(default)]
    pub feature_stds: Vec<f64>,
    pub trees: Vec<IsolationTree>,
    /// Subsample size used during training; drives path normalization.
    pub subsample_size: u32,
}

impl ModelMetadata {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| std::io::Error::other(format!("bad model metadata: {e}")))
    }

    pub fn normalization(&self) -> Vec<NormalizationParams> {
        (0..FEATURE_VECTOR_SIZE)
            .map(|i| NormalizationParams {
                mean: self.feature_means.get(i).copied().unwrap_or(0.0),
                std_dev: self.feature_stds.get(i).copied().unwrap_or(1.0),
            })
            .collect()
    }
}

/// Average path length of unsuccessful BST search, the isolation
/// forest normalizer `c(n)`.
fn average_path_length(n: f64) -> f64 {
    if n <= 1.0 {
        return 0.0;
    }
    let harmonic = (n - 1.0).ln() + 0.577_215_664_901_532_9;
    2.0 * harmonic - 2.0 * (n - 1.0) / n
}

pub struct IsolationForestModel {
    name: String,
    trees: Vec<IsolationTree>,
    expected_depth: f64,
}

impl IsolationForestModel {
    pub fn from_metadata(meta: &ModelMetadata) -> Self {
        Self {
            name: if meta.model_name.is_empty() {
                "isolation_forest".to_string()
            } else {
                meta.model_name.clone()
            },
            trees: meta.trees.clone(),
            expected_depth: average_path_length(meta.subsample_size.max(2) as f64),
        }
    }

    fn path_length(tree: &IsolationTree, features: &[f32]) -> f64 {
        let mut depth = 0.0;
        let mut idx = 0usize;
        loop {
            let Some(node) = tree.nodes.get(idx) else {
                return depth;
            };
            let is_leaf = node.left < 0 && node.right < 0;
            if is_leaf {
                // Unsplit leaf mass contributes its expected depth.
                return depth + average_path_length(node.size as f64);
            }
            let value = features.get(node.feature).copied().unwrap_or(0.0);
            let next = if value < node.threshold {
                node.left
            } else {
                node.right
            };
            if next < 0 {
                return depth + 1.0;
            }
            idx = next as usize;
            depth += 1.0;
        }
    }
}

impl AnomalyModel for IsolationForestModel {
    /// Mapped to `0.5 - 2^(-E[h(x)] / c(n))`: positive for normal
    /// points, negative for anomalies (sklearn `score_samples` + 0.5
    /// offset convention).
    fn score(&self, features: &[f32]) -> f64 {
        if self.trees.is_empty() || self.expected_depth <= 0.0 {
            return 0.5;
        }
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|t| Self::path_length(t, features))
            .sum::<f64>()
            / self.trees.len() as f64;
        0.5 - 2f64.powf(-mean_path / self.expected_depth)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Hot-swap pool: a fixed array of model slots plus an atomic active
/// index. Swapping installs into a free (or the oldest) slot and
/// atomically repoints the index; in-flight scorers keep their `Arc`.
pub struct ModelPool {
    slots: Mutex<[Option<Arc<dyn AnomalyModel>>; MODEL_POOL_SIZE]>,
    active: AtomicUsize,
}

impl Default for ModelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelPool {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            active: AtomicUsize::new(0),
        }
    }

    /// Install a model and make it active. Returns the slot index.
    pub fn swap(&self, model: Arc<dyn AnomalyModel>) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let current = self.active.load(Ordering::Acquire);
        // Prefer an empty slot; otherwise overwrite the slot after the
        // active one (round-robin, never the active slot itself).
        let idx = slots
            .iter()
            .position(Option::is_none)
            .unwrap_or((current + 1) % MODEL_POOL_SIZE);
        info!("activating model '{}' in slot {idx}", model.name());
        slots[idx] = Some(model);
        self.active.store(idx, Ordering::Release);
        idx
    }

    pub fn active(&self) -> Option<Arc<dyn AnomalyModel>> {
        let idx = self.active.load(Ordering::Acquire);
        self.slots.lock().unwrap()[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(size: u32) -> TreeNode {
        TreeNode {
            feature: 0,
            threshold: 0.0,
            left: -1,
            right: -1,
            size,
        }
    }

    fn split(feature: usize, threshold: f32, left: i32, right: i32) -> TreeNode {
        TreeNode {
            feature,
            threshold,
            left,
            right,
            size: 0,
        }
    }

    /// A stump isolating feature-0 > 0.5 at depth 1; everything else
    /// lands in a deep, dense leaf.
    fn forest() -> IsolationForestModel {
        let tree = IsolationTree {
            nodes: vec![
                split(0, 0.5, 1, 2),
                leaf(200), // feature0 < 0.5: dense, deep region
                leaf(1),   // feature0 >= 0.5: isolated
            ],
        };
        IsolationForestModel {
            name: "test".to_string(),
            trees: vec![tree; 10],
            expected_depth: average_path_length(256.0),
        }
    }

    #[test]
    fn test_isolated_point_scores_lower() {
        let model = forest();
        let mut normal = vec![0.0f32; FEATURE_VECTOR_SIZE];
        normal[0] = 0.1;
        let mut anomalous = normal.clone();
        anomalous[0] = 0.9;

        let normal_score = model.score(&normal);
        let anomalous_score = model.score(&anomalous);
        assert!(
            normal_score > anomalous_score,
            "normal {normal_score} should exceed anomalous {anomalous_score}"
        );
        // The isolated point sits on the anomalous side of 0.
        assert!(anomalous_score < 0.1);
    }

    #[test]
    fn test_empty_forest_is_neutral() {
        let model = IsolationForestModel {
            name: "empty".to_string(),
            trees: Vec::new(),
            expected_depth: 0.0,
        };
        assert_eq!(model.score(&[0.0; FEATURE_VECTOR_SIZE]), 0.5);
    }

    #[test]
    fn test_metadata_parse() {
        let json = r#"{
            "model_name": "if-v3",
            "feature_means": [1.0, 2.0],
            "feature_stds": [0.5, 1.5],
            "subsample_size": 256,
            "trees": [
                {"nodes": [
                    {"feature": 0, "threshold": 0.5, "left": 1, "right": 2},
                    {"left": -1, "right": -1, "size": 10},
                    {"left": -1, "right": -1, "size": 1}
                ]}
            ]
        }"#;
        let meta: ModelMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.model_name, "if-v3");
        assert_eq!(meta.trees.len(), 1);
        let norm = meta.normalization();
        assert_eq!(norm.len(), FEATURE_VECTOR_SIZE);
        assert_eq!(norm[0].mean, 1.0);
        assert_eq!(norm[2].std_dev, 1.0, "missing tail keeps identity scale");
    }

    #[test]
    fn test_pool_swap_changes_active() {
        let pool = ModelPool::new();
        assert!(pool.active().is_none());

        let a = Arc::new(IsolationForestModel {
            name: "a".to_string(),
            trees: Vec::new(),
            expected_depth: 1.0,
        });
        let b = Arc::new(IsolationForestModel {
            name: "b".to_string(),
            trees: Vec::new(),
            expected_depth: 1.0,
        });
        pool.swap(a);
        assert_eq!(pool.active().unwrap().name(), "a");
        pool.swap(b);
        assert_eq!(pool.active().unwrap().name(), "b");
    }
}
