//! Feature extraction, training-data collection and the anomaly model
//! pool used by the ML detection tier.

pub mod collector;
pub mod features;
pub mod model;

pub use collector::MlDataCollector;
pub use features::{FEATURE_VECTOR_SIZE, FeatureManager, NormalizationParams};
pub use model::{AnomalyModel, IsolationForestModel, ModelMetadata, ModelPool};
