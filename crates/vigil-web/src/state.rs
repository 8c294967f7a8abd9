//! Shared application state handed to the handlers.

use std::sync::Arc;

use vigil_core::api::{AlertView, EngineStateView};
use vigil_core::memory::MemoryManager;
use vigil_core::metrics::MetricsRegistry;

/// Snapshot providers the daemon wires in. Everything returns owned
/// copies; handlers never hold locks across awaits.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<MetricsRegistry>,
    pub memory: Arc<MemoryManager>,
    pub recent_alerts: Arc<dyn Fn(usize) -> Vec<AlertView> + Send + Sync>,
    pub engine_state: Arc<dyn Fn() -> EngineStateView + Send + Sync>,
}
