//! Tiered detection cascade.
//!
//! A stateless dispatcher feeds each [`AnalyzedEvent`] through the
//! configured tiers in order, accumulating alerts. Tiers that are
//! disabled in configuration are simply not constructed.

pub mod tier1;
pub mod tier2;
pub mod tier3;
pub mod tier4;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::model::{Alert, AnalyzedEvent};

/// One level of the detection cascade.
pub trait DetectionTier: Send {
    fn name(&self) -> &'static str;
    fn evaluate(&mut self, event: &Arc<AnalyzedEvent>) -> Vec<Alert>;
}

pub struct RuleEngine {
    tiers: Vec<Box<dyn DetectionTier>>,
}

impl RuleEngine {
    /// Build the cascade from configuration. Tier 3 is skipped (with a
    /// warning upstream) when its model failed to load.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut tiers: Vec<Box<dyn DetectionTier>> = Vec::new();
        if cfg.tier1.enabled {
            tiers.push(Box::new(tier1::HeuristicTier::new(cfg.tier1.clone())));
        }
        if cfg.tier2.enabled {
            tiers.push(Box::new(tier2::StatisticalTier::new(cfg.tier2.clone())));
        }
        if cfg.tier3.enabled {
            match tier3::MlTier::from_metadata_file(&cfg.tier3) {
                Ok(tier) => tiers.push(Box::new(tier)),
                Err(e) => {
                    tracing::warn!("ml tier disabled: {e}");
                }
            }
        }
        if cfg.tier4.enabled {
            tiers.push(Box::new(tier4::ExternalTier::new(cfg.tier4.clone())));
        }
        Self { tiers }
    }

    pub fn with_tiers(tiers: Vec<Box<dyn DetectionTier>>) -> Self {
        Self { tiers }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Run the cascade; alerts come back in tier order.
    pub fn evaluate(&mut self, event: &Arc<AnalyzedEvent>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for tier in &mut self.tiers {
            alerts.extend(tier.evaluate(event));
        }
        alerts
    }
}

/// Map a 0–100 heuristic score onto the suggested action.
pub(crate) fn action_for_score(score: f64) -> crate::model::AlertAction {
    use crate::model::AlertAction;
    if score >= 80.0 {
        AlertAction::Block
    } else if score >= 50.0 {
        AlertAction::RateLimit
    } else if score >= 20.0 {
        AlertAction::Challenge
    } else {
        AlertAction::Log
    }
}
