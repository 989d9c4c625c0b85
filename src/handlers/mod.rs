pub mod dynamic;
pub mod health;
pub mod openai_compat;
pub mod pathways;
pub mod requests;

use crate::config::GatewaySettings;
use crate::engine::PathwayEngine;
use crate::store::DynamicPathwayStore;
use std::sync::Arc;

/// Shared application state handed to every handler
pub struct GatewayState {
    pub engine: PathwayEngine,
    pub store: Arc<DynamicPathwayStore>,
    pub settings: GatewaySettings,
}
