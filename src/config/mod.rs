pub mod settings;

use tracing::info;

pub use settings::{GatewaySettings, StorageType};

/// Initialize application configuration
pub fn init_config() -> Result<settings::GatewaySettings, Box<dyn std::error::Error>> {
    info!("Initializing gateway configuration from environment");
    let config = settings::GatewaySettings::from_env()?;
    Ok(config)
}
