use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub bus: BusConfig,
    pub timeouts: TimeoutConfig,
    pub model: ModelConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Redis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    pub path: String,
    pub redis_url: Option<String>,
    /// Key gating every dynamic-pathway mutation, on top of per-record secrets
    pub publish_key: Option<String>,
    /// Seconds between last-modified polls of the shared document
    pub poll_interval_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    /// Unset means single-instance mode: the local broker only
    pub redis_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub default_timeout_secs: u64,
    pub client_tool_timeout_secs: u64,
    pub client_tool_cleanup_max_age_secs: u64,
    pub request_idle_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub context_window: usize,
    pub prompt_token_ratio: f64,
    pub truncate_from_front: bool,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self, GatewayError> {
        // App config
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "pathway-gateway".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        // Server config
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| {
                GatewayError::Configuration("SERVER_PORT must be a valid port number".to_string())
            })?;

        // CORS origins
        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        // Pathway storage
        let storage_type = match env::var("STORAGE_TYPE")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageType::Local,
            "redis" => StorageType::Redis,
            other => {
                return Err(GatewayError::Configuration(format!(
                    "STORAGE_TYPE must be one of local, redis (got '{}')",
                    other
                )));
            }
        };

        let storage_path =
            env::var("STORAGE_PATH").unwrap_or_else(|_| "pathways.json".to_string());

        let storage_redis_url = env::var("STORAGE_REDIS_URL").ok();
        if storage_type == StorageType::Redis && storage_redis_url.is_none() {
            return Err(GatewayError::Configuration(
                "STORAGE_REDIS_URL must be set when STORAGE_TYPE=redis".to_string(),
            ));
        }

        let publish_key = env::var("PUBLISH_KEY").ok();

        let storage_poll_interval_secs = env::var("STORAGE_POLL_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "STORAGE_POLL_INTERVAL_SECONDS must be a valid number".to_string(),
                )
            })?;

        // Cross-instance bus
        let bus_redis_url = env::var("BUS_REDIS_URL").ok();

        // Timeouts
        let default_timeout_secs = env::var("DEFAULT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "120".to_string())
            .parse::<u64>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "DEFAULT_TIMEOUT_SECONDS must be a valid number".to_string(),
                )
            })?;

        let client_tool_timeout_secs = env::var("CLIENT_TOOL_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "CLIENT_TOOL_TIMEOUT_SECONDS must be a valid number".to_string(),
                )
            })?;

        let client_tool_cleanup_max_age_secs = env::var("CLIENT_TOOL_CLEANUP_MAX_AGE_SECONDS")
            .unwrap_or_else(|_| "600".to_string())
            .parse::<u64>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "CLIENT_TOOL_CLEANUP_MAX_AGE_SECONDS must be a valid number".to_string(),
                )
            })?;

        let request_idle_timeout_secs = env::var("REQUEST_IDLE_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "REQUEST_IDLE_TIMEOUT_SECONDS must be a valid number".to_string(),
                )
            })?;

        // Default model plugin
        let model_api_base = env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model_api_key = env::var("OPENAI_API_KEY").ok();
        let default_model =
            env::var("DEFAULT_MODEL_NAME").unwrap_or_else(|_| "gpt-4o".to_string());

        let model_context_window = env::var("DEFAULT_MODEL_CONTEXT_WINDOW")
            .unwrap_or_else(|_| "128000".to_string())
            .parse::<usize>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "DEFAULT_MODEL_CONTEXT_WINDOW must be a valid number".to_string(),
                )
            })?;

        let prompt_token_ratio = env::var("DEFAULT_MODEL_PROMPT_RATIO")
            .unwrap_or_else(|_| "0.5".to_string())
            .parse::<f64>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "DEFAULT_MODEL_PROMPT_RATIO must be a valid number".to_string(),
                )
            })?;
        if !(prompt_token_ratio > 0.0 && prompt_token_ratio <= 1.0) {
            return Err(GatewayError::Configuration(
                "DEFAULT_MODEL_PROMPT_RATIO must be in (0, 1]".to_string(),
            ));
        }

        let truncate_from_front = env::var("DEFAULT_MODEL_TRUNCATE_FROM_FRONT")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .map_err(|_| {
                GatewayError::Configuration(
                    "DEFAULT_MODEL_TRUNCATE_FROM_FRONT must be true or false".to_string(),
                )
            })?;

        Ok(Self {
            app: AppConfig {
                name: app_name,
                environment,
            },
            server: ServerConfig {
                host: server_host,
                port: server_port,
                cors_origins,
            },
            storage: StorageConfig {
                storage_type,
                path: storage_path,
                redis_url: storage_redis_url,
                publish_key,
                poll_interval_secs: storage_poll_interval_secs,
            },
            bus: BusConfig {
                redis_url: bus_redis_url,
            },
            timeouts: TimeoutConfig {
                default_timeout_secs,
                client_tool_timeout_secs,
                client_tool_cleanup_max_age_secs,
                request_idle_timeout_secs,
            },
            model: ModelConfig {
                api_base: model_api_base,
                api_key: model_api_key,
                default_model,
                context_window: model_context_window,
                prompt_token_ratio,
                truncate_from_front,
            },
        })
    }
}
