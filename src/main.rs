use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;

mod bus;
mod callbacks;
mod chunking;
mod config;
mod context;
mod engine;
mod error;
mod handlers;
mod pathway;
mod plugins;
mod registry;
mod routes;
mod store;
mod streaming;
mod tokens;

use crate::bus::PubSubBus;
use crate::callbacks::ClientToolCallbacks;
use crate::config::{GatewaySettings, StorageType};
use crate::context::{ContextStore, MemoryContextStore, RedisContextStore};
use crate::engine::PathwayEngine;
use crate::handlers::GatewayState;
use crate::pathway::builtin;
use crate::plugins::{OpenAiChatPlugin, PluginRegistry};
use crate::registry::RequestRegistry;
use crate::routes::configure_routes;
use crate::store::{DynamicPathwayStore, LocalFileBackend, RedisBlobBackend, StorageBackend};

const SWEEP_INTERVAL_SECS: u64 = 60;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging; tracing's log bridge also captures log:: records
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load gateway settings from environment
    let settings = match GatewaySettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load gateway settings from environment: {}", e);
            log::error!("Cannot start server without valid settings");
            std::process::exit(1);
        }
    };

    // Pub/sub bus: local broker, mirrored through Redis when configured
    let pubsub = match &settings.bus.redis_url {
        Some(redis_url) => match PubSubBus::with_redis(redis_url).await {
            Ok(bus) => {
                log::info!("Cross-instance bus mirror connected");
                bus
            }
            Err(e) => {
                log::error!("Failed to connect the bus mirror: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            log::info!("No BUS_REDIS_URL set; running in single-instance mode");
            PubSubBus::local_only()
        }
    };

    // Request registry with its idle sweep
    let request_registry = RequestRegistry::new(settings.timeouts.request_idle_timeout_secs);
    registry::start_cleanup_task(request_registry.clone(), SWEEP_INTERVAL_SECS);

    // Client-tool callbacks: cross-instance listener plus watchdog sweep
    let client_callbacks =
        ClientToolCallbacks::new(pubsub.clone(), settings.timeouts.client_tool_timeout_secs);
    client_callbacks.start_listener();
    callbacks::start_cleanup_task(
        client_callbacks.clone(),
        SWEEP_INTERVAL_SECS,
        settings.timeouts.client_tool_cleanup_max_age_secs,
    );

    // Context blobs share the bus Redis when present
    let context_store: Arc<dyn ContextStore> = match &settings.bus.redis_url {
        Some(redis_url) => match RedisContextStore::connect(redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                log::error!("Failed to connect the context store: {}", e);
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryContextStore::new()),
    };

    // Default model plugin
    let plugin = Arc::new(OpenAiChatPlugin::new("openai", &settings.model));
    let plugin_registry = PluginRegistry::new(plugin);

    // The engine, with the built-in pathway set installed
    let engine = PathwayEngine::new(
        request_registry,
        pubsub,
        client_callbacks,
        context_store,
        plugin_registry,
        settings.timeouts.default_timeout_secs,
    );
    engine.install_pathways(builtin::builtin_pathways(&settings.model.default_model));
    log::info!("Pathway engine initialized with built-in pathways");

    // Dynamic pathway storage backend
    let backend: Arc<dyn StorageBackend> = match settings.storage.storage_type {
        StorageType::Local => Arc::new(LocalFileBackend::new(&settings.storage.path)),
        StorageType::Redis => {
            let redis_url = settings
                .storage
                .redis_url
                .as_deref()
                .expect("validated at settings load");
            let key = format!("pathway-gateway:{}", settings.storage.path);
            match RedisBlobBackend::connect(redis_url, key).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    log::error!("Failed to connect the pathway storage backend: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };
    let pathway_store = Arc::new(DynamicPathwayStore::new(
        backend,
        settings.storage.publish_key.clone(),
        settings.model.default_model.clone(),
        settings.storage.poll_interval_secs,
    ));
    log::info!("Dynamic pathway store initialized");

    let host = settings.server.host.clone();
    let port = settings.server.port;
    log::info!("Starting server at http://{}:{}", host, port);

    let listener = TcpListener::bind(format!("{}:{}", host, port))?;

    let state = web::Data::new(GatewayState {
        engine,
        store: pathway_store,
        settings: settings.clone(),
    });

    HttpServer::new(move || {
        let settings = settings.clone();

        // Configure CORS using actix-cors
        let mut cors = Cors::default().supports_credentials();
        if settings.server.cors_origins.contains(&"*".to_string()) {
            cors = cors.allow_any_origin();
        } else {
            for origin in &settings.server.cors_origins {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors.allow_any_method().allow_any_header();

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .service(
                web::resource("/health")
                    .route(web::get().to(handlers::health::health_check)),
            )
            // OpenAI-compatible surface for clients speaking that protocol
            .service(
                web::resource("/v1/chat/completions")
                    .route(web::post().to(handlers::openai_compat::chat_completions)),
            )
            .service(web::scope("/api").configure(configure_routes))
    })
    .listen(listener)?
    .run()
    .await
}
