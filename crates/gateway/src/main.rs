mod api;
mod cli;
mod config;
mod state;


use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use ra_bus::{Bus, InMemoryBus};
use ra_domain::config::ConfigSeverity;
use ra_generation::GenerationRegistry;
use ra_logger::{Logger, PersistentLogger};
use ra_memory::MemoryManager;
use ra_providers::LlmRouter;
use ra_store::{DurableStore, JsonlStore};
use ra_tools::ToolRegistry;

use cli::{Cli, Command, ConfigCommand};
use config::GatewayConfig;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = Cli::parse();

    match parsed.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (gateway_config, _config_path) = config::load_config()?;
            run_server(gateway_config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (gateway_config, config_path) = config::load_config()?;
            if !cli::validate(&gateway_config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (gateway_config, _config_path) = config::load_config()?;
            cli::show(&gateway_config);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ra_gateway=debug")))
        .json()
        .init();
}

async fn run_server(gateway_config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!("red-ai gateway starting");

    let issues = gateway_config.validate();
    config::log_validation_issues(&issues);
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let config = gateway_config.core.clone();

    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
    tracing::info!(url = %config.bus.url, "bus ready");

    let store: Arc<dyn DurableStore> = Arc::new(
        JsonlStore::new(&config.store.data_dir).context("initializing durable store")?,
    );
    tracing::info!(data_dir = %config.store.data_dir, "durable store ready");

    let memory = Arc::new(MemoryManager::new(bus.clone(), store.clone(), config.memory.clone()));
    let generation = Arc::new(GenerationRegistry::new(bus.clone(), store.clone(), config.generation.clone()));

    let logger: Arc<dyn Logger> = Arc::new(PersistentLogger::new(
        bus.clone(),
        store.clone(),
        config.logger.log_ttl_secs,
        std::time::Duration::from_secs(config.logger.flush_interval_secs),
        config.logger.flush_batch_size,
    ));

    let router = Arc::new(LlmRouter::from_config(&config.llm).context("initializing LLM providers")?);
    if router.registry().is_empty() {
        tracing::warn!("no LLM providers initialized — /models will be empty and chat completions will fail");
    } else {
        tracing::info!(providers = router.registry().len(), "LLM provider registry ready");
    }

    let node_id = uuid::Uuid::new_v4().to_string();

    let tools = if gateway_config.mcp.servers.is_empty() {
        tracing::info!("no MCP servers configured");
        Arc::new(ToolRegistry::empty(bus.clone()))
    } else {
        tracing::info!(count = gateway_config.mcp.servers.len(), "connecting MCP servers");
        let registry = ToolRegistry::from_config(bus.clone(), &gateway_config.mcp, &node_id).await;
        tracing::info!(tools = registry.list_tools().len(), "MCP tools discovered");
        Arc::new(registry)
    };

    let engine = Arc::new(ra_engine::Engine::new(
        bus.clone(),
        store,
        memory,
        generation,
        logger,
        router.clone(),
        tools,
        config.graph.clone(),
        config.stream.clone(),
        config.server.system_prompt.clone(),
    ));

    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.heartbeat_loop(node_id).await });
    }

    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var) {
            Ok(token) if !token.is_empty() => {
                tracing::info!(env_var = %env_var, "API bearer-token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(env_var = %env_var, "API bearer-token auth DISABLED — dev mode, unauthenticated requests accepted");
                None
            }
        }
    };

    let state = AppState {
        config: Arc::new(gateway_config),
        engine,
        bus,
        llm_router: router,
        api_token_hash,
    };

    let cors_layer = build_cors_layer(&config.server.cors);

    let max_concurrent = std::env::var("RA_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    let app = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "red-ai gateway listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins. Origins may
/// carry a trailing `:*` port wildcard (e.g. `http://localhost:*`);
/// a literal `"*"` allows every origin.
fn build_cors_layer(cors: &ra_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
