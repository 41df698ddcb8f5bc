use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::pool::{ChatRouter, ClientPool, RandomSelector, Selector};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: Arc<GatewayConfig>,
    pub router: Arc<ChatRouter>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub config_path: Option<PathBuf>,
    pub cors: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("CHATGATE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_empty("CHATGATE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let config_path = env_non_empty("CHATGATE_CONFIG").map(PathBuf::from);
        let cors = env_non_empty("CHATGATE_CORS")
            .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"));
        Self {
            listen,
            metrics_path,
            config_path,
            cors,
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let config = match runtime.config_path.as_deref() {
        Some(path) => GatewayConfig::from_file(path)?,
        None => {
            tracing::warn!("CHATGATE_CONFIG not set, every provider pool is disabled");
            GatewayConfig::default()
        }
    };
    let router = build_router(&config, Arc::new(RandomSelector))?;
    state_with_router(runtime, config, router)
}

/// Builds the primary/backup router for `config` using `selector` in both pools.
pub fn build_router(
    config: &GatewayConfig,
    selector: Arc<dyn Selector>,
) -> AppResult<ChatRouter> {
    let primary =
        ClientPool::from_config("primary", &config.openai, &config.proxy, selector.clone())?;
    let backup =
        ClientPool::from_config("backup", &config.fallback_openai, &config.proxy, selector)?;
    if primary.is_none() && backup.is_none() {
        tracing::warn!("no provider pool is enabled, chat requests will fail");
    }
    Ok(ChatRouter::new(primary, backup))
}

/// Assembles state around an already built router; tests inject fakes here.
pub fn state_with_router(
    runtime: RuntimeConfig,
    config: GatewayConfig,
    router: ChatRouter,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    Ok(AppState {
        runtime: Arc::new(runtime),
        config: Arc::new(config),
        router: Arc::new(router),
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/chat/ws", get(crate::handlers::chat_websocket))
        .route(&metrics_path, get(crate::handlers::metrics))
        .route("/healthz", get(crate::handlers::healthz))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
