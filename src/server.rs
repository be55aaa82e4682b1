//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Project title, API prefix and version |
//! | `GET`  | `/health` | Liveness (`{"status": "OK"}`) |
//! | `GET`  | `/health/db` | Qdrant reachability |
//! | `*`    | `{api_v1_prefix}/...` | API routes, see [`crate::routes`] |
//!
//! # Error Contract
//!
//! API errors are rendered by [`ApiError`]:
//!
//! ```json
//! { "detail": { "message": "Empty query", "code": "EMPTY_QUERY" } }
//! ```

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use welearn_core::store::{MetadataStore, VectorStore};

use crate::agent::ConversationalAgent;
use crate::chat::ChatService;
use crate::config::Config;
use crate::data_collection::DataCollectionService;
use crate::db;
use crate::embedding::{create_provider, Embedder, ProviderEmbedder, QueryEmbedder};
use crate::error::ApiError;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::micro_learning::MicroLearningService;
use crate::middleware::{cors_layer, monitor_requests, process_time};
use crate::pg_store::PgMetadataStore;
use crate::qdrant::{probe, QdrantStore};
use crate::routes;
use crate::search::SearchService;
use crate::tutor::TutorService;

const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metadata: Arc<dyn MetadataStore>,
    pub search: Arc<SearchService>,
    pub chat: Arc<ChatService>,
    pub agent: Arc<ConversationalAgent>,
    pub tutor: Arc<TutorService>,
    pub micro_learning: Arc<MicroLearningService>,
    pub data_collection: Arc<DataCollectionService>,
}

impl AppState {
    /// Wire the services over the given backends. `chat_llm` serves Q&A and
    /// the agent; `tutor_llm` serves the syllabus pipeline.
    pub fn new(
        config: Config,
        vectors: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
        embedder: Arc<dyn Embedder>,
        chat_llm: Arc<dyn LlmClient>,
        tutor_llm: Arc<dyn LlmClient>,
    ) -> Self {
        let search = Arc::new(SearchService::new(
            vectors,
            Arc::clone(&metadata),
            embedder,
            config.search.clone(),
        ));
        let chat = Arc::new(ChatService::new(Arc::clone(&chat_llm)));
        let agent = Arc::new(ConversationalAgent::new(
            chat_llm,
            Arc::clone(&search),
            config.agent.clone(),
        ));
        let tutor = Arc::new(TutorService::new(
            tutor_llm,
            Arc::clone(&search),
            config.tutor.nb_results,
        ));
        let micro_learning = Arc::new(MicroLearningService::new(
            Arc::clone(&search),
            Arc::clone(&metadata),
        ));
        let data_collection = Arc::new(DataCollectionService::new(
            Arc::clone(&metadata),
            &config.data_collection.origin_prefix,
        ));
        Self {
            config: Arc::new(config),
            metadata,
            search,
            chat,
            agent,
            tutor,
            micro_learning,
            data_collection,
        }
    }
}

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Result<Router> {
    let cors = cors_layer(&state.config.server)?;
    let prefix = state.config.server.api_v1_prefix.clone();

    Ok(Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/health/db", get(handle_health_db))
        .nest(&prefix, routes::api_router(&state))
        .layer(middleware::from_fn_with_state(state.clone(), monitor_requests))
        .layer(middleware::from_fn(process_time))
        .layer(cors)
        .with_state(state))
}

/// Connect the production backends and serve until Ctrl-C or SIGTERM.
pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.server.bind.clone();

    let provider = create_provider(&config.embedding).with_context(|| "Invalid embedding configuration")?;
    info!(
        provider = %config.embedding.provider,
        default_model = provider.model_name(),
        dims = provider.dims(),
        "embedding provider ready"
    );

    let vectors: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(&config.qdrant_url(), &config.qdrant)?);
    let metadata: Arc<dyn MetadataStore> = Arc::new(PgMetadataStore::new(db::connect(&config)?));
    let embedder: Arc<dyn Embedder> = Arc::new(QueryEmbedder::new(
        Arc::new(ProviderEmbedder::new(config.embedding.clone())),
        config.embedding.cache_size,
    ));
    let chat_llm: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(config.chat.llm.clone()).with_context(|| "Failed to configure chat LLM")?,
    );
    let tutor_llm: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(config.tutor.llm.clone()).with_context(|| "Failed to configure tutor LLM")?,
    );

    let state = AppState::new(config, vectors, metadata, embedder, chat_llm, tutor_llm);
    if let Err(e) = state.search.get_collections().await {
        warn!(error = %e, "could not list collections at startup");
    }
    let app = build_router(state)?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(%bind_addr, "WeLearn API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

/// Resolve when `signal` fires. A handler that cannot be installed never
/// resolves, so the other signal still governs shutdown.
async fn signal_or_pending<F>(name: &str, signal: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, signal = name, "failed to install signal handler");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = signal_or_pending("CTRL+C", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = signal_or_pending("SIGTERM", async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?.recv().await;
        Ok(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

// ============ GET / ============

#[derive(Serialize)]
struct RootResponse {
    title: String,
    api_version: String,
    semver: String,
}

async fn handle_root(State(state): State<AppState>) -> Json<RootResponse> {
    let server = &state.config.server;
    Json(RootResponse {
        title: server.project_name.clone(),
        api_version: server.api_v1_prefix.clone(),
        semver: server.semver.clone(),
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
    })
}

// ============ GET /health/db ============

/// Report the `status` field of `GET {qdrant}/collections`. A body that is
/// not JSON answers 403.
async fn handle_health_db(State(state): State<AppState>) -> Response {
    let url = state.config.qdrant_url();
    match probe(&url, state.config.qdrant.api_key.as_deref(), DB_PROBE_TIMEOUT).await {
        Ok(status) => Json(HealthResponse { status }).into_response(),
        Err(e) if e.downcast_ref::<reqwest::Error>().is_some_and(|r| r.is_decode()) => {
            error!(error = %e, "qdrant health probe returned invalid JSON");
            (StatusCode::FORBIDDEN, Json(json!({ "detail": "Forbidden" }))).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
