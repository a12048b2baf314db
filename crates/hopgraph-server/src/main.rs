use anyhow::Context;
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use bytes::Bytes;
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hopgraph_core::{EngineError, RetrievalPlan, SchemaRegistry, SearchQuery};
use hopgraph_engine::{Engine, EngineConfig, HashingEmbedder, RequestContext};
use hopgraph_storage::{dump, InMemoryStore};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod caps;
mod metrics;
use caps::{CapKeys, RateLimiter, Rejection, ADMIN_SCOPE};
use metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_SECONDS, LOADED_DOCUMENTS, STREAM_CLIENTS};

const DEFAULT_EMBED_DIMS: usize = 256;

#[derive(Clone)]
struct AppState {
    engine: Engine,
    caps: CapKeys,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    fn authorize(&self, headers: &HeaderMap, scope: &str, verb: &str) -> Result<(), Rejection> {
        let claims = self.caps.enforce(headers, scope, verb)?;
        self.limiter.check(&claims)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;
    let schema_path = std::env::var("SCHEMA_PATH").context("SCHEMA_PATH must point to the schema registry JSON")?;
    let raw = std::fs::read_to_string(&schema_path)
        .with_context(|| format!("reading schema {schema_path}"))?;
    let registry = Arc::new(SchemaRegistry::from_json(&raw)?);

    let store = match std::env::var("DATA_PATH") {
        Ok(path) => {
            let (store, loaded) = dump::load_store(std::path::Path::new(&path))
                .with_context(|| format!("loading data dump {path}"))?;
            LOADED_DOCUMENTS.set(loaded as f64);
            info!(%path, loaded, "data dump loaded");
            store
        }
        Err(_) => {
            warn!("DATA_PATH not set, starting with an empty store");
            InMemoryStore::new()
        }
    };
    store.apply_schema(&registry);

    let dims = std::env::var("EMBED_DIMS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_EMBED_DIMS);
    let engine = Engine::new(
        registry.clone(),
        Arc::new(store),
        Arc::new(HashingEmbedder::new(dims)),
        config,
    )?;
    let caps = CapKeys::from_env();
    if !caps.is_enabled() {
        warn!("no capability keys configured, requests are not authenticated");
    }
    let app = router(AppState {
        engine,
        caps,
        limiter: Arc::new(RateLimiter::default()),
    });

    let addr: SocketAddr = std::env::var("HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()
        .context("HTTP_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, collections = registry.len(), "http listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/:tenant/search", post(search))
        .route("/v1/:tenant/plan", post(execute_plan))
        .route("/v1/:tenant/plan/stream", post(stream_plan))
        .route("/v1/paths/:from/:to", get(paths))
        .route("/admin/schema", get(admin_schema))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn respond(route: &str, (status, body): (StatusCode, Json<JsonValue>)) -> Response {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[route, status.as_str()])
        .inc();
    (status, body).into_response()
}

fn error_response(e: &EngineError) -> (StatusCode, Json<JsonValue>) {
    let status = match e {
        EngineError::SchemaNotFound(_) | EngineError::PathNotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::UnauthorizedAccess { .. } => StatusCode::FORBIDDEN,
        EngineError::InvalidPlan(_) | EngineError::InvalidFilterValue { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Embedding(_) | EngineError::Collaborator(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn search(
    State(app): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(query): Json<SearchQuery>,
) -> Response {
    let _timer = HTTP_REQUEST_SECONDS.with_label_values(&["search"]).start_timer();
    if let Err(resp) = app.authorize(&headers, &tenant, "search") {
        return respond("search", resp);
    }
    let ctx = RequestContext::new(tenant);
    match app.engine.search(&ctx, &query).await {
        Ok(result) => respond("search", (StatusCode::OK, Json(json!(result)))),
        Err(e) => respond("search", error_response(&e)),
    }
}

async fn execute_plan(
    State(app): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(plan): Json<RetrievalPlan>,
) -> Response {
    let _timer = HTTP_REQUEST_SECONDS.with_label_values(&["plan"]).start_timer();
    if let Err(resp) = app.authorize(&headers, &tenant, "plan") {
        return respond("plan", resp);
    }
    let ctx = RequestContext::new(tenant).with_budget(app.engine.config().time_budget);
    match app.engine.execute(&ctx, &plan).await {
        Ok(execution) => respond("plan", (StatusCode::OK, Json(json!(execution)))),
        Err(e) => respond("plan", error_response(&e)),
    }
}

// Progress events as `event: progress`, then one `event: result` (or `error`).
async fn stream_plan(
    State(app): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(plan): Json<RetrievalPlan>,
) -> Response {
    if let Err(resp) = app.authorize(&headers, &tenant, "plan") {
        return respond("plan_stream", resp);
    }
    struct ClientGuard;
    impl ClientGuard {
        fn open() -> Self {
            STREAM_CLIENTS.inc();
            ClientGuard
        }
    }
    impl Drop for ClientGuard {
        fn drop(&mut self) {
            STREAM_CLIENTS.dec();
        }
    }

    let (ctx, mut rx) = RequestContext::with_channel(tenant);
    let ctx = ctx.with_budget(app.engine.config().time_budget);
    let request_id = ctx.request_id;
    let engine = app.engine.clone();
    // the task owns the only sender, so the event loop ends when it finishes
    let task = tokio::spawn(async move { engine.execute(&ctx, &plan).await });
    let guard = ClientGuard::open();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["plan_stream", StatusCode::OK.as_str()])
        .inc();

    let s = async_stream::stream! {
        let _g = guard;
        while let Some(ev) = rx.recv().await {
            let payload = serde_json::to_string(&ev).unwrap_or_default();
            yield Ok::<Bytes, std::io::Error>(Bytes::from(format!("event: progress\ndata: {payload}\n\n")));
        }
        let chunk = match task.await {
            Ok(Ok(execution)) => format!(
                "event: result\ndata: {}\n\n",
                serde_json::to_string(&execution).unwrap_or_default()
            ),
            Ok(Err(e)) => format!("event: error\ndata: {}\n\n", json!({ "error": e.to_string() })),
            Err(e) => {
                warn!(%request_id, error = %e, "plan task aborted");
                format!("event: error\ndata: {}\n\n", json!({ "error": "plan execution aborted" }))
            }
        };
        yield Ok::<Bytes, std::io::Error>(Bytes::from(chunk));
    };
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(s),
    )
        .into_response()
}

async fn paths(
    State(app): State<AppState>,
    Path((from, to)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = app.authorize(&headers, ADMIN_SCOPE, "paths") {
        return respond("paths", resp);
    }
    let path = app.engine.find_path(&from, &to);
    let chain = app.engine.find_chain(&from, &to);
    if path.is_none() && chain.is_empty() {
        return respond("paths", error_response(&EngineError::PathNotFound { from, to }));
    }
    respond(
        "paths",
        (
            StatusCode::OK,
            Json(json!({ "from": from, "to": to, "path": path, "chain": chain })),
        ),
    )
}

async fn admin_schema(State(app): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = app.authorize(&headers, ADMIN_SCOPE, "admin") {
        return respond("schema", resp);
    }
    let collections: Vec<_> = app.engine.registry().collections().collect();
    respond(
        "schema",
        (StatusCode::OK, Json(json!({ "collections": collections }))),
    )
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    let _ = encoder.encode(&metric_families, &mut buf);
    (StatusCode::OK, String::from_utf8(buf).unwrap_or_default())
}
