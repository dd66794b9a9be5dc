use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::NaiveDate;
use learntrail_indexing::{GraphBuilder, KnowledgeGraph};
use learntrail_ingestion::{Clock, Database, TrackerCommand, Whitelist};
use learntrail_schemas::{EdgeType, Observation};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::composer::InsightComposer;

const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 200;
const DEFAULT_SUMMARY_BUDGET: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub graph: Arc<Mutex<KnowledgeGraph>>,
    pub whitelist: Arc<RwLock<Whitelist>>,
    pub builder: Arc<GraphBuilder>,
    pub composer: Arc<InsightComposer>,
    pub tracker: mpsc::UnboundedSender<TrackerCommand>,
    pub clock: Arc<dyn Clock>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn internal(context: &str, e: impl std::fmt::Display) -> (StatusCode, String) {
    error!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/observations", post(post_observation))
        .route("/sessions/current", get(current_session))
        .route("/sessions/recent", get(recent_sessions))
        .route("/graph/build", post(build_graph))
        .route("/graph/stats", get(graph_stats))
        .route("/graph/nodes/:id/neighbors", get(node_neighbors))
        .route("/insights/gaps", get(learning_gaps))
        .route("/insights/daily", get(daily_summary))
        .route("/whitelist", get(get_whitelist))
        .route("/whitelist/apps", post(add_app))
        .route("/whitelist/apps/:name", delete(remove_app))
        .route("/whitelist/domains", post(add_domain))
        .route("/whitelist/domains/:domain", delete(remove_domain))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "learntrail",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============================================================================
// Tracking
// ============================================================================

async fn post_observation(
    State(state): State<AppState>,
    Json(observation): Json<Observation>,
) -> ApiResult<impl IntoResponse> {
    if observation.app_name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "app_name is required".to_string()));
    }

    state
        .tracker
        .send(TrackerCommand::Observe(observation))
        .map_err(|_| {
            warn!("Observation dropped: tracker worker is not running");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "tracker is not running".to_string(),
            )
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": true })),
    ))
}

async fn current_session(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let db = state.db.lock().await;
    let open = db
        .get_open_sessions()
        .map_err(|e| internal("Failed to load open sessions", e))?;
    Ok(Json(open.into_iter().last()))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_sessions(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);
    let db = state.db.lock().await;
    let sessions = db
        .get_recent_sessions(limit)
        .map_err(|e| internal("Failed to load recent sessions", e))?;
    Ok(Json(sessions))
}

// ============================================================================
// Knowledge graph
// ============================================================================

async fn build_graph(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let report = state
        .builder
        .build_knowledge_graph(state.clock.now())
        .await
        .map_err(|e| internal("Graph build failed", e))?;
    info!(
        "Graph build on request: {} activities, {} edges",
        report.activities, report.edges_created
    );
    Ok(Json(report))
}

async fn graph_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.graph.lock().await.graph_stats())
}

#[derive(Debug, Deserialize)]
struct NeighborQuery {
    edge_type: Option<String>,
}

async fn node_neighbors(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<NeighborQuery>,
) -> ApiResult<impl IntoResponse> {
    let edge_type = match query.edge_type.as_deref() {
        Some(raw) => Some(EdgeType::parse(&raw.trim().to_uppercase()).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown edge type '{}'", raw),
            )
        })?),
        None => None,
    };

    let graph = state.graph.lock().await;
    let node = graph
        .get_node(&id)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("node '{}' not found", id)))?;
    let neighbors = graph.neighbors(&id, edge_type);

    Ok(Json(serde_json::json!({
        "node": node,
        "neighbors": neighbors,
    })))
}

// ============================================================================
// Insights
// ============================================================================

async fn learning_gaps(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.composer.learning_gaps(state.clock.now()).await)
}

#[derive(Debug, Deserialize)]
struct DailyQuery {
    date: Option<String>,
    budget: Option<usize>,
}

async fn daily_summary(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> ApiResult<impl IntoResponse> {
    let date = match query.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                format!("invalid date '{}', expected YYYY-MM-DD", raw),
            )
        })?,
        None => state.clock.now().date_naive(),
    };

    let summary = state
        .composer
        .daily_summary(date, query.budget.unwrap_or(DEFAULT_SUMMARY_BUDGET))
        .await
        .map_err(|e| internal("Daily summary failed", e))?;
    Ok(Json(summary))
}

// ============================================================================
// Whitelist
// ============================================================================

async fn get_whitelist(State(state): State<AppState>) -> impl IntoResponse {
    let whitelist = state.whitelist.read().await;
    Json(serde_json::json!({
        "apps": whitelist.apps(),
        "domains": whitelist.domains(),
    }))
}

#[derive(Debug, Deserialize)]
struct AppRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DomainRequest {
    domain: String,
}

async fn add_app(
    State(state): State<AppState>,
    Json(request): Json<AppRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name is required".to_string()));
    }
    state
        .db
        .lock()
        .await
        .add_whitelist_app(&request.name)
        .map_err(|e| internal("Failed to store whitelisted app", e))?;
    let added = state.whitelist.write().await.add_app(&request.name);
    info!("Whitelist app '{}' (new: {})", request.name, added);
    Ok(Json(serde_json::json!({ "added": added })))
}

async fn remove_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .db
        .lock()
        .await
        .remove_whitelist_app(&name)
        .map_err(|e| internal("Failed to remove whitelisted app", e))?;
    let removed = state.whitelist.write().await.remove_app(&name);
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn add_domain(
    State(state): State<AppState>,
    Json(request): Json<DomainRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.domain.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "domain is required".to_string()));
    }
    state
        .db
        .lock()
        .await
        .add_whitelist_domain(&request.domain)
        .map_err(|e| internal("Failed to store whitelisted domain", e))?;
    let added = state.whitelist.write().await.add_domain(&request.domain);
    info!("Whitelist domain '{}' (new: {})", request.domain, added);
    Ok(Json(serde_json::json!({ "added": added })))
}

async fn remove_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .db
        .lock()
        .await
        .remove_whitelist_domain(&domain)
        .map_err(|e| internal("Failed to remove whitelisted domain", e))?;
    let removed = state.whitelist.write().await.remove_domain(&domain);
    Ok(Json(serde_json::json!({ "removed": removed })))
}
