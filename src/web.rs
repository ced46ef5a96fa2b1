use crate::{
    config::{Config, IndexConfig},
    semantic::{
        IndexMutationError, IndexStats, ReviewIndex, SearchError, SearchHit, SnapshotStatus,
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tokio::{signal, sync::RwLock};

#[derive(Clone)]
pub struct SharedState {
    index: Arc<RwLock<ReviewIndex>>,
    limits: IndexConfig,
}

impl SharedState {
    pub fn new(index: ReviewIndex, limits: IndexConfig) -> Self {
        Self {
            index: Arc::new(RwLock::new(index)),
            limits,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/reviews/index", post(index_reviews))
        .route("/api/reviews/remove", post(remove_review))
        .route("/api/reviews/:id", get(get_review))
        .route("/api/search/reviews", post(search_reviews))
        .route("/api/search/reviews", get(search_reviews_get))
        .route("/api/search/stats", get(search_stats))
        .route("/api/index/clear", post(clear_index))
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

async fn serve(index: ReviewIndex, config: Config) -> anyhow::Result<()> {
    let state = Arc::new(SharedState::new(index, config.index.clone()));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn start_server(index: ReviewIndex, config: Config) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(index, config))
}

#[derive(Debug)]
pub enum HttpError {
    Mutation(IndexMutationError),
    Search(SearchError),
    Unprocessable(String),
    NotFound(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            HttpError::Mutation(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            HttpError::Mutation(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            HttpError::Search(SearchError::InvalidLimit) => StatusCode::UNPROCESSABLE_ENTITY,
            HttpError::Search(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            HttpError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        let message = match self {
            HttpError::Mutation(err) => err.to_string(),
            HttpError::Search(err) => err.to_string(),
            HttpError::Unprocessable(msg) | HttpError::NotFound(msg) => msg,
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<IndexMutationError> for HttpError {
    fn from(err: IndexMutationError) -> Self {
        Self::Mutation(err)
    }
}

impl From<SearchError> for HttpError {
    fn from(err: SearchError) -> Self {
        Self::Search(err)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IndexReviewsRequest {
    pub ids: Vec<i64>,
    pub texts: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IndexReviewsResponse {
    pub added: usize,
}

async fn index_reviews(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexReviewsRequest>,
) -> Result<Json<IndexReviewsResponse>, HttpError> {
    log::debug!("indexing {} reviews", payload.ids.len());

    let index = state.index.clone();
    tokio::task::block_in_place(move || {
        let mut index = index.blocking_write();
        let added = index.add(&payload.ids, &payload.texts)?;
        Ok(Json(IndexReviewsResponse { added }))
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoveReviewRequest {
    pub id: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoveReviewResponse {
    pub removed: bool,
}

async fn remove_review(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RemoveReviewRequest>,
) -> Result<Json<RemoveReviewResponse>, HttpError> {
    let index = state.index.clone();
    tokio::task::block_in_place(move || {
        let mut index = index.blocking_write();
        let removed = index.remove(payload.id)?;
        Ok(Json(RemoveReviewResponse { removed }))
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReviewResponse {
    pub id: i64,
    pub text: String,
}

async fn get_review(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<i64>,
) -> Result<Json<ReviewResponse>, HttpError> {
    let index = state.index.read().await;
    index
        .get_review(id)
        .map(|(id, text)| {
            Json(ReviewResponse {
                id,
                text: text.to_string(),
            })
        })
        .ok_or_else(|| HttpError::NotFound(format!("Review {id} not found")))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
    /// Restrict results to these review ids. Empty means no restriction.
    #[serde(default)]
    pub filter_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    /// Seconds spent embedding and ranking
    pub processing_time: f64,
}

fn validate_search(limits: &IndexConfig, query: &str, limit: Option<usize>) -> Result<usize, HttpError> {
    let length = query.trim().chars().count();
    if length == 0 || length > limits.max_query_length {
        return Err(HttpError::Unprocessable(format!(
            "query must be between 1 and {} characters",
            limits.max_query_length
        )));
    }

    let limit = limit.unwrap_or(limits.default_limit);
    if !(1..=limits.max_limit).contains(&limit) {
        return Err(HttpError::Unprocessable(format!(
            "limit must be between 1 and {}",
            limits.max_limit
        )));
    }

    Ok(limit)
}

async fn run_search(
    state: Arc<SharedState>,
    request: SearchRequest,
) -> Result<Json<SearchResponse>, HttpError> {
    let limit = validate_search(&state.limits, &request.query, request.limit)?;

    let index = state.index.clone();
    tokio::task::block_in_place(move || {
        let started = Instant::now();
        let index = index.blocking_read();

        let filter = (!request.filter_ids.is_empty()).then_some(request.filter_ids.as_slice());
        let results = index.search(&request.query, limit, filter)?;

        Ok(Json(SearchResponse {
            total_results: results.len(),
            processing_time: started.elapsed().as_secs_f64(),
            query: request.query,
            results,
        }))
    })
}

async fn search_reviews(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");
    run_search(state, payload).await
}

async fn search_reviews_get(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, HttpError> {
    let request = SearchRequest {
        query: params.query,
        limit: params.limit,
        filter_ids: vec![],
    };
    run_search(state, request).await
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatsResponse {
    pub vector_database: IndexStats,
    pub search_available: bool,
}

async fn search_stats(State(state): State<Arc<SharedState>>) -> Json<StatsResponse> {
    let stats = state.index.read().await.stats();
    Json(StatsResponse {
        search_available: stats.search_available,
        vector_database: stats,
    })
}

async fn clear_index(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let index = state.index.clone();
    tokio::task::block_in_place(move || {
        index.blocking_write().clear()?;
        Ok(Json(json!({ "cleared": true })))
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" when the stored snapshot had to be discarded
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub vector_db_status: IndexStats,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let stats = state.index.read().await.stats();
    let status = match stats.snapshot {
        SnapshotStatus::Discarded { .. } => "degraded",
        _ => "healthy",
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        vector_db_status: stats,
    })
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{Fault, LexiconEmbedder};
    use http_body_util::BodyExt;

    fn state(dir: &std::path::Path) -> (Arc<SharedState>, Arc<LexiconEmbedder>) {
        let embedder = Arc::new(LexiconEmbedder::new());
        let index = ReviewIndex::open(Box::new(embedder.clone()), &dir.join("reviews"));
        (
            Arc::new(SharedState::new(index, IndexConfig::default())),
            embedder,
        )
    }

    async fn add(state: &Arc<SharedState>, ids: &[i64], texts: &[&str]) {
        let request = IndexReviewsRequest {
            ids: ids.to_vec(),
            texts: texts.iter().map(|s| s.to_string()).collect(),
        };
        let Json(response) = index_reviews(State(state.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(response.added, ids.len());
    }

    async fn error_body(err: HttpError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn search_request(query: &str, limit: Option<usize>) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            limit,
            filter_ids: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_index_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        add(
            &state,
            &[1, 2, 3],
            &[
                "great product loved it",
                "terrible quality broke fast",
                "it was okay nothing special",
            ],
        )
        .await;

        let Json(response) = search_reviews(
            State(state.clone()),
            Json(search_request("amazing, would buy again", Some(1))),
        )
        .await
        .unwrap();

        assert_eq!(response.total_results, 1);
        assert_eq!(response.results[0].id, 1);
        assert_eq!(response.results[0].text, "great product loved it");
        assert_eq!(response.query, "amazing, would buy again");
        assert!(response.processing_time >= 0.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_get_uses_default_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        let ids: Vec<i64> = (1..=15).collect();
        let texts: Vec<String> = ids.iter().map(|id| format!("great review {id}")).collect();
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
        add(&state, &ids, &texts).await;

        let params = SearchParams {
            query: "great".to_string(),
            limit: None,
        };
        let Json(response) = search_reviews_get(State(state), Query(params))
            .await
            .unwrap();

        assert_eq!(response.total_results, IndexConfig::default().default_limit);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_with_filter() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        add(&state, &[1, 2, 3], &["great", "great value", "bad"]).await;

        let request = SearchRequest {
            filter_ids: vec![3],
            ..search_request("great", Some(5))
        };
        let Json(response) = search_reviews(State(state), Json(request)).await.unwrap();

        assert_eq!(response.total_results, 1);
        assert_eq!(response.results[0].id, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());

        for request in [
            search_request("   ", None),
            search_request(&"x".repeat(501), None),
            search_request("great", Some(0)),
            search_request("great", Some(101)),
        ] {
            let err = search_reviews(State(state.clone()), Json(request))
                .await
                .unwrap_err();
            let (status, body) = error_body(err).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_embedding_failure_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let (state, embedder) = state(dir.path());
        embedder.set_fault(Some(Fault::Fail));

        let err = search_reviews(State(state), Json(search_request("great", None)))
            .await
            .unwrap_err();

        let (status, _) = error_body(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_index_length_mismatch_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());

        let request = IndexReviewsRequest {
            ids: vec![1, 2],
            texts: vec!["great".to_string()],
        };
        let err = index_reviews(State(state), Json(request)).await.unwrap_err();

        let (status, body) = error_body(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("2 ids"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_persistence_failure_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        std::fs::create_dir(dir.path().join("reviews.index.tmp")).unwrap();

        let request = IndexReviewsRequest {
            ids: vec![1],
            texts: vec!["great".to_string()],
        };
        let err = index_reviews(State(state), Json(request)).await.unwrap_err();

        let (status, _) = error_body(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        add(&state, &[1, 2], &["great", "bad"]).await;

        let Json(review) = get_review(State(state.clone()), Path(1)).await.unwrap();
        assert_eq!(review.text, "great");

        let Json(response) = remove_review(State(state.clone()), Json(RemoveReviewRequest { id: 1 }))
            .await
            .unwrap();
        assert!(response.removed);

        let Json(response) = remove_review(State(state.clone()), Json(RemoveReviewRequest { id: 1 }))
            .await
            .unwrap();
        assert!(!response.removed);

        let err = get_review(State(state), Path(1)).await.unwrap_err();
        let (status, _) = error_body(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        add(&state, &[1, 2], &["great", "bad"]).await;

        let Json(stats) = search_stats(State(state.clone())).await;
        assert!(stats.search_available);
        assert_eq!(stats.vector_database.live_count, 2);
        assert_eq!(stats.vector_database.dimension, LexiconEmbedder::DIMENSIONS);

        let Json(cleared) = clear_index(State(state.clone())).await.unwrap();
        assert_eq!(cleared["cleared"], true);

        let Json(stats) = search_stats(State(state)).await;
        assert!(!stats.search_available);
        assert_eq!(stats.vector_database.total_slots, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());

        let Json(health_response) = health(State(state)).await;
        assert_eq!(health_response.status, "healthy");
        assert_eq!(health_response.version, env!("CARGO_PKG_VERSION"));

        let Json(live) = liveness().await;
        assert_eq!(live["status"], "alive");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_degraded_after_discarded_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reviews.meta"), b"{}").unwrap();
        let (state, _) = state(dir.path());

        let Json(health_response) = health(State(state)).await;

        assert_eq!(health_response.status, "degraded");
        assert_eq!(health_response.vector_db_status.live_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_router_builds() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state(dir.path());
        let _router = router(state);
    }
}
