mod analytics;
mod config;
mod feedback;
mod gate;
mod generator;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod processor;
mod quota;
mod security;
mod store;

use analytics::AnalyticsAggregator;
use axum::{
    Json, Router,
    extract::{Extension, Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::Settings;
use feedback::{FeedbackError, FeedbackService};
use gate::{Admission, ConcurrencyGate};
use generator::ContentGenerator;
use idempotency::{IdempotencyCache, Reservation};
use jobs::{CreateJobError, JobRunner};
use llm::{AnthropicClient, AnthropicConfig, CohereClient, CohereConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CreateJobRequest, Feedback, FeedbackRequest, GeneratedResult, Job, JobStatus,
    QuotaDecision,
};
use processor::JobProcessor;
use quota::QuotaChecker;
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{JobStore, MemoryStore, StoreError, SupabaseStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "listro.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();
    let settings = Settings::from_env();

    let store: Arc<dyn JobStore> = match SupabaseStore::from_env(settings.http) {
        Some(store) => {
            info!(target = "listro.api", "using supabase job store");
            Arc::new(store)
        }
        None => {
            warn!(
                target = "listro.api",
                "SUPABASE_URL not set; jobs are kept in memory and lost on restart"
            );
            Arc::new(MemoryStore::new())
        }
    };
    let generator = ContentGenerator::new(
        Arc::new(AnthropicClient::new(AnthropicConfig::from_env(), settings.http)),
        Arc::new(CohereClient::new(CohereConfig::from_env(), settings.http)),
    );
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;

    let state = AppState::new(&settings, store, generator, redis, prometheus_handle);

    let resumed = state.runner.sweep_once().await;
    if resumed > 0 {
        info!(target = "listro.api", resumed, "resumed pending jobs");
    }
    let _sweeper = state.runner.spawn_sweeper(settings.sweep_interval);

    let app = build_app(state, AuthState::from_env(), settings.request_max_bytes);
    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "listro.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    quota: QuotaChecker,
    feedback: FeedbackService,
    analytics: AnalyticsAggregator,
    idempotency: IdempotencyCache,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

impl AppState {
    fn new(
        settings: &Settings,
        store: Arc<dyn JobStore>,
        generator: ContentGenerator,
        redis: Option<redis::Client>,
        prometheus_handle: PrometheusHandle,
    ) -> Self {
        let worker_id = format!("listro-{}", Uuid::new_v4().simple());
        let processor = JobProcessor::new(
            store.clone(),
            generator,
            worker_id,
            settings.lease,
            settings.prompt_timeout,
        );
        info!(target = "listro.api", worker = processor.worker_id(), "job worker ready");
        let quota = QuotaChecker::new(store.clone(), settings.daily_job_limit);
        let runner = JobRunner::new(
            store.clone(),
            ConcurrencyGate::new(settings.max_concurrent_jobs),
            processor,
            quota.clone(),
        );
        let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or_else(|_| json!({ "openapi": "3.0.3" }));
        Self {
            feedback: FeedbackService::new(store.clone()),
            analytics: AnalyticsAggregator::new(store.clone(), settings.feedback_sample_limit),
            idempotency: IdempotencyCache::new(redis, settings.idempotency_ttl_secs),
            openapi: Arc::new(openapi),
            store,
            runner,
            quota,
            prometheus_handle,
        }
    }
}

fn build_app(state: AppState, auth: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/results", get(list_results))
        .route("/results/{id}/feedback", post(submit_feedback))
        .route("/quota", get(quota_status))
        .route("/analytics", get(analytics_report))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Liveness plus current gate occupancy.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let gate = state.runner.gate();
    Json(json!({
        "status": "ok",
        "service": "listro-studio",
        "jobs_in_flight": gate.in_flight(),
        "max_concurrent_jobs": gate.capacity(),
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateJobResponse {
    job_id: Uuid,
    status: JobStatus,
    queued: bool,
    quota: QuotaDecision,
}

/// Create a production job.
///
/// - Method: `POST`
/// - Path: `/jobs`
/// - Auth: `Authorization: Bearer <key>` or `X-Listro-Key: <key>`
/// - Body: `CreateJobRequest`
/// - Headers: optional `Idempotency-Key`
///
/// Returns `202 Accepted`; `queued` is true when the job waits for a free slot.
/// A repeated key replays the first response, or `409` while that request is
/// still running.
async fn create_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    crate::metrics::inc_requests("/jobs");
    let Json(request) = payload.map_err(|rej| AppError::BadRequest(rej.body_text()))?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(key) = &idempotency_key {
        match state
            .idempotency
            .reserve::<CreateJobResponse>(&context.user_id, key)
            .await
        {
            Reservation::Acquired => {}
            Reservation::InFlight => {
                return Err(AppError::Conflict(
                    "a request with this Idempotency-Key is still in progress".into(),
                ));
            }
            Reservation::Done(existing) => return Ok((StatusCode::ACCEPTED, Json(existing))),
        }
    }

    info!(
        target = "listro.api",
        user_id = %context.user_id,
        api_key = %context.api_key_id,
        prompts = request.prompts.len(),
        "job creation requested"
    );
    let created = match state.runner.create_job(&context.user_id, request).await {
        Ok(created) => created,
        Err(err) => {
            if let Some(key) = &idempotency_key {
                state.idempotency.release(&context.user_id, key).await;
            }
            return Err(err.into());
        }
    };
    let response = CreateJobResponse {
        job_id: created.job.id,
        status: created.job.status,
        queued: created.admission == Admission::AtCapacity,
        quota: created.quota,
    };
    if let Some(key) = &idempotency_key {
        state.idempotency.put(&context.user_id, key, &response).await;
    }
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn owned_job(state: &AppState, user_id: &str, id: &str) -> Result<Job, AppError> {
    let id = Uuid::parse_str(id).map_err(|_| AppError::BadRequest("invalid job id".into()))?;
    state
        .store
        .get_job(id)
        .await?
        .filter(|job| job.user_id == user_id)
        .ok_or(AppError::NotFound("job"))
}

/// Job status, including results once the job has finished.
async fn get_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    Ok(Json(owned_job(&state, &context.user_id, &id).await?))
}

async fn list_results(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Vec<GeneratedResult>>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}/results");
    let job = owned_job(&state, &context.user_id, &id).await?;
    Ok(Json(state.store.list_results(job.id).await?))
}

async fn submit_feedback(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Feedback>), AppError> {
    crate::metrics::inc_requests("/results/{id}/feedback");
    let Json(request) = payload.map_err(|rej| AppError::BadRequest(rej.body_text()))?;
    let result_id =
        Uuid::parse_str(&id).map_err(|_| AppError::BadRequest("invalid result id".into()))?;
    let feedback = state
        .feedback
        .submit(result_id, &context.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(feedback)))
}

async fn quota_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<QuotaDecision> {
    crate::metrics::inc_requests("/quota");
    Json(state.quota.check(&context.user_id).await)
}

async fn analytics_report(
    State(state): State<AppState>,
) -> Result<Json<models::AnalyticsReport>, AppError> {
    crate::metrics::inc_requests("/analytics");
    Ok(Json(state.analytics.report().await?))
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(&'static str),
    Conflict(String),
    QuotaExceeded(QuotaDecision),
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CreateJobError> for AppError {
    fn from(value: CreateJobError) -> Self {
        match value {
            CreateJobError::Invalid(err) => Self::BadRequest(err.to_string()),
            CreateJobError::QuotaExceeded(decision) => Self::QuotaExceeded(decision),
            CreateJobError::Store(err) => err.into(),
        }
    }
}

impl From<FeedbackError> for AppError {
    fn from(value: FeedbackError) -> Self {
        match value {
            FeedbackError::Invalid(err) => Self::BadRequest(err.to_string()),
            FeedbackError::NotFound => Self::NotFound("result"),
            FeedbackError::Store(err) => err.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "invalid_request", detail),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "idempotency_conflict", detail),
            AppError::QuotaExceeded(decision) => {
                (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", decision.message)
            }
            AppError::Internal(detail) => {
                error!(target = "listro.api", error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::fakes::{ScriptedPrimary, ScriptedVariants};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_app(store: MemoryStore, settings: Settings) -> Router {
        let generator = ContentGenerator::new(
            Arc::new(ScriptedPrimary::ok("PRIMARY")),
            Arc::new(ScriptedVariants::ok(&["V1", "V2", "V3"])),
        );
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let state = AppState::new(&settings, Arc::new(store), generator, None, handle);
        let mut keys = HashMap::new();
        for (user, key) in [("alice", "alice-key"), ("bob", "bob-key")] {
            keys.insert(
                key.to_string(),
                AuthContext {
                    user_id: user.to_string(),
                    api_key_id: format!("{user}-01"),
                },
            );
        }
        build_app(state, AuthState::new(keys, 100.0, 100.0), 64 * 1024)
    }

    fn post_json(uri: &str, key: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Listro-Key", key)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str, key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-Listro-Key", key)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_done(app: &Router, id: &str) -> serde_json::Value {
        for _ in 0..200 {
            let resp = app
                .clone()
                .oneshot(get_req(&format!("/jobs/{id}"), "alice-key"))
                .await
                .unwrap();
            let body = body_json(resp).await;
            if body["status"] == "completed" {
                return body;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job {id} did not complete");
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app(MemoryStore::new(), Settings::default());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["max_concurrent_jobs"], 3);
    }

    #[tokio::test]
    async fn protected_routes_need_a_key() {
        let app = test_app(MemoryStore::new(), Settings::default());
        let resp = app
            .oneshot(Request::builder().uri("/quota").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn job_lifecycle_and_feedback() {
        let app = test_app(MemoryStore::new(), Settings::default());
        let resp = app
            .clone()
            .oneshot(post_json(
                "/jobs",
                "alice-key",
                json!({ "kind": "video_script", "prompts": ["a", "b"] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let created = body_json(resp).await;
        let id = created["job_id"].as_str().unwrap().to_string();
        assert_eq!(created["queued"], false);

        let job = wait_done(&app, &id).await;
        let results = job["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(
            results[0]["generated_text"]
                .as_str()
                .unwrap()
                .contains("PRIMARY VERSION:\nPRIMARY")
        );

        // other users cannot see the job
        let resp = app
            .clone()
            .oneshot(get_req(&format!("/jobs/{id}"), "bob-key"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let result_id = results[0]["id"].as_str().unwrap();
        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/results/{result_id}/feedback"),
                "alice-key",
                json!({ "rating": 5 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let feedback = body_json(resp).await;
        assert_eq!(feedback["rating"], 5);
        assert!(feedback.get("comment").is_none());

        let resp = app
            .clone()
            .oneshot(get_req("/analytics", "alice-key"))
            .await
            .unwrap();
        let report = body_json(resp).await;
        assert_eq!(report["total_jobs"], 1);
        assert_eq!(report["rating_distribution"]["5"], 1);
    }

    #[tokio::test]
    async fn results_route_and_openapi() {
        let app = test_app(MemoryStore::new(), Settings::default());
        let created = body_json(
            app.clone()
                .oneshot(post_json(
                    "/jobs",
                    "alice-key",
                    json!({ "kind": "product_description", "prompts": ["mug"] }),
                ))
                .await
                .unwrap(),
        )
        .await;
        let id = created["job_id"].as_str().unwrap().to_string();
        wait_done(&app, &id).await;

        let resp = app
            .clone()
            .oneshot(get_req(&format!("/jobs/{id}/results"), "alice-key"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let results = body_json(resp).await;
        assert_eq!(results.as_array().unwrap().len(), 1);
        assert_eq!(results[0]["prompt"], "mug");

        let resp = app
            .clone()
            .oneshot(get_req("/jobs/not-a-uuid/results", "alice-key"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["info"]["title"], "Listro Studio API");
    }

    #[tokio::test]
    async fn unknown_options_are_rejected() {
        let app = test_app(MemoryStore::new(), Settings::default());
        let resp = app
            .oneshot(post_json(
                "/jobs",
                "alice-key",
                json!({ "kind": "ad_copy", "prompts": ["a"], "options": { "mood": "sunny" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn quota_exceeded_returns_429() {
        let settings = Settings {
            daily_job_limit: 1,
            ..Settings::default()
        };
        let app = test_app(MemoryStore::new(), settings);
        let body = json!({ "kind": "ad_copy", "prompts": ["a"] });
        let first = app
            .clone()
            .oneshot(post_json("/jobs", "alice-key", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = app
            .clone()
            .oneshot(post_json("/jobs", "alice-key", body.clone()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(second).await["error"], "quota_exceeded");

        // quota is per user
        let other = app
            .oneshot(post_json("/jobs", "bob-key", body))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn idempotency_key_replays_first_response() {
        let store = MemoryStore::new();
        let app = test_app(store.clone(), Settings::default());
        let request = || {
            let mut req = post_json(
                "/jobs",
                "alice-key",
                json!({ "kind": "social_post", "prompts": ["a"] }),
            );
            req.headers_mut()
                .insert("Idempotency-Key", "abc".parse().unwrap());
            req
        };
        let first = body_json(app.clone().oneshot(request()).await.unwrap()).await;
        let second = body_json(app.oneshot(request()).await.unwrap()).await;
        assert_eq!(first["job_id"], second["job_id"]);
        assert_eq!(store.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_with_one_key_create_one_job() {
        let store = MemoryStore::new();
        let app = test_app(store.clone(), Settings::default());
        let request = || {
            let mut req = post_json(
                "/jobs",
                "alice-key",
                json!({ "kind": "ad_copy", "prompts": ["a"] }),
            );
            req.headers_mut()
                .insert("Idempotency-Key", "same".parse().unwrap());
            req
        };
        let (a, b) = tokio::join!(app.clone().oneshot(request()), app.oneshot(request()));
        let statuses = [a.unwrap().status(), b.unwrap().status()];
        assert!(statuses.contains(&StatusCode::ACCEPTED));
        assert!(
            statuses
                .iter()
                .all(|s| *s == StatusCode::ACCEPTED || *s == StatusCode::CONFLICT)
        );
        assert_eq!(store.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_create_releases_the_key() {
        let app = test_app(MemoryStore::new(), Settings::default());
        let keyed = |prompt: &str| {
            let mut req = post_json(
                "/jobs",
                "alice-key",
                json!({ "kind": "ad_copy", "prompts": [prompt] }),
            );
            req.headers_mut()
                .insert("Idempotency-Key", "retry".parse().unwrap());
            req
        };
        let blank = app.clone().oneshot(keyed("  ")).await.unwrap();
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
        let retried = app.oneshot(keyed("a")).await.unwrap();
        assert_eq!(retried.status(), StatusCode::ACCEPTED);
    }
}
