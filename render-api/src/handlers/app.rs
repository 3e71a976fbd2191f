//! Router assembly: public probes, authenticated job surface, rate
//! limiting and body limits.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use governor::{clock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use render_common::health::Liveness;
use render_common::metrics::install_recorder;

use crate::service::JobService;

use super::jobs;

type ApiRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, clock::DefaultClock>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
    pub health: Liveness,
    pub api_key: String,
    pub limiter: Arc<ApiRateLimiter>,
}

impl AppState {
    pub fn new(
        service: Arc<JobService>,
        health: Liveness,
        api_key: String,
        requests_per_second: u32,
        burst: u32,
    ) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(requests_per_second.max(1)).expect("rate above zero"),
        )
        .allow_burst(NonZeroU32::new(burst.max(1)).expect("burst above zero"));
        Self {
            service,
            health,
            api_key,
            limiter: Arc::new(RateLimiter::dashmap(quota)),
        }
    }
}

async fn index() -> &'static str {
    "render orchestrator"
}

/// Every endpoint but the probes requires the configured `X-API-Key`;
/// authenticated callers then pass through the token bucket.
async fn authenticate(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let Some(key) = provided.filter(|key| *key == state.api_key) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(jobs::ErrorResponse {
                error: "missing or invalid api key".to_owned(),
            }),
        )
            .into_response();
    };

    if state.limiter.check_key(&key).is_err() {
        metrics::counter!("rate_limited_requests_total").increment(1);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(jobs::ErrorResponse {
                error: "rate limit exceeded".to_owned(),
            }),
        )
            .into_response();
    }

    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let response = next.run(request).await;

    let labels = [
        ("endpoint", endpoint),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("api_requests_total", &labels).increment(1);

    response
}

/// Assemble the full router. Prometheus routes install a global
/// recorder, so they are opt-in and stay off in tests.
pub fn router(state: AppState, max_body_size: usize, export_metrics: bool) -> Router {
    let health = state.health.clone();

    // POST takes an operation tag, GET takes a job id; they share the
    // one path parameter slot.
    let protected = Router::new()
        .route(
            "/jobs/:target",
            post(jobs::create)
                .get(jobs::get_status)
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .route("/jobs/:target/cancel", post(jobs::cancel))
        .route("/queue/stats", get(jobs::queue_stats))
        .route("/admin/recover-workers", post(jobs::recover_workers))
        .route("/admin/workers/status", get(jobs::workers_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/health", get(move || std::future::ready(health.report())))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if export_metrics {
        let recorder_handle = install_recorder();
        router.route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
    } else {
        router
    }
}
