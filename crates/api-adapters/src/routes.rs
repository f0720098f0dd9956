//! Axum router for the funnel front end.
//!
//! Every funnel call carries the visitor's session in an `x-session-id`
//! header. Successful responses are wrapped as `{ "success": true, ... }`;
//! failures go through [`ApiError`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, MatchedPath, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use domains::errors::DomainError;
use domains::models::{HttpMethod, OfferRef, VisitorData};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use services::{
    ClickRequest, ConversionTracker, LeadDispatcher, LeadSubmission, OfferService, PixelRequest,
    PixelService, SessionService, SkipRequest,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::metrics::{Metrics, RequestLabels, RouteLabels};

pub const SESSION_HEADER: &str = "x-session-id";

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub offers: Arc<OfferService>,
    pub pixels: Arc<PixelService>,
    pub leads: Arc<LeadDispatcher>,
    pub tracking: Arc<ConversionTracker>,
    pub sessions: Arc<SessionService>,
    pub metrics: Arc<Metrics>,
    pub test_pre_ping_timeout: Duration,
}

/// Session identifier taken from the `x-session-id` header.
pub struct SessionId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for SessionId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| SessionId(v.to_string()))
            .ok_or_else(|| {
                ApiError(DomainError::Validation(format!("missing {SESSION_HEADER} header")))
            })
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { success: true, data })
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Build all routes with tracing and request metrics attached.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/paths/{path_id}/start", post(start_path))
        .route("/api/paths/{path_id}/survey/start", post(start_survey))
        .route("/api/paths/{path_id}/linkouts/start", post(start_linkouts))
        .route("/api/paths/{path_id}/offers", post(evaluate_offers))
        .route("/api/pre-ping", post(resolve_pre_ping))
        .route("/api/pre-ping/test", post(test_pre_ping))
        .route("/api/pixels", post(allocate_pixels))
        .route("/api/leads", post(submit_lead))
        .route("/api/leads/{lead_id}/resubmit", post(resubmit_lead))
        .route("/api/track/click", post(track_click))
        .route("/api/track/skip", post(track_skip))
        .route("/api/track/cpa-pixel", get(cpa_pixel))
        .route("/api/track/postback/{id_hash}", get(postback))
        .route("/api/track/global-pixel", get(global_pixel))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(state.clone(), record_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn record_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    state
        .metrics
        .latency
        .get_or_create(&RouteLabels { route: route.clone() })
        .observe(started.elapsed().as_secs_f64());
    state
        .metrics
        .requests
        .get_or_create(&RequestLabels {
            method,
            route,
            status: response.status().as_u16(),
        })
        .inc();
    response
}

#[derive(Serialize)]
struct Empty {}

/// POST /api/paths/{path_id}/start: new funnel entry, bucket back to zero.
async fn start_path(
    State(state): State<AppState>,
    Path(path_id): Path<i64>,
    SessionId(session): SessionId,
) -> ApiResult<Empty> {
    state.sessions.start_path(&session).await?;
    info!(session = %session, path_id, "path started");
    Ok(ok(Empty {}))
}

async fn start_survey(
    State(state): State<AppState>,
    Path(_path_id): Path<i64>,
    SessionId(session): SessionId,
) -> ApiResult<Empty> {
    state.sessions.start_survey(&session).await?;
    Ok(ok(Empty {}))
}

async fn start_linkouts(
    State(state): State<AppState>,
    Path(_path_id): Path<i64>,
    SessionId(session): SessionId,
) -> ApiResult<Empty> {
    state.sessions.start_linkouts(&session).await?;
    Ok(ok(Empty {}))
}

#[derive(Debug, Default, Deserialize)]
struct VisitorBody {
    #[serde(default)]
    user_data: VisitorData,
}

/// POST /api/paths/{path_id}/offers: admitted offers plus pending pre-pings.
async fn evaluate_offers(
    State(state): State<AppState>,
    Path(path_id): Path<i64>,
    Json(body): Json<VisitorBody>,
) -> ApiResult<services::EvaluatedOffers> {
    let evaluated = state.offers.evaluate_offers(path_id, &body.user_data).await?;
    Metrics::count_outcome(&state.metrics.offers, "admitted", evaluated.admitted.len() as u64);
    let pending = evaluated.pre_ping_pending.len() as u64;
    Metrics::count_outcome(&state.metrics.offers, "pending", pending);
    Ok(ok(evaluated))
}

#[derive(Debug, Deserialize)]
struct PrePingBody {
    offers: Vec<OfferRef>,
    #[serde(default)]
    user_data: VisitorData,
}

/// POST /api/pre-ping: confirm pending offers.
async fn resolve_pre_ping(
    State(state): State<AppState>,
    Json(body): Json<PrePingBody>,
) -> ApiResult<services::ConfirmedOffers> {
    let confirmed = state.offers.resolve_pre_ping(&body.offers, &body.user_data).await?;
    Ok(ok(confirmed))
}

#[derive(Debug, Deserialize)]
struct TestPrePingBody {
    posting_url: String,
    #[serde(default)]
    posting_method: HttpMethod,
    #[serde(default)]
    posting_data: Map<String, Value>,
}

#[derive(Serialize)]
struct TestPrePingResponse {
    submission_response: String,
}

/// POST /api/pre-ping/test: try a configuration out, returns the raw body.
async fn test_pre_ping(
    State(state): State<AppState>,
    Json(body): Json<TestPrePingBody>,
) -> ApiResult<TestPrePingResponse> {
    if body.posting_url.trim().is_empty() {
        return Err(DomainError::Validation("posting_url is required".into()).into());
    }
    let params = body
        .posting_data
        .into_iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, text)
        })
        .collect();
    let submission_response = state
        .offers
        .pre_ping()
        .test_call(&body.posting_url, body.posting_method, params, state.test_pre_ping_timeout)
        .await;
    Ok(ok(TestPrePingResponse { submission_response }))
}

/// POST /api/pixels: render this location's pixels.
async fn allocate_pixels(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    Json(body): Json<PixelRequest>,
) -> ApiResult<services::PixelAllocation> {
    let allocation = state.pixels.allocate_pixels(&session, body).await?;
    state.metrics.pixels_fired.inc_by(allocation.fired.len() as u64);
    Ok(ok(allocation))
}

/// First `x-forwarded-for` hop, the client as seen by the edge proxy.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// POST /api/leads: post a lead to the SOI's advertiser.
async fn submit_lead(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    headers: HeaderMap,
    Json(mut body): Json<LeadSubmission>,
) -> ApiResult<services::LeadOutcome> {
    body.ip = client_ip(&headers);
    let outcome = state.leads.submit(&session, body).await?;
    Metrics::count_outcome(&state.metrics.leads, outcome.status.as_str(), 1);
    Ok(ok(outcome))
}

async fn resubmit_lead(
    State(state): State<AppState>,
    Path(lead_id): Path<i64>,
) -> ApiResult<services::LeadOutcome> {
    let outcome = state.leads.resubmit(lead_id).await?;
    Metrics::count_outcome(&state.metrics.leads, outcome.status.as_str(), 1);
    Ok(ok(outcome))
}

/// POST /api/track/click: record a linkout click, returns where to send the visitor.
async fn track_click(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    Json(body): Json<ClickRequest>,
) -> ApiResult<services::ClickOutcome> {
    Ok(ok(state.tracking.record_click(&session, body).await?))
}

#[derive(Serialize)]
struct SkipResponse {
    skip_id: i64,
}

async fn track_skip(
    State(state): State<AppState>,
    Json(body): Json<SkipRequest>,
) -> ApiResult<SkipResponse> {
    let skip_id = state.tracking.record_skip(body).await?;
    Ok(ok(SkipResponse { skip_id }))
}

/// 1x1 transparent PNG.
static PIXEL_PNG: [u8; 67] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

/// Identifies the conversion an advertiser page reports. These routes are
/// loaded from third-party pages, so the session travels in the query.
#[derive(Debug, Deserialize)]
struct ConversionQuery {
    session: String,
    conversion: i64,
    #[serde(default)]
    utm_content: Option<String>,
}

/// GET /api/track/cpa-pixel: image embedded by the advertiser on conversion.
/// Always answers with the image; failures are only logged.
async fn cpa_pixel(State(state): State<AppState>, Query(q): Query<ConversionQuery>) -> Response {
    if let Err(e) = state.tracking.complete_cpa(&q.session, q.conversion, None).await {
        warn!(conversion = q.conversion, error = %e, "cpa pixel not credited");
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png"), (header::CACHE_CONTROL, "no-store")],
        &PIXEL_PNG[..],
    )
        .into_response()
}

/// GET /api/track/postback/{id_hash}: server-to-server conversion report.
async fn postback(
    State(state): State<AppState>,
    Path(id_hash): Path<String>,
    Query(q): Query<ConversionQuery>,
) -> (StatusCode, &'static str) {
    match state.tracking.complete_cpa(&q.session, q.conversion, Some(&id_hash)).await {
        Ok(_) => (StatusCode::OK, "Conversion reported successfully."),
        Err(e) => {
            warn!(conversion = q.conversion, error = %e, "postback rejected");
            (StatusCode::BAD_REQUEST, "Failed to report conversion.")
        }
    }
}

/// GET /api/track/global-pixel: page the advertiser iframes on conversion.
/// Confirms the conversion, then renders the global `linkouts` pixels its
/// revenue clears.
async fn global_pixel(
    State(state): State<AppState>,
    Query(q): Query<ConversionQuery>,
) -> Html<String> {
    let codes = match state.tracking.complete_cpa(&q.session, q.conversion, None).await {
        Ok(done) => state
            .pixels
            .conversion_pixels(done.revenue, q.utm_content.as_deref(), &done.visitor)
            .await
            .unwrap_or_else(|e| {
                warn!(conversion = q.conversion, error = %e, "conversion pixels failed");
                Vec::new()
            }),
        Err(e) => {
            warn!(conversion = q.conversion, error = %e, "global pixel without a conversion");
            Vec::new()
        }
    };
    state.metrics.pixels_fired.inc_by(codes.len() as u64);

    let body: Vec<String> = codes.into_iter().map(|p| p.html).collect();
    Html(format!("<!DOCTYPE html>\n<html><body>\n{}\n</body></html>", body.join("\n")))
}

/// GET /health: simple health check.
async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        state.metrics.render(),
    )
}
