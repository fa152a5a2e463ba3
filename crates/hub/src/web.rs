use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::actuator::Action;
use crate::decision::{Category, EvaluationInput, InputCorrection, Recommendation, RuleActivation};
use crate::error::{EvaluationError, ValidationError};
use crate::link::{ConnectionState, ControlLink};
use crate::rack::RackCore;
use crate::state::{SystemEvent, TelemetryRecord};

type Core<L> = Arc<RackCore<L>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<EvaluationError> for ApiError {
    fn from(e: EvaluationError) -> Self {
        match e {
            EvaluationError::Validation(v) => v.into(),
            EvaluationError::Internal(_) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    uptime_secs: u64,
    services: Services,
}

#[derive(Debug, Serialize)]
struct Services {
    mqtt: ConnectionState,
    fuzzy_system: &'static str,
}

#[derive(Debug, Serialize)]
struct RecommendationBody {
    status: &'static str,
    recommendation: Category,
    confidence: f64,
    no_rule_activated: bool,
    details: RecommendationDetails,
}

#[derive(Debug, Serialize)]
struct RecommendationDetails {
    rules_activated: Vec<RuleActivation>,
    input_values: EvaluationInput,
    corrections: Vec<InputCorrection>,
    clock_fallback: bool,
}

impl RecommendationBody {
    fn new(rec: Recommendation, record: &TelemetryRecord) -> Self {
        Self {
            status: "success",
            recommendation: rec.category,
            confidence: rec.confidence,
            no_rule_activated: rec.no_rule_activated(),
            details: RecommendationDetails {
                rules_activated: rec.rules_activated,
                input_values: rec.inputs,
                corrections: rec.corrections,
                clock_fallback: record.clock_fallback,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: String,
}

#[derive(Debug, Serialize)]
struct ControlBody {
    status: &'static str,
    action: Action,
    message: String,
    attempts: u32,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    connection: ConnectionState,
    rack_status: Option<String>,
    uptime_secs: u64,
    events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Browser dashboards call the API cross-origin, so any origin is allowed.
pub fn router<L: ControlLink>(core: Core<L>) -> Router {
    Router::new()
        .route("/health", get(health::<L>))
        .route("/api/data", get(latest_data::<L>))
        .route("/api/recommendation", get(recommendation::<L>))
        .route("/api/control", post(control::<L>))
        .route("/api/status", get(status::<L>))
        .layer(CorsLayer::permissive())
        .with_state(core)
}

async fn health<L: ControlLink>(State(core): State<Core<L>>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        timestamp: OffsetDateTime::now_utc(),
        uptime_secs: core.state.uptime_secs(),
        services: Services {
            mqtt: core.connection_status(),
            fuzzy_system: "ready",
        },
    })
}

async fn latest_data<L: ControlLink>(
    State(core): State<Core<L>>,
) -> Result<Json<TelemetryRecord>, ApiError> {
    let record = core
        .get_latest_telemetry()
        .ok_or(ApiError::NotFound("no sensor data available yet"))?;
    Ok(Json(record.as_ref().clone()))
}

async fn recommendation<L: ControlLink>(
    State(core): State<Core<L>>,
) -> Result<Json<RecommendationBody>, ApiError> {
    let record = core
        .get_latest_telemetry()
        .ok_or(ApiError::NotFound("no sensor data available for a recommendation"))?;
    let rec = core.evaluate(&record)?;
    tracing::info!(category = ?rec.category, confidence = rec.confidence, "recommendation");
    Ok(Json(RecommendationBody::new(rec, &record)))
}

async fn control<L: ControlLink>(
    State(core): State<Core<L>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlBody>, ApiError> {
    let outcome = core.send_control(&req.action).await?;
    if !outcome.success {
        return Err(ApiError::Internal(outcome.message));
    }
    Ok(Json(ControlBody {
        status: "success",
        action: outcome.action,
        message: outcome.message,
        attempts: outcome.attempts,
    }))
}

async fn status<L: ControlLink>(State(core): State<Core<L>>) -> Json<StatusBody> {
    Json(StatusBody {
        connection: core.connection_status(),
        rack_status: core.last_status(),
        uptime_secs: core.state.uptime_secs(),
        events: core.state.recent_events(),
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<L: ControlLink>(
    core: Core<L>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!("web api listening on http://{addr}");

    axum::serve(listener, router(core))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rack::tests::{core, push_reading, EchoLink};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(core: RackCore<EchoLink>) -> Router {
        router(Arc::new(core))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_control(action: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/control")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "action": action }).to_string()))
            .unwrap()
    }

    // -- /health --------------------------------------------------------------

    #[tokio::test]
    async fn health_reports_link_state() {
        let (status, json) = send(app(core(ConnectionState::Reconnecting)), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["services"]["mqtt"], "reconnecting");
        assert_eq!(json["services"]["fuzzy_system"], "ready");
        assert!(json["timestamp"].is_string());
    }

    // -- /api/data ------------------------------------------------------------

    #[tokio::test]
    async fn data_404_before_first_reading() {
        let (status, json) = send(app(core(ConnectionState::Connected)), get("/api/data")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn data_returns_latest_record() {
        let c = core(ConnectionState::Connected);
        push_reading(&c, "suhu:28.5,kelembapan:55,cahaya_analog:1800,hujan:tidak hujan,waktu:2025-06-24 21:28:44");
        let (status, json) = send(app(c), get("/api/data")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["temperature"], 28.5);
        assert_eq!(json["light"], 1800);
        assert_eq!(json["rain"], false);
        assert_eq!(json["last_update"], "2025-06-24T21:28:44");
        assert!(json.get("timestamp").is_none());
    }

    // -- /api/recommendation --------------------------------------------------

    #[tokio::test]
    async fn recommendation_404_without_data() {
        let (status, _) = send(app(core(ConnectionState::Connected)), get("/api/recommendation")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recommendation_for_rain() {
        let c = core(ConnectionState::Connected);
        push_reading(&c, "suhu:25,kelembapan:60,cahaya_analog:0,hujan:hujan,waktu:2025-06-24 12:00:00");
        let (status, json) = send(app(c), get("/api/recommendation")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["recommendation"], "poor");
        assert_eq!(json["no_rule_activated"], false);
        assert_eq!(json["details"]["rules_activated"][0]["id"], "R1");
        assert_eq!(json["details"]["input_values"]["hour"], 12.0);
    }

    #[tokio::test]
    async fn recommendation_400_on_invalid_humidity() {
        let c = core(ConnectionState::Connected);
        push_reading(&c, "suhu:25,kelembapan:120");
        let (status, json) = send(app(c), get("/api/recommendation")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("humidity"));
    }

    // -- /api/control ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn control_confirmed() {
        let (status, json) = send(app(core(ConnectionState::Connected)), post_control("BUKA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["action"], "buka");
        assert_eq!(json["attempts"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn control_invalid_action_400() {
        let (status, json) = send(app(core(ConnectionState::Connected)), post_control("lipat")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("lipat"));
    }

    #[tokio::test(start_paused = true)]
    async fn control_unconfirmed_500() {
        let (status, json) = send(app(core(ConnectionState::Disconnected)), post_control("tutup")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["detail"], "Failed to send command tutup after 3 attempts");
    }

    // -- /api/status ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn status_reports_echo_and_events() {
        let c = Arc::new(core(ConnectionState::Connected));
        c.send_control("tutup").await.unwrap();
        let (status, json) = send(router(Arc::clone(&c)), get("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connection"], "connected");
        assert_eq!(json["rack_status"], "tutup");
        assert_eq!(json["events"][0]["kind"], "control");
    }

    // -- CORS -----------------------------------------------------------------

    #[tokio::test]
    async fn any_origin_allowed() {
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://dashboard.local")
            .body(Body::empty())
            .unwrap();
        let response = app(core(ConnectionState::Connected)).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn control_preflight_allowed() {
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/control")
            .header(header::ORIGIN, "http://dashboard.local")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app(core(ConnectionState::Connected)).oneshot(req).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }
}
