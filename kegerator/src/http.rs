//! HTTP surface
//!
//! Every endpoint is GET-only and answers other methods with 405. Errors are
//! JSON objects of the form `{"error": "..."}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::{Json, Router};
use kegerator_core::{Calibration, Error, FlowHandle, PrometheusSink, ReloadCoordinator};
use serde_json::json;

const DEFAULT_POUR_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<ReloadCoordinator>,
    metrics: Arc<PrometheusSink>,
    timeout: Duration,
}

impl AppState {
    pub fn new(
        coordinator: Arc<ReloadCoordinator>,
        metrics: Arc<PrometheusSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            metrics,
            timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/state", get_only(get(state_snapshot)))
        .route("/pours", get_only(get(pours)))
        .route("/refill", get_only(get(refill)))
        .route("/calibrate", get_only(get(calibrate)))
        .route("/metrics", get_only(get(metrics)))
        .route("/ok", get_only(get(ok)))
        .route("/reload/status", get_only(get(reload_status)))
        .with_state(state)
}

fn get_only(route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    route.fallback(method_not_allowed)
}

async fn method_not_allowed() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(_) => Self::bad_request(e.to_string()),
            Error::Stopped(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            _ => {
                // Details stay in the log
                tracing::error!(error = %e, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

type Params = Query<HashMap<String, String>>;

/// A non-empty query parameter
fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(params: &HashMap<String, String>, name: &str) -> Result<Option<T>, ApiError>
where
    T::Err: std::fmt::Display,
{
    param(params, name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| ApiError::bad_request(format!("bad {} value {:?}: {}", name, raw, e)))
        })
        .transpose()
}

fn required_pin(params: &HashMap<String, String>) -> Result<u8, ApiError> {
    parse(params, "pin")?.ok_or_else(|| ApiError::bad_request("pin query param required"))
}

/// Wait for a queued command, bounded by the request timeout
async fn bounded<T>(
    timeout: Duration,
    flow: &FlowHandle,
    fut: impl std::future::Future<Output = kegerator_core::Result<T>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("keg on pin {} did not respond in time", flow.pin()),
        )),
    }
}

async fn state_snapshot(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.coordinator.handle().current().snapshot())
}

async fn pours(State(app): State<AppState>, Query(params): Params) -> Result<Response, ApiError> {
    let limit = parse(&params, "limit")?.unwrap_or(DEFAULT_POUR_LIMIT);

    let state = app.coordinator.handle().current();
    let mut pours: Vec<_> = state.flows().iter().flat_map(FlowHandle::pours).collect();
    pours.sort_by(|a, b| b.start_micros.cmp(&a.start_micros));
    pours.truncate(limit);

    Ok(Json(pours).into_response())
}

async fn refill(State(app): State<AppState>, Query(params): Params) -> Result<Response, ApiError> {
    let pin = required_pin(&params)?;
    let state = app.coordinator.handle().current();
    let flow = state
        .flow(pin)
        .ok_or_else(|| ApiError::bad_request(format!("no keg found on pin {}", pin)))?;

    let contents = match param(&params, "contents") {
        Some(contents) => contents.to_string(),
        None => {
            let existing = flow.labels().contents;
            tracing::warn!(pin, contents = %existing, "refilling with existing contents");
            existing
        }
    };

    bounded(app.timeout, flow, flow.refill(contents.clone())).await?;
    Ok(Json(json!({ "pin": pin, "contents": contents })).into_response())
}

async fn calibrate(
    State(app): State<AppState>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let pin = required_pin(&params)?;
    let change = match (parse(&params, "constant")?, parse(&params, "coefficient")?) {
        (Some(constant), _) => Calibration::Constant(constant),
        (None, Some(coefficient)) => Calibration::Coefficient(coefficient),
        (None, None) => {
            return Err(ApiError::bad_request(
                "constant or coefficient query param required",
            ))
        }
    };

    let state = app.coordinator.handle().current();
    let flow = state
        .flow(pin)
        .ok_or_else(|| ApiError::bad_request(format!("no keg found on pin {}", pin)))?;

    match bounded(app.timeout, flow, flow.calibrate(change)).await? {
        Some(constant) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "pin": pin, "flow_constant": constant })),
        )
            .into_response()),
        None => {
            let constant = flow.with(|agg| agg.sensor().flow_constant);
            tracing::warn!(pin, constant, "flow constant unchanged");
            Ok(Json(json!({ "pin": pin, "flow_constant": constant })).into_response())
        }
    }
}

async fn metrics(State(app): State<AppState>) -> Result<Response, ApiError> {
    let started = Instant::now();
    app.coordinator.handle().current().refresh_gauges();
    let body = app.metrics.encode()?;
    app.metrics
        .http_request_duration_add("/metrics", started.elapsed().as_secs_f64());
    Ok(([(header::CONTENT_TYPE, app.metrics.content_type())], body).into_response())
}

async fn ok() -> StatusCode {
    StatusCode::OK
}

async fn reload_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.coordinator.status())
}
