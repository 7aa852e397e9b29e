use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Number, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::models::StudentPrediction;
use crate::store::{PredictionTable, StoreError};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub index: String,
    pub predictions: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppState {
    predictions: Arc<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("student_id required")]
    MissingStudentId,
    #[error("student_id not found")]
    StudentNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingStudentId => StatusCode::BAD_REQUEST,
            ApiError::StudentNotFound => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "prediction lookup failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub student_id: String,
    pub student_name: String,
    pub current_gpa: Value,
    pub predicted_next_term_gpa: Value,
    pub risk_level: Value,
    pub risk_probability_high: Value,
}

/// Numeric text becomes a JSON number, other text a string, absence null.
fn numeric_value(raw: Option<String>) -> Value {
    match raw {
        None => Value::Null,
        Some(text) => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
    }
}

impl From<StudentPrediction> for PredictionResponse {
    fn from(row: StudentPrediction) -> Self {
        Self {
            student_id: row.student_id,
            student_name: row.student_name,
            current_gpa: numeric_value(row.current_gpa),
            predicted_next_term_gpa: numeric_value(row.predicted_next_term_gpa),
            risk_level: row.risk_level.map(Value::String).unwrap_or(Value::Null),
            risk_probability_high: numeric_value(row.risk_probability_high),
        }
    }
}

async fn prediction_handler(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    // first student_id wins when the parameter is repeated
    let Query(pairs) = query.map_err(|_| ApiError::MissingStudentId)?;
    let student_id = pairs
        .iter()
        .find(|(key, _)| key == "student_id")
        .map(|(_, value)| value.trim())
        .unwrap_or_default();
    if student_id.is_empty() {
        return Err(ApiError::MissingStudentId);
    }

    // reloaded on every request
    let path = state.predictions.as_path();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::from_io(path, e))?;
    let table = PredictionTable::parse(&text)?;

    let row = table
        .latest_for(student_id)
        .ok_or(ApiError::StudentNotFound)?;
    Ok(Json(row.into()))
}

pub fn build_router(config: &ServerConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let state = AppState {
        predictions: Arc::new(config.predictions.clone()),
    };

    Router::new()
        .route_service("/", ServeFile::new(config.static_dir.join(&config.index)))
        .route("/api/prediction", get(prediction_handler))
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the configured host, which may be a name such as `localhost`.
pub async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))
}

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let app = build_router(&config);
    let listener = bind(&config).await?;
    let addr = listener.local_addr()?;
    info!(
        %addr,
        static_dir = %config.static_dir.display(),
        predictions = %config.predictions.display(),
        "prediction API listening"
    );
    println!("Serving on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
