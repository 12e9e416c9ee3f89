// Estate History - Web Server
// Read-only REST API over the versioned entities

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use estate_history::temporal::parse_timestamp;
use estate_history::{
    verify_timeline, with_kind_store, AppConfig, Clock, HistoryRow, Persistence, Stores,
    TemporalStore, TimelineReport, Versioned, VersioningError,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    stores: Arc<Stores>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

/// Map store errors onto HTTP status codes
fn from_store_error(err: VersioningError) -> Response {
    let status = match &err {
        VersioningError::NotFound { .. } => StatusCode::NOT_FOUND,
        VersioningError::AlreadyExists { .. } | VersioningError::ConcurrentModification { .. } => {
            StatusCode::CONFLICT
        }
        VersioningError::InvalidTimestamp { .. } => StatusCode::BAD_REQUEST,
        _ => {
            error!("store error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}

fn unknown_kind(kind: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("unknown kind '{}'", kind))
}

/// Current record response
#[derive(Serialize)]
struct CurrentResponse<A> {
    id: String,
    kind: &'static str,
    effective_since: DateTime<Utc>,
    generation: u32,
    attributes: A,
}

/// Point-in-time response
#[derive(Serialize)]
struct AsOfResponse<A> {
    id: String,
    kind: &'static str,
    as_of: DateTime<Utc>,
    attributes: A,
}

// ============================================================================
// Generic handlers (one per operation, any kind)
// ============================================================================

fn current_of<A, B, C>(store: &TemporalStore<A, B, C>, id: &str) -> Response
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    match store.read_record(id) {
        Ok(record) => ApiResponse::ok(CurrentResponse {
            id: record.id,
            kind: store.kind(),
            effective_since: record.effective_since,
            generation: record.generation,
            attributes: record.attrs,
        }),
        Err(e) => from_store_error(e),
    }
}

fn history_of<A, B, C>(store: &TemporalStore<A, B, C>, id: &str) -> Response
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    let rows = store
        .read_history(id)
        .and_then(|cursor| cursor.collect::<estate_history::Result<Vec<HistoryRow<A>>>>());
    match rows {
        Ok(rows) => ApiResponse::ok(rows),
        Err(e) => from_store_error(e),
    }
}

fn as_of<A, B, C>(store: &TemporalStore<A, B, C>, id: &str, time: DateTime<Utc>) -> Response
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    match store.read_as_of(id, time) {
        Ok(attributes) => ApiResponse::ok(AsOfResponse {
            id: id.to_string(),
            kind: store.kind(),
            as_of: time,
            attributes,
        }),
        Err(e) => from_store_error(e),
    }
}

fn verify_of<A, B, C>(store: &TemporalStore<A, B, C>, id: &str) -> Response
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    match verify_timeline(store, id) {
        Ok(report) => ApiResponse::<TimelineReport>::ok(report),
        Err(e) => from_store_error(e),
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// GET /api/:kind/:id - Current attributes
async fn get_current(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let stores = &state.stores;
    with_kind_store!(stores, kind.as_str(), |store| current_of(store, &id), unknown_kind(&kind))
}

/// GET /api/:kind/:id/history - Closed history rows, oldest first
async fn get_history(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let stores = &state.stores;
    with_kind_store!(stores, kind.as_str(), |store| history_of(store, &id), unknown_kind(&kind))
}

/// GET /api/:kind/:id/as-of/:timestamp - Attributes in effect at a time
async fn get_as_of(
    State(state): State<AppState>,
    Path((kind, id, timestamp)): Path<(String, String, String)>,
) -> Response {
    // "+" in a path segment arrives percent-encoded
    let decoded = urlencoding::decode(&timestamp)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| timestamp.clone());
    let time = match parse_timestamp(&decoded) {
        Ok(time) => time,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid timestamp '{}': {}", decoded, e),
            )
        }
    };

    let stores = &state.stores;
    with_kind_store!(stores, kind.as_str(), |store| as_of(store, &id, time), unknown_kind(&kind))
}

/// GET /api/:kind/:id/verify - Timeline consistency report
async fn get_verify(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let stores = &state.stores;
    with_kind_store!(stores, kind.as_str(), |store| verify_of(store, &id), unknown_kind(&kind))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("estate_history=debug".parse()?),
        )
        .init();

    let config = AppConfig::from_env();
    let stores = Stores::open(&config)?;
    info!("Database opened: {}", config.db_path.display());

    let state = AppState {
        stores: Arc::new(stores),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/:kind/:id", get(get_current))
        .route("/:kind/:id/history", get(get_history))
        .route("/:kind/:id/as-of/:timestamp", get(get_as_of))
        .route("/:kind/:id/verify", get(get_verify))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server running on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let now = Utc::now();
        let cases = [
            (VersioningError::not_found("realtor", "R1"), StatusCode::NOT_FOUND),
            (VersioningError::already_exists("realtor", "R1"), StatusCode::CONFLICT),
            (VersioningError::conflict("realtor", "R1", now), StatusCode::CONFLICT),
            (
                VersioningError::invalid_timestamp("realtor", "R1", now, "must be after"),
                StatusCode::BAD_REQUEST,
            ),
            (VersioningError::LockPoisoned, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(from_store_error(err).status(), status);
        }
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        assert_eq!(unknown_kind("listing").status(), StatusCode::NOT_FOUND);
    }
}
