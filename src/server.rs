use crate::config::AppConfig;
use crate::data;
use crate::lookup::Hit;
use crate::render::FeatureRef;
use crate::state::{MapController, RenderedMap, Selection};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub controller: Mutex<MapController>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("map for the current selection is still loading")]
    NotReady,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(e) => {
                error!("Request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Serialize)]
pub struct YearsResponse {
    years: Vec<String>,
    selected: Selection,
    /// Selection of the map currently served; lags `selected` while a load runs.
    published: Option<Selection>,
}

#[derive(Deserialize)]
pub struct SelectRequest {
    year: String,
}

#[derive(Deserialize)]
pub struct MapParams {
    hover: Option<String>,
}

#[derive(Deserialize)]
pub struct PointsParams {
    year: Option<String>,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/years", get(years_handler))
        .route("/api/selection", post(select_handler))
        .route("/api/map", get(map_handler))
        .route("/api/counties", get(counties_handler))
        .route("/api/points", get(points_handler))
        .route("/api/query", get(query_handler))
        .fallback_service(ServeDir::new("."))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let mut controller = MapController::with_files(config.clone());
    controller.select(&config.input.default_year)?;

    let state = Arc::new(AppState {
        config: config.clone(),
        controller: Mutex::new(controller),
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// The published map, only if it belongs to the current selection.
async fn current_map(state: &AppState) -> Result<Arc<RenderedMap>, ApiError> {
    let controller = state.controller.lock().await;
    controller
        .current_map()
        .filter(|map| map.selection == *controller.selection())
        .ok_or(ApiError::NotReady)
}

async fn years_handler(State(state): State<Arc<AppState>>) -> Json<YearsResponse> {
    let controller = state.controller.lock().await;
    Json(YearsResponse {
        years: controller.years().to_vec(),
        selected: controller.selection().clone(),
        published: controller.current_map().map(|map| map.selection.clone()),
    })
}

async fn select_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<Selection>, ApiError> {
    if !state.config.has_year(&req.year) {
        return Err(ApiError::NotFound(format!("Unknown year: {}", req.year)));
    }
    let selection = state.controller.lock().await.select(&req.year)?;
    info!(year = %selection.year, generation = selection.generation, "selection changed");
    Ok(Json(selection))
}

async fn map_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MapParams>,
) -> Result<Response, ApiError> {
    let map = current_map(&state).await?;

    let svg = match params.hover.as_deref() {
        None => map.scene.to_svg(),
        Some(spec) => {
            let feature = spec.parse::<FeatureRef>().map_err(ApiError::BadRequest)?;
            let mut scene = map.scene.clone();
            if !scene.hover(feature) {
                return Err(ApiError::NotFound(format!("No feature {spec}")));
            }
            scene.to_svg()
        }
    };

    let mut response = ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response();
    let headers = response.headers_mut();
    if let Ok(year) = HeaderValue::from_str(&map.selection.year) {
        headers.insert("x-map-year", year);
    }
    headers.insert("x-map-generation", HeaderValue::from(map.selection.generation));
    Ok(response)
}

async fn counties_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FeatureCollection>, ApiError> {
    let map = current_map(&state).await?;
    Ok(Json(data::counties_to_geojson(&map.counties)))
}

async fn points_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PointsParams>,
) -> Result<Json<FeatureCollection>, ApiError> {
    let Some(year) = params.year else {
        let map = current_map(&state).await?;
        return Ok(Json(data::points_to_geojson(&map.points)));
    };
    if !state.config.has_year(&year) {
        return Err(ApiError::NotFound(format!("Unknown year: {year}")));
    }
    if let Ok(map) = current_map(&state).await {
        if map.selection.year == year {
            return Ok(Json(data::points_to_geojson(&map.points)));
        }
    }
    let conversion =
        data::load_points(state.config.csv_path(&year), state.config.input.csv.clone()).await?;
    Ok(Json(data::points_to_geojson(&conversion.features)))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Hit>, ApiError> {
    let map = current_map(&state).await?;
    Ok(Json(map.index.lookup(&map.counties, &map.points, params.lon, params.lat)))
}
