use crate::semantic::{EngineError, EngineStats, RoomEntry, SearchEngine, SearchHit};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    engine: Arc<SearchEngine>,
}

pub fn router(engine: Arc<SearchEngine>) -> Router {
    let shared_state = Arc::new(SharedState { engine });

    Router::new()
        .route("/search", post(search))
        .route("/add_room", post(add_room))
        .route("/delete_room", post(delete_room))
        .route("/rooms", get(rooms))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(engine: Arc<SearchEngine>, addr: &str) -> anyhow::Result<()> {
    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    log::error!("failed to install SIGTERM handler: {e}");
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

    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn start_daemon(engine: Arc<SearchEngine>, addr: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(engine, addr).await })
}

// Wraps the engine error so it can become a response.
#[derive(Debug)]
struct HttpError(EngineError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Provider(_) | EngineError::Persistence(_) | EngineError::Internal(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(json!({
                "status": "error",
                "code": self.0.code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

// Lets handlers use `?` on anything that converts into `EngineError`.
impl<E> From<E> for HttpError
where
    E: Into<EngineError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl From<JsonRejection> for EngineError {
    fn from(rejection: JsonRejection) -> Self {
        EngineError::Validation(rejection.body_text())
    }
}

/// `Json` extractor whose rejections use the API's error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(HttpError))]
struct AppJson<T>(T);

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub k: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRoomRequest {
    pub room_id: Option<String>,
    pub room_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRoomRequest {
    pub room_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    stats: EngineStats,
}

fn success() -> Json<Value> {
    Json(json!({"status": "success"}))
}

async fn search(
    State(state): State<Arc<SharedState>>,
    AppJson(payload): AppJson<SearchRequest>,
) -> Result<Json<Vec<SearchHit>>, HttpError> {
    log::debug!("payload: {payload:?}");

    let k = match payload.k {
        None => None,
        Some(k) if k >= 1 => Some(usize::try_from(k).unwrap_or(usize::MAX)),
        Some(_) => {
            return Err(EngineError::Validation("k must be a positive integer".to_string()).into())
        }
    };
    let query = payload.query.unwrap_or_default();

    tokio::task::block_in_place(move || {
        state
            .engine
            .search(&query, k)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn add_room(
    State(state): State<Arc<SharedState>>,
    AppJson(payload): AppJson<AddRoomRequest>,
) -> Result<Json<Value>, HttpError> {
    log::debug!("payload: {payload:?}");

    let room_id = payload.room_id.unwrap_or_default();
    let room_name = payload.room_name.unwrap_or_default();

    tokio::task::block_in_place(move || {
        state.engine.add_room(&room_id, &room_name)?;
        Ok(success())
    })
}

async fn delete_room(
    State(state): State<Arc<SharedState>>,
    AppJson(payload): AppJson<DeleteRoomRequest>,
) -> Result<Json<Value>, HttpError> {
    log::debug!("payload: {payload:?}");

    let room_id = payload.room_id.unwrap_or_default();

    tokio::task::block_in_place(move || {
        state.engine.delete_room(&room_id)?;
        Ok(success())
    })
}

async fn rooms(State(state): State<Arc<SharedState>>) -> Result<Json<Vec<RoomEntry>>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.engine.rooms()?)))
}

async fn health(State(state): State<Arc<SharedState>>) -> Result<impl IntoResponse, HttpError> {
    tokio::task::block_in_place(move || {
        let stats = state.engine.stats()?;
        Ok(Json(HealthResponse {
            status: "ok",
            stats,
        }))
    })
}
