use crate::{
    app::{AppBackend, AppError, AppLocal, BackfillRequest, CorpusStatus},
    ids::ItemId,
    items::{Item, ItemCreate},
    matching::Match,
    pipeline::{BackfillReport, UpdateReport},
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    app: Arc<AppLocal>,
}

pub fn router(app: Arc<AppLocal>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/embeddings/generate", post(generate_embedding))
        .route("/api/embeddings/backfill", post(backfill_embeddings))
        .route("/api/matches", post(find_matches))
        .route("/api/events/item_created", post(item_created))
        .route("/api/items", post(create_item))
        .route("/api/items/delete", post(delete_item))
        .route("/api/items/:id", get(get_item))
        .route("/api/status", get(status))
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
            Ok(mut sig) => {
                sig.recv().await;
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

    log::warn!("shutting down, waiting for in-flight requests");
}

/// Serves the HTTP API until SIGINT/SIGTERM, then drains the trigger queue.
pub fn start_daemon(app: AppLocal, listen: &str) -> anyhow::Result<()> {
    let app = Arc::new(app);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on({
        let router = router(app.clone());
        async move {
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            log::info!("listening on {listen}");

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server error")
        }
    })?;

    log::warn!("waiting for trigger queue to drain");
    app.shutdown();

    Ok(())
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Store(_) | AppError::Reqwest(_) | AppError::Other(_) => {
                log::error!("{:?}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Runs a backend call on the blocking pool; every backend call may wait on
/// the store lock or the embedding provider.
async fn blocking<T, F>(state: Arc<SharedState>, f: F) -> Result<Json<T>, HttpError>
where
    F: FnOnce(&AppLocal) -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state.app))
        .await
        .map_err(|err| AppError::Other(err.into()))?
        .map(Json)
        .map_err(Into::into)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRequest {
    pub item_id: ItemId,
}

async fn generate_embedding(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ItemRequest>,
) -> Result<Json<UpdateReport>, HttpError> {
    log::debug!("payload: {payload:?}");
    blocking(state, move |app| app.generate_embedding(&payload.item_id)).await
}

async fn backfill_embeddings(
    State(state): State<Arc<SharedState>>,
    payload: Option<Json<BackfillRequest>>,
) -> Result<Json<BackfillReport>, HttpError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    log::debug!("payload: {request:?}");
    blocking(state, move |app| app.backfill_embeddings(request)).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchesRequest {
    pub item_id: ItemId,
    #[serde(default)]
    pub k: Option<usize>,
}

async fn find_matches(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<MatchesRequest>,
) -> Result<Json<Vec<Match>>, HttpError> {
    log::debug!("payload: {payload:?}");
    blocking(state, move |app| app.find_matches(&payload.item_id, payload.k)).await
}

async fn item_created(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ItemRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), HttpError> {
    log::debug!("payload: {payload:?}");
    state.app.notify_item_created(&payload.item_id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"queued": true}))))
}

async fn create_item(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ItemCreate>,
) -> Result<Json<Item>, HttpError> {
    log::debug!("payload: {payload:?}");
    blocking(state, move |app| app.create_item(payload)).await
}

async fn get_item(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<Item>, HttpError> {
    blocking(state, move |app| app.get_item(&id)).await
}

async fn delete_item(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ItemRequest>,
) -> Result<Json<Item>, HttpError> {
    log::debug!("payload: {payload:?}");
    blocking(state, move |app| app.delete_item(&payload.item_id)).await
}

async fn status(State(state): State<Arc<SharedState>>) -> Result<Json<CorpusStatus>, HttpError> {
    blocking(state, |app| app.status()).await
}
