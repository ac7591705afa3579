use crate::{
    app::{App, AppError, ItemView, Upload, UploadResponse},
    config::Config,
    embedding::EmbeddingEngine,
    feed::{FeedPage, FeedQuery},
    hub::{self, Hub},
};
use anyhow::Context;
use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        ws::WebSocketUpgrade,
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer};

/// Slack on top of the image limit for the other multipart fields
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
    hub: Hub,
}

pub fn router(app: Arc<App>, hub: Hub) -> Router {
    let max_body = app.ingest.max_bytes() + FORM_OVERHEAD_BYTES;
    let uploads_dir = app.config.uploads_dir();
    let thumbnails_dir = app.config.thumbnails_dir();

    let shared_state = Arc::new(SharedState { app, hub });

    // file names are unique per upload, so served files never change
    let immutable = SetResponseHeaderLayer::if_not_present(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    Router::new()
        .route("/api/upload", post(upload))
        .route("/api/feed", get(feed))
        .route("/api/items/:id", get(item))
        .route("/ws", get(live))
        .nest_service("/uploads", ServeDir::new(uploads_dir))
        .nest_service("/thumbnails", ServeDir::new(thumbnails_dir))
        .layer(immutable)
        .layer(DefaultBodyLimit::max(max_body))
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
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
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

    log::info!("shutdown signal received");
}

async fn start_app(config: Config, engine: Arc<EmbeddingEngine>) -> anyhow::Result<()> {
    let hub = Hub::start(&config.hub);
    let listen_addr = config.listen_addr.clone();

    let app = tokio::task::block_in_place(|| {
        let app = App::open(config, engine, Arc::new(hub.clone()))?;
        app.startup()?;
        Ok::<_, anyhow::Error>(Arc::new(app))
    })?;

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("couldnt bind {listen_addr}"))?;
    log::info!("listening on {listen_addr}");

    let served = axum::serve(listener, router(app.clone(), hub.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    hub.shutdown().await;

    log::warn!("waiting for pipeline to drain");
    tokio::task::block_in_place(|| app.shutdown());

    served.context("http server failed")
}

pub fn start_daemon(config: Config) -> anyhow::Result<()> {
    // loading the model may download it, do that before serving
    let engine = Arc::new(EmbeddingEngine::from_config(
        &config.embedding,
        &config.models_dir(),
    )?);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(config, engine).await })
}

// Make our own error that wraps `AppError`.
#[derive(Debug)]
pub struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => {
                log::warn!("{self:?}");
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::IO(_) | AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

// This enables using `?` on anything convertible into `AppError`.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn invalid_form(err: impl std::fmt::Display) -> HttpError {
    HttpError(AppError::InvalidInput(format!("invalid multipart form: {err}")))
}

async fn upload(
    State(state): State<Arc<SharedState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), HttpError> {
    let mut upload = Upload::default();

    while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                upload.filename = field.file_name().unwrap_or_default().to_string();
                upload.bytes = field.bytes().await.map_err(invalid_form)?.to_vec();
            }
            Some("title") => upload.title = field.text().await.map_err(invalid_form)?,
            Some("tags") => {
                let raw = field.text().await.map_err(invalid_form)?;
                if !raw.trim().is_empty() {
                    upload.tags = serde_json::from_str(&raw).map_err(|_| {
                        AppError::InvalidInput("invalid tags format".to_string())
                    })?;
                }
            }
            _ => {}
        }
    }

    log::debug!("upload: {upload:?}");

    let ingest = state.app.ingest.clone();
    let response = tokio::task::block_in_place(move || ingest.upload(upload))?;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn feed(
    State(state): State<Arc<SharedState>>,
    query: Result<Query<FeedQuery>, QueryRejection>,
) -> Result<Json<FeedPage>, HttpError> {
    let Query(query) =
        query.map_err(|rejection| AppError::InvalidInput(rejection.body_text()))?;
    let feed = state.app.feed.clone();

    tokio::task::block_in_place(move || feed.query(query))
        .map(Json)
        .map_err(Into::into)
}

async fn item(
    State(state): State<Arc<SharedState>>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Json<ItemView>, HttpError> {
    let Path(id) = id.map_err(|rejection| AppError::InvalidInput(rejection.body_text()))?;
    let ingest = state.app.ingest.clone();
    let item = tokio::task::block_in_place(move || ingest.item(id))?;
    Ok(Json(item))
}

async fn live(State(state): State<Arc<SharedState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub::serve_socket(socket, hub))
}
