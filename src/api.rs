use std::path::PathBuf;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};

use crate::{
    aggregator::SearchResponse,
    app_state::{AppState, Status},
    error::Error,
    models::DocumentRecord,
    pipeline::SearchOptions,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct RegisterDocumentPayload {
    path: String,
    #[serde(default)]
    tree_path: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
pub struct ScanDirPayload {
    path: String,
}

#[derive(Deserialize)]
pub struct SearchPayload {
    query: String,
    max_documents: Option<usize>,
    max_nodes_per_doc: Option<usize>,
    include_nodes: Option<bool>,
    rewrite: Option<bool>,
    timeout_secs: Option<u64>,
}

impl SearchPayload {
    fn options(&self) -> SearchOptions {
        SearchOptions {
            max_documents: self.max_documents,
            max_nodes_per_doc: self.max_nodes_per_doc,
            include_nodes: self.include_nodes,
            rewrite: self.rewrite,
            timeout: self.timeout_secs.map(std::time::Duration::from_secs),
        }
    }
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route(
            "/api/documents",
            get(list_documents_handler).post(register_document_handler),
        )
        .route("/api/documents/scan", post(scan_handler))
        .route("/api/documents/:doc_id", delete(remove_document_handler))
        .route("/api/search", post(search_handler))
        .route("/api/cache/clear", post(clear_cache_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn list_documents_handler(State(state): State<AppState>) -> Json<Vec<DocumentRecord>> {
    let documents = state.catalog.read().await.list_documents().to_vec();
    Json(documents)
}

#[axum::debug_handler]
async fn register_document_handler(
    State(state): State<AppState>,
    Json(payload): Json<RegisterDocumentPayload>,
) -> Result<Json<DocumentRecord>, ApiError> {
    let source = PathBuf::from(&payload.path);
    if !source.is_file() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "La ruta proporcionada no es un fichero válido.",
        ));
    }
    let tree_source = payload.tree_path.as_ref().map(PathBuf::from);

    let doc_id = state
        .indexer
        .register_document(&state.catalog, &source, tree_source.as_deref(), payload.force)
        .await
        .map_err(|e| {
            error!("Error registrando {}: {}", source.display(), e);
            error_response(&e)
        })?;

    let record = state.catalog.read().await.get_document(&doc_id).cloned();
    record
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::INTERNAL_SERVER_ERROR, "Documento no encontrado tras el alta."))
}

#[axum::debug_handler]
async fn scan_handler(
    State(state): State<AppState>,
    Json(payload): Json<ScanDirPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let root_dir = PathBuf::from(&payload.path);
    if !root_dir.is_dir() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "La ruta proporcionada no es un directorio válido.",
        ));
    }

    {
        let mut status = lock_status(&state);
        if status.is_busy {
            return Err(api_error(StatusCode::CONFLICT, "Ya hay una indexación en curso."));
        }
        status.is_busy = true;
        status.message = "Iniciando indexación...".to_string();
        status.progress = 0.0;
    }

    spawn(async move {
        let result = state
            .indexer
            .register_directory(&state.catalog, &root_dir, Some(state.status.clone()))
            .await;

        let mut status = lock_status(&state);
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                status.message = format!("¡Indexación completada! {}", summary);
            }
            Err(err) => {
                status.message = format!("Error en la indexación: {}", err);
                error!("Error de indexación: {}", err);
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn remove_document_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state
        .catalog
        .write()
        .await
        .remove(&doc_id)
        .map_err(|e| error_response(&e))?;
    if !removed {
        return Err(api_error(StatusCode::NOT_FOUND, "Documento no encontrado."));
    }
    state.pipeline.store().invalidate(&doc_id);
    Ok(Json(json!({ "removed": doc_id })))
}

#[axum::debug_handler]
async fn search_handler(
    State(state): State<AppState>,
    Json(payload): Json<SearchPayload>,
) -> Result<Json<SearchResponse>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "La consulta no puede estar vacía."));
    }

    // Instantánea del catálogo: el lock no se mantiene durante las llamadas al LLM.
    let documents = state.catalog.read().await.list_documents().to_vec();
    state
        .pipeline
        .search(&documents, &payload.query, &payload.options())
        .await
        .map(Json)
        .map_err(|e| {
            error!("Error en la búsqueda: {}", e);
            error_response(&e)
        })
}

#[axum::debug_handler]
async fn clear_cache_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = state.pipeline.store();
    let cleared = store.cached_len();
    store.clear_cache();
    Json(json!({ "cleared": cleared }))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    let status = lock_status(&state).clone();
    Json(status)
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

// --- Utilidades ---

fn lock_status(state: &AppState) -> std::sync::MutexGuard<'_, Status> {
    state
        .status
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn error_response(err: &Error) -> ApiError {
    let status = match err {
        Error::UnsupportedDocument { .. } | Error::Configuration { .. } => StatusCode::BAD_REQUEST,
        Error::TreeLoad { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        Error::ReasoningCall { .. } | Error::Contract { .. } => StatusCode::BAD_GATEWAY,
        Error::SearchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_codes() {
        let (status, Json(body)) = error_response(&Error::UnsupportedDocument {
            path: PathBuf::from("a.docx"),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some_and(|m| m.contains("a.docx")));

        let (status, _) = error_response(&Error::contract("missing 'rewritten_query'"));
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = error_response(&Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        )));
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn search_payload_maps_overrides() {
        let payload: SearchPayload = serde_json::from_value(json!({
            "query": "q",
            "include_nodes": false,
            "max_documents": 2,
            "timeout_secs": 10
        }))
        .expect("payload");
        let options = payload.options();
        assert_eq!(options.max_documents, Some(2));
        assert_eq!(options.include_nodes, Some(false));
        assert_eq!(options.rewrite, None);
        assert_eq!(options.timeout, Some(std::time::Duration::from_secs(10)));
    }
}
