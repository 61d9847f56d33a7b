use std::path::PathBuf;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Router,
};
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{spawn, sync::mpsc};
use tracing::{error, info, warn};
use url::Url;

use crate::{
    app_state::{AppState, SessionSlot, Status},
    ingest::UploadItem,
    models::{AssistantConfig, DataType},
    openai::{AssistantUpdate, FILE_SEARCH},
    poll::CancelSignal,
    rag::{AgentEvent, ChatSession, TurnRequest},
};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal(context: &str, err: anyhow::Error) -> ApiError {
    error!("{context}: {err:#}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {err:#}"))
}

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct IngestUrlPayload {
    url: String,
}

#[derive(Deserialize)]
pub struct IngestDirPayload {
    path: String,
}

#[derive(Deserialize)]
pub struct AssistantPayload {
    /// Id del documento de configuración; vacío para crear uno nuevo.
    #[serde(default)]
    id: String,
    #[serde(default)]
    assistant_id: String,
    assistant_name: String,
    #[serde(rename = "Prompt", alias = "prompt")]
    prompt: String,
}

/// Configuración de asistente tal como la ve el cliente, con su id de documento.
#[derive(Serialize)]
pub struct AssistantView {
    id: String,
    #[serde(flatten)]
    config: AssistantConfig,
}

impl From<AssistantConfig> for AssistantView {
    fn from(config: AssistantConfig) -> Self {
        Self {
            id: config.id.clone(),
            config,
        }
    }
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    // Los formularios de vídeo y audio superan el límite por defecto de axum.
    let upload_limit = DefaultBodyLimit::max(app_state.config.max_upload_bytes);
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/health", get(health_handler))
        .route("/api/upload", post(upload_handler).layer(upload_limit))
        .route("/api/ingest-url", post(ingest_url_handler))
        .route("/api/ingest-directory", post(ingest_directory_handler))
        .route(
            "/api/assistants",
            get(list_assistants_handler).post(save_assistant_handler),
        )
        .route("/api/assistants/:id", delete(delete_assistant_handler))
        .route("/api/facets", get(facets_handler))
        .route("/api/chat/sessions", post(create_session_handler))
        .route("/api/chat/sessions/:id", delete(delete_session_handler))
        .route("/api/chat/sessions/:id/messages", post(chat_message_handler))
        .route("/api/chat/sessions/:id/cancel", post(cancel_turn_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Ingesta ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.snapshot())
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.search.ping().await {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(err) => {
            error!("Error en el health check de Elasticsearch: {err:#}");
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Elasticsearch no responde: {err:#}"),
            ))
        }
    }
}

/// Construye el lote a partir del campo `kind` y los ficheros del formulario.
fn upload_items(kind: Option<String>, files: Vec<(String, Vec<u8>)>) -> Result<Vec<UploadItem>, ApiError> {
    let kind = kind
        .as_deref()
        .and_then(DataType::parse)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Falta un campo 'kind' válido (image, text, video o audio)."))?;
    if files.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No se ha subido ningún fichero."));
    }
    Ok(files
        .into_iter()
        .map(|(name, bytes)| UploadItem::bytes(kind, &name, bytes))
        .collect())
}

/// Lanza un lote en segundo plano; sólo puede haber uno a la vez.
fn start_batch(state: AppState, items: Vec<UploadItem>) -> Result<(), ApiError> {
    let message = format!("Iniciando ingesta de {} elementos...", items.len());
    if !state.status.try_begin(&message) {
        return Err(api_error(StatusCode::CONFLICT, "Ya hay una ingesta en curso."));
    }
    spawn(async move {
        let summary = state.ingestor.ingest_batch(items, &state.status).await;
        state.status.finish(format!("¡Ingesta completada! {summary}"));
    });
    Ok(())
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let bad_form = |e: axum::extract::multipart::MultipartError| {
        api_error(StatusCode::BAD_REQUEST, format!("Formulario no válido: {e}"))
    };

    let mut kind = None;
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        if field.name() == Some("kind") {
            kind = Some(field.text().await.map_err(bad_form)?);
            continue;
        }
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(bad_form)?;
        files.push((name, bytes.to_vec()));
    }

    let items = upload_items(kind, files)?;
    let count = items.len();
    start_batch(state, items)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("{count} ficheros en cola para la ingesta.") })),
    ))
}

#[axum::debug_handler]
async fn ingest_url_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestUrlPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let url = Url::parse(payload.url.trim())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("URL no válida: {e}")))?;
    let item = UploadItem::video_url(url);
    item.validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("{e:#}")))?;

    start_batch(state, vec![item])?;
    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn ingest_directory_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestDirPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let root_dir = PathBuf::from(&payload.path);
    if !root_dir.is_dir() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "La ruta proporcionada no es un directorio válido.",
        ));
    }
    if !state.status.try_begin("Iniciando ingesta del directorio...") {
        return Err(api_error(StatusCode::CONFLICT, "Ya hay una ingesta en curso."));
    }

    spawn(async move {
        match state.ingestor.ingest_directory(&root_dir, &state.status).await {
            Ok(summary) => state.status.finish(format!("¡Ingesta completada! {summary}")),
            Err(err) => {
                error!("Error de ingesta: {err:#}");
                state.status.finish(format!("Error en la ingesta: {err:#}"));
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

// --- Asistentes ---

#[axum::debug_handler]
async fn list_assistants_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<AssistantView>>, ApiError> {
    state
        .search
        .list_assistants()
        .await
        .map(|configs| Json(configs.into_iter().map(AssistantView::from).collect()))
        .map_err(|e| internal("Error listando asistentes", e))
}

/// Crea el asistente remoto si aún no existe (o le reaplica la configuración)
/// y guarda su documento en el índice.
#[axum::debug_handler]
async fn save_assistant_handler(
    State(state): State<AppState>,
    Json(payload): Json<AssistantPayload>,
) -> Result<Json<AssistantView>, ApiError> {
    if payload.assistant_name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "El nombre del asistente es obligatorio."));
    }

    let assistant_id = if payload.assistant_id.is_empty() {
        let created = state
            .openai
            .create_assistant(&payload.assistant_name, &payload.prompt)
            .await
            .map_err(|e| internal("Error creando el asistente", e))?;
        info!("Asistente '{}' creado como {}", payload.assistant_name, created.id);
        created.id
    } else {
        state
            .openai
            .update_assistant(
                &payload.assistant_id,
                &AssistantUpdate {
                    name: Some(payload.assistant_name.clone()),
                    instructions: Some(payload.prompt.clone()),
                    model: Some(state.openai.assistant_model.clone()),
                    tools: vec![FILE_SEARCH],
                },
            )
            .await
            .map_err(|e| internal("Error actualizando el asistente", e))?;
        payload.assistant_id
    };

    let mut config = AssistantConfig {
        id: payload.id,
        assistant_id,
        assistant_name: payload.assistant_name,
        prompt: payload.prompt,
    };
    config.id = state
        .search
        .upsert_assistant(&config)
        .await
        .map_err(|e| internal("Error guardando la configuración", e))?;
    Ok(Json(config.into()))
}

#[axum::debug_handler]
async fn delete_assistant_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .search
        .delete_assistant(&id)
        .await
        .map_err(|e| internal("Error borrando la configuración", e))?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn facets_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let keywords = state
        .search
        .unique_keywords()
        .await
        .map_err(|e| internal("Error agregando keywords", e))?;
    let domains = state
        .search
        .unique_domains()
        .await
        .map_err(|e| internal("Error agregando dominios", e))?;
    Ok(Json(json!({ "keywords": keywords, "domains": domains })))
}

// --- Chat ---

#[axum::debug_handler]
async fn create_session_handler(State(state): State<AppState>) -> Result<Json<ChatSession>, ApiError> {
    let session = state
        .agent
        .start_session()
        .await
        .map_err(|e| internal("Error abriendo la sesión", e))?;
    state
        .sessions
        .lock()
        .await
        .insert(session.id.clone(), SessionSlot::new(session.clone()));
    Ok(Json(session))
}

/// Olvida una sesión sin turno en curso.
#[axum::debug_handler]
async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut sessions = state.sessions.lock().await;
    match sessions.get(&id) {
        None => Err(api_error(StatusCode::NOT_FOUND, format!("Sesión desconocida: {id}"))),
        Some(slot) if slot.cancel.is_some() => Err(api_error(
            StatusCode::CONFLICT,
            "La sesión tiene un turno en curso; cancélalo antes de cerrarla.",
        )),
        Some(_) => {
            sessions.remove(&id);
            info!("Sesión {id} cerrada");
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

fn to_sse(event: &AgentEvent) -> Result<Event, axum::Error> {
    Event::default().json_data(event)
}

/// Ejecuta un turno y devuelve sus eventos como Server-Sent Events.
#[axum::debug_handler]
async fn chat_message_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let (mut session, signal) = {
        let mut sessions = state.sessions.lock().await;
        let slot = sessions
            .get_mut(&id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Sesión desconocida: {id}")))?;
        if slot.cancel.is_some() {
            return Err(api_error(StatusCode::CONFLICT, "La sesión ya tiene un turno en curso."));
        }
        slot.session
            .check_mode(request.mode)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("{e:#}")))?;
        let (handle, signal) = CancelSignal::pair();
        slot.cancel = Some(handle);
        (slot.session.clone(), signal)
    };

    let (tx, rx) = mpsc::channel::<AgentEvent>(64);
    spawn(async move {
        if let Err(err) = state.agent.run_turn(&mut session, request, &tx, signal).await {
            error!("Error en el turno de la sesión {}: {err:#}", session.id);
            let _ = tx
                .send(AgentEvent::Error {
                    message: format!("{err:#}"),
                })
                .await;
        }
        let mut sessions = state.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(&session.id) {
            slot.session = session;
            slot.cancel = None;
        }
    });

    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((to_sse(&event), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[axum::debug_handler]
async fn cancel_turn_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.sessions.lock().await;
    let slot = sessions
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Sesión desconocida: {id}")))?;
    match &slot.cancel {
        Some(handle) => {
            handle.cancel();
            info!("Cancelación solicitada para la sesión {id}");
            Ok(StatusCode::ACCEPTED)
        }
        None => Err(api_error(StatusCode::CONFLICT, "La sesión no tiene ningún turno en curso.")),
    }
}

// --- Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(sender) = sender {
        if sender.send(()).is_err() {
            warn!("El servidor ya se estaba cerrando.");
        }
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::data_repo::DataRepo;
    use std::collections::HashMap;
    use tokio::sync::oneshot;
    use wiremock::MockServer;

    /// Sirve el router con un estado real cuyos servicios apuntan a `server`.
    async fn serve(server: &MockServer, data_dir: &std::path::Path, max_upload_mb: &str) -> (AppState, String) {
        let uri = server.uri();
        let openai_url = format!("{uri}/v1");
        let data_dir = data_dir.to_string_lossy().into_owned();
        let env = HashMap::from([
            ("ES_END_POINT", uri.as_str()),
            ("ES_API_KEY", "es-key"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", openai_url.as_str()),
            ("VIDEO_DB_API_KEY", "vdb-key"),
            ("VIDEO_DB_BASE_URL", uri.as_str()),
            ("ASSISTANT_ID", "asst_rag"),
            ("DATA_REPO_DIR", data_dir.as_str()),
            ("MAX_UPLOAD_MB", max_upload_mb),
        ]);
        let cfg = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).expect("config");
        let repo = DataRepo::new(&cfg.data_repo_dir);
        repo.setup().await.expect("repositorio");
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        let state = AppState::from_config(cfg, repo, shutdown_tx).expect("estado");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("puerto");
        let addr = listener.local_addr().expect("dirección");
        let app = create_router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (state, format!("http://{addr}"))
    }

    fn audio_form(size: usize) -> reqwest::multipart::Form {
        let part = reqwest::multipart::Part::bytes(vec![0u8; size]).file_name("meeting.mp3");
        reqwest::multipart::Form::new().text("kind", "audio").part("file", part)
    }

    #[tokio::test]
    async fn large_audio_upload_is_accepted() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (_state, base) = serve(&server, dir.path(), "16").await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/upload"))
            .multipart(audio_form(5 * 1024 * 1024))
            .send()
            .await
            .expect("petición");
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn upload_over_the_configured_cap_is_rejected() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, base) = serve(&server, dir.path(), "1").await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/upload"))
            .multipart(audio_form(2 * 1024 * 1024))
            .send()
            .await
            .expect("petición");
        assert!(resp.status().is_client_error(), "{}", resp.status());
        assert!(!state.status.snapshot().is_busy);
    }

    #[tokio::test]
    async fn idle_sessions_can_be_deleted() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, base) = serve(&server, dir.path(), "16").await;

        let idle = ChatSession::new("thread_idle".into());
        let busy = ChatSession::new("thread_busy".into());
        let (idle_id, busy_id) = (idle.id.clone(), busy.id.clone());
        {
            let mut sessions = state.sessions.lock().await;
            sessions.insert(idle_id.clone(), SessionSlot::new(idle));
            let mut slot = SessionSlot::new(busy);
            let (handle, _signal) = CancelSignal::pair();
            slot.cancel = Some(handle);
            sessions.insert(busy_id.clone(), slot);
        }

        let http = reqwest::Client::new();
        let delete = |id: &str| http.delete(format!("{base}/api/chat/sessions/{id}")).send();

        let resp = delete(&idle_id).await.expect("petición");
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        let resp = delete(&idle_id).await.expect("petición");
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let resp = delete(&busy_id).await.expect("petición");
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

        let sessions = state.sessions.lock().await;
        assert!(!sessions.contains_key(&idle_id));
        assert!(sessions.contains_key(&busy_id));
    }

    #[test]
    fn upload_requires_a_known_kind() {
        let files = vec![("a.png".to_string(), vec![1, 2])];
        let (status, body) = upload_items(Some("gif".into()), files.clone()).expect_err("debe fallar");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.0["error"].as_str().expect("error").contains("kind"));

        let (status, _) = upload_items(None, files).expect_err("debe fallar");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upload_builds_one_item_per_file() {
        let files = vec![
            ("uno.png".to_string(), vec![1]),
            ("dos.jpg".to_string(), vec![2]),
        ];
        let items = upload_items(Some("Images".into()), files).expect("lote");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.kind == DataType::Image));
        assert_eq!(items[1].name, "dos.jpg");
    }

    #[test]
    fn empty_upload_is_rejected() {
        let (status, _) = upload_items(Some("text".into()), vec![]).expect_err("debe fallar");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn agent_events_serialize_as_tagged_json() {
        let event = AgentEvent::Selection {
            keywords: vec!["budget".into()],
            domains: vec![],
        };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["event"], "selection");
        assert_eq!(value["keywords"][0], "budget");
        assert!(to_sse(&event).is_ok());
    }
}
