use std::sync::MutexGuard;

use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::{AppState, Status},
    assistant::{self, ChatMessage},
    extract::{extract_keywords, ExtractedKeywords},
    payload::{self, DiagnosticForm, DiagnosticPayload},
    recommendation::{self, ProbationPlan, RecommendedAction},
    screening::{self, AnalysisResult, AnalysisSummary},
    session::{EditMode, EditingSession, SessionError, SessionRegistry, TranscriptEvent},
    store::{self, Theme},
    taxonomy::{self, SolutionSelection, SolutionTree},
    validate::{reformat_json_text, JsonTextError},
};

type ApiError = (StatusCode, Json<Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct SelectionPayload {
    path: Vec<String>,
}

#[derive(Serialize)]
pub struct SelectionResponse {
    display: String,
    payload: DiagnosticPayload,
    json: String,
}

#[derive(Deserialize)]
pub struct TranscriptPayload {
    transcript: String,
}

#[derive(Serialize)]
pub struct TranscriptResponse {
    keywords: ExtractedKeywords,
    payload: DiagnosticPayload,
    json: String,
}

#[derive(Deserialize)]
pub struct FormPayload {
    #[serde(default)]
    path: Vec<String>,
    #[serde(default)]
    form: DiagnosticForm,
}

#[derive(Serialize)]
pub struct FormResponse {
    missing: Vec<&'static str>,
    payload: DiagnosticPayload,
    json: String,
}

#[derive(Deserialize)]
pub struct TextPayload {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
pub struct ValidationResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonTextError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    formatted: Option<String>,
    /// El texto es además un payload `CSIDiagnostic` completo.
    canonical: bool,
}

#[derive(Deserialize)]
pub struct NewSessionPayload {
    #[serde(default)]
    prior_value: String,
}

#[derive(Deserialize)]
pub struct TogglePayload {
    path: Vec<String>,
}

#[derive(Deserialize)]
pub struct ChoosePayload {
    selection: SolutionSelection,
    mode: EditMode,
}

/// Sesión tal y como la ve el frontend: estado + si el botón "Apply" está activo.
#[derive(Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    session: EditingSession,
    can_apply: bool,
    missing: Vec<&'static str>,
}

impl From<&EditingSession> for SessionView {
    fn from(session: &EditingSession) -> Self {
        Self {
            can_apply: session.can_apply(),
            missing: session.missing_required(),
            session: session.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ToggleResponse {
    expanded: bool,
    session: SessionView,
}

#[derive(Serialize)]
pub struct ClosedSessionResponse {
    value: String,
    session: SessionView,
}

#[derive(Deserialize)]
pub struct ProbationPayload {
    node_id: String,
    recommended_action: RecommendedAction,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
pub struct AssistantQueryPayload {
    question: String,
}

#[derive(Serialize)]
pub struct AssistantQueryResponse {
    answer: String,
    history: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize)]
pub struct ThemePayload {
    theme: Theme,
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    status: Status,
    open_sessions: usize,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/solutions", get(solutions_handler))
        .route("/api/payload/schema", get(payload_schema_handler))
        .route("/api/payload/selection", post(payload_selection_handler))
        .route("/api/payload/transcript", post(payload_transcript_handler))
        .route("/api/payload/form", post(payload_form_handler))
        .route("/api/payload/validate", post(validate_handler))
        .route("/api/sessions", post(create_session_handler))
        .route(
            "/api/sessions/:id",
            get(get_session_handler).delete(discard_session_handler),
        )
        .route("/api/sessions/:id/begin", post(begin_selection_handler))
        .route("/api/sessions/:id/toggle", post(toggle_handler))
        .route("/api/sessions/:id/choose", post(choose_handler))
        .route("/api/sessions/:id/form", post(update_form_handler))
        .route("/api/sessions/:id/transcript", post(transcript_event_handler))
        .route("/api/sessions/:id/preview", post(preview_handler))
        .route("/api/sessions/:id/apply", post(apply_handler))
        .route("/api/sessions/:id/cancel", post(cancel_handler))
        .route("/api/probation/plan", post(probation_plan_handler))
        .route("/api/assistant/query", post(assistant_query_handler))
        .route(
            "/api/assistant/history",
            get(assistant_history_handler).delete(clear_assistant_history_handler),
        )
        .route(
            "/api/preferences/theme",
            get(get_theme_handler).put(put_theme_handler),
        )
        .route("/api/screening/analyze", post(screening_analyze_handler))
        .route("/api/screening/recent", get(screening_recent_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(screening::MAX_UPLOAD_BYTES + 64 * 1024))
        .with_state(app_state)
}

// --- Utilidades de error ---

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiError {
    error!("{context}: {e:#}");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{context}: {e:#}"),
    )
}

fn session_error(e: SessionError) -> ApiError {
    match &e {
        SessionError::InvalidJson(json_err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": e.to_string(),
                "line": json_err.line,
                "column": json_err.column,
            })),
        ),
        SessionError::MissingFields(missing) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string(), "missing": missing })),
        ),
        SessionError::Closed(_) | SessionError::InvalidTransition { .. } => {
            api_error(StatusCode::CONFLICT, &e)
        }
        SessionError::UnknownCategory(_)
        | SessionError::LeafNotExpandable(_)
        | SessionError::NotALeaf(_)
        | SessionError::EmptyOther => api_error(StatusCode::BAD_REQUEST, &e),
        SessionError::Render(_) => internal_error("Error generando el payload", &e),
    }
}

fn lock_sessions(state: &AppState) -> Result<MutexGuard<'_, SessionRegistry>, ApiError> {
    state
        .sessions
        .lock()
        .map_err(|_| internal_error("Registro de sesiones", "mutex envenenado"))
}

fn unknown_session(id: Uuid) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("Sesión desconocida: {id}"))
}

/// Ejecuta una transición sobre una sesión abierta y devuelve su nueva vista.
fn with_session<T>(
    state: &AppState,
    id: Uuid,
    transition: impl FnOnce(&mut EditingSession) -> Result<T, SessionError>,
) -> Result<(T, SessionView), ApiError> {
    let mut sessions = lock_sessions(state)?;
    let session = sessions.touch(&id, Utc::now()).ok_or_else(|| unknown_session(id))?;
    let out = transition(session).map_err(session_error)?;
    Ok((out, SessionView::from(&*session)))
}

/// Igual que `with_session`, pero la sesión se descarta si la transición tiene éxito.
fn close_session(
    state: &AppState,
    id: Uuid,
    transition: impl FnOnce(&mut EditingSession) -> Result<String, SessionError>,
) -> Result<Json<ClosedSessionResponse>, ApiError> {
    let mut sessions = lock_sessions(state)?;
    let session = sessions.touch(&id, Utc::now()).ok_or_else(|| unknown_session(id))?;
    let value = transition(session).map_err(session_error)?;
    let view = SessionView::from(&*session);
    sessions.remove(&id);
    info!("Sesión {id} cerrada en fase {}", view.session.phase);
    Ok(Json(ClosedSessionResponse {
        value,
        session: view,
    }))
}

// --- Handlers: árbol y payloads ---

#[axum::debug_handler]
async fn solutions_handler() -> Json<&'static SolutionTree> {
    Json(taxonomy::solution_tree())
}

#[axum::debug_handler]
async fn payload_schema_handler() -> Result<Json<Value>, ApiError> {
    payload::payload_schema()
        .map(Json)
        .map_err(|e| internal_error("Error generando el schema", e))
}

#[axum::debug_handler]
async fn payload_selection_handler(
    Json(request): Json<SelectionPayload>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let payload = payload::build_from_selection(&request.path);
    let json = payload::render(&payload).map_err(|e| internal_error("Error generando el payload", e))?;
    Ok(Json(SelectionResponse {
        display: taxonomy::display_path(&taxonomy::canonicalize(&request.path)),
        payload,
        json,
    }))
}

#[axum::debug_handler]
async fn payload_transcript_handler(
    Json(request): Json<TranscriptPayload>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let keywords = extract_keywords(&request.transcript);
    let payload = payload::to_canonical_payload(&keywords);
    let json = payload::render(&payload).map_err(|e| internal_error("Error generando el payload", e))?;
    Ok(Json(TranscriptResponse {
        keywords,
        payload,
        json,
    }))
}

#[axum::debug_handler]
async fn payload_form_handler(
    Json(request): Json<FormPayload>,
) -> Result<Json<FormResponse>, ApiError> {
    let action = taxonomy::selection_action(&taxonomy::canonicalize(&request.path));
    let payload = payload::to_canonical_payload(&request.form.to_keywords(&action));
    let json = payload::render(&payload).map_err(|e| internal_error("Error generando el payload", e))?;
    Ok(Json(FormResponse {
        missing: request.form.missing_required(),
        payload,
        json,
    }))
}

#[axum::debug_handler]
async fn validate_handler(Json(request): Json<TextPayload>) -> Json<ValidationResponse> {
    let response = match reformat_json_text(&request.text) {
        Ok(formatted) => ValidationResponse {
            valid: true,
            error: None,
            canonical: payload::parse_payload(&formatted).is_ok_and(|p| p.is_canonical()),
            formatted: Some(formatted),
        },
        Err(e) => ValidationResponse {
            valid: false,
            error: Some(e),
            formatted: None,
            canonical: false,
        },
    };
    Json(response)
}

// --- Handlers: sesiones de edición ---

#[axum::debug_handler]
async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<NewSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let session = EditingSession::new(request.prior_value);
    let view = SessionView::from(&session);
    lock_sessions(&state)?.insert(session, Utc::now());
    info!("Sesión de edición {} creada", view.session.id);
    Ok((StatusCode::CREATED, Json(view)))
}

#[axum::debug_handler]
async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let mut sessions = lock_sessions(&state)?;
    let session = sessions.touch(&id, Utc::now()).ok_or_else(|| unknown_session(id))?;
    Ok(Json(SessionView::from(&*session)))
}

/// El frontend cierra el modal sin aplicar ni cancelar: la sesión se descarta.
#[axum::debug_handler]
async fn discard_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    lock_sessions(&state)?
        .remove(&id)
        .ok_or_else(|| unknown_session(id))?;
    info!("Sesión {id} descartada");
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn begin_selection_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let ((), view) = with_session(&state, id, |s| s.begin_selection())?;
    Ok(Json(view))
}

#[axum::debug_handler]
async fn toggle_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TogglePayload>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let (expanded, session) = with_session(&state, id, |s| s.toggle(&request.path))?;
    Ok(Json(ToggleResponse { expanded, session }))
}

#[axum::debug_handler]
async fn choose_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ChoosePayload>,
) -> Result<Json<SessionView>, ApiError> {
    let chosen = request.selection.display();
    let ((), view) = with_session(&state, id, |s| s.choose(request.selection, request.mode))?;
    info!("Sesión {id}: elegido '{chosen}' en modo {:?}", request.mode);
    Ok(Json(view))
}

#[axum::debug_handler]
async fn update_form_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(form): Json<DiagnosticForm>,
) -> Result<Json<SessionView>, ApiError> {
    let ((), view) = with_session(&state, id, |s| s.update_form(form))?;
    Ok(Json(view))
}

#[axum::debug_handler]
async fn transcript_event_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(event): Json<TranscriptEvent>,
) -> Result<Json<SessionView>, ApiError> {
    let ((), view) = with_session(&state, id, |s| s.push_transcript(event))?;
    Ok(Json(view))
}

#[axum::debug_handler]
async fn preview_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TextPayload>,
) -> Result<Json<SessionView>, ApiError> {
    let ((), view) = with_session(&state, id, |s| s.edit_preview(request.text))?;
    Ok(Json(view))
}

#[axum::debug_handler]
async fn apply_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClosedSessionResponse>, ApiError> {
    close_session(&state, id, |s| s.apply())
}

#[axum::debug_handler]
async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClosedSessionResponse>, ApiError> {
    close_session(&state, id, |s| s.cancel())
}

// --- Handlers: consola de probation y asistente ---

#[axum::debug_handler]
async fn probation_plan_handler(
    State(state): State<AppState>,
    Json(request): Json<ProbationPayload>,
) -> Result<Json<ProbationPlan>, ApiError> {
    if request.node_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Falta el identificador del nodo."));
    }

    let plan = recommendation::plan_for(&request.node_id, request.recommended_action, &request.notes)
        .map_err(session_error)?;

    match &plan {
        ProbationPlan::AutoGenerated { node_id, .. } => {
            info!("Payload generado automáticamente para el nodo {node_id}");
        }
        ProbationPlan::AwaitingDri { node_id, session } => {
            lock_sessions(&state)?.insert(session.clone(), Utc::now());
            info!("Nodo {node_id} pendiente de DRI en la sesión {}", session.id);
        }
        ProbationPlan::OnHold { node_id, .. } => {
            info!("Nodo {node_id} se mantiene en espera");
        }
    }
    Ok(Json(plan))
}

#[axum::debug_handler]
async fn assistant_query_handler(
    State(state): State<AppState>,
    Json(request): Json<AssistantQueryPayload>,
) -> Result<Json<AssistantQueryResponse>, ApiError> {
    if request.question.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "La consulta está vacía."));
    }

    let history = assistant::load_history(state.store.as_ref())
        .map_err(|e| internal_error("Error leyendo el historial", e))?;

    let answer = state
        .assistant
        .answer(&request.question, &history)
        .await
        .map_err(|e| internal_error("Error al procesar la consulta", e))?;

    let history = assistant::append_exchange(state.store.as_ref(), &request.question, &answer)
        .map_err(|e| internal_error("Error guardando el historial", e))?;

    if let Ok(mut status) = state.status.lock() {
        status.queries_answered += 1;
    }
    Ok(Json(AssistantQueryResponse { answer, history }))
}

#[axum::debug_handler]
async fn assistant_history_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    assistant::load_history(state.store.as_ref())
        .map(Json)
        .map_err(|e| internal_error("Error leyendo el historial", e))
}

#[axum::debug_handler]
async fn clear_assistant_history_handler(
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    assistant::clear_history(state.store.as_ref())
        .map_err(|e| internal_error("Error borrando el historial", e))?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Handlers: preferencias ---

#[axum::debug_handler]
async fn get_theme_handler(State(state): State<AppState>) -> Result<Json<ThemePayload>, ApiError> {
    let theme = store::load_theme(state.store.as_ref())
        .map_err(|e| internal_error("Error leyendo el tema", e))?;
    Ok(Json(ThemePayload { theme }))
}

#[axum::debug_handler]
async fn put_theme_handler(
    State(state): State<AppState>,
    Json(request): Json<ThemePayload>,
) -> Result<Json<ThemePayload>, ApiError> {
    store::save_theme(state.store.as_ref(), request.theme)
        .map_err(|e| internal_error("Error guardando el tema", e))?;
    Ok(Json(request))
}

// --- Handlers: demo de cribado ---

#[axum::debug_handler]
async fn screening_analyze_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AnalysisResult>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Multipart inválido: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Error leyendo el fichero: {e}")))?;

        let result = screening::analyze_image(&filename, &bytes).map_err(|e| {
            warn!("Análisis rechazado para {filename}: {e}");
            api_error(StatusCode::BAD_REQUEST, e)
        })?;
        screening::record_analysis(state.store.as_ref(), &result)
            .map_err(|e| internal_error("Error guardando el análisis", e))?;

        if let Ok(mut status) = state.status.lock() {
            status.analyses_run += 1;
            status.message = format!("Último análisis: {filename}");
        }
        info!("Análisis demo de {filename}: riesgo {:?}", result.risk_level);
        return Ok(Json(result));
    }

    Err(api_error(
        StatusCode::BAD_REQUEST,
        "Falta el campo 'file' en el formulario.",
    ))
}

#[axum::debug_handler]
async fn screening_recent_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<AnalysisSummary>>, ApiError> {
    screening::recent_analyses(state.store.as_ref())
        .map(Json)
        .map_err(|e| internal_error("Error leyendo los análisis recientes", e))
}

// --- Estado y apagado ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let open_sessions = {
        let mut sessions = lock_sessions(&state)?;
        sessions.evict_idle(Utc::now());
        sessions.len()
    };
    let status = state
        .status
        .lock()
        .map_err(|_| internal_error("Estado del servidor", "mutex envenenado"))?
        .clone();
    Ok(Json(StatusResponse {
        status,
        open_sessions,
    }))
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Ok(mut sender) = state.shutdown_sender.lock() {
        if let Some(sender) = sender.take() {
            let _ = sender.send(());
        }
    }
    StatusCode::OK
}
