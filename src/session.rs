//! Máquina de estados de una sesión de edición de un ticket de diagnóstico.
//!
//! `Idle → Selecting → {FormEditing | VoiceEditing} → PreviewEditing →
//! Applied | Cancelled`. Cada sesión pertenece a un único editor y nunca se
//! persiste: cancelarla o cerrarla descarta todo su estado.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    extract::extract_keywords,
    payload::{self, DiagnosticForm, UNKNOWN},
    taxonomy::{self, SolutionSelection},
    validate::{validate_json_text, JsonTextError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Selecting,
    FormEditing,
    VoiceEditing,
    PreviewEditing,
    Applied,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Cancelled)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::FormEditing => "form_editing",
            Self::VoiceEditing => "voice_editing",
            Self::PreviewEditing => "preview_editing",
            Self::Applied => "applied",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    Form,
    Voice,
}

/// Eventos del reconocedor de voz, entregados en orden FIFO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Interim(String),
    Final(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("la sesión ya está cerrada ({0})")]
    Closed(SessionPhase),
    #[error("no se puede {action} en la fase {phase}")]
    InvalidTransition {
        phase: SessionPhase,
        action: &'static str,
    },
    #[error("categoría desconocida: {0}")]
    UnknownCategory(String),
    #[error("'{0}' es una hoja: se selecciona, no se expande")]
    LeafNotExpandable(String),
    #[error("'{0}' no es una hoja: sólo se puede expandir o contraer")]
    NotALeaf(String),
    #[error("la opción 'Other' necesita un texto")]
    EmptyOther,
    #[error("JSON inválido: {0}")]
    InvalidJson(#[from] JsonTextError),
    #[error("faltan campos obligatorios: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("no se pudo generar el payload: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct EditingSession {
    pub id: Uuid,
    pub phase: SessionPhase,
    pub mode: Option<EditMode>,
    /// Valor del campo anfitrión antes de abrir la sesión.
    pub prior_value: String,
    pub selection: Option<SolutionSelection>,
    /// Rutas expandidas, en forma de display ("A > B").
    pub expanded: BTreeSet<String>,
    pub form: DiagnosticForm,
    pub transcript: Vec<String>,
    pub interim: String,
    /// Texto JSON activo (el que se aplicaría).
    pub json_text: String,
    pub last_valid: String,
    pub error: Option<JsonTextError>,
    pub created_at: DateTime<Utc>,
}

impl EditingSession {
    pub fn new(prior_value: impl Into<String>) -> Self {
        let prior_value = prior_value.into();
        Self {
            id: Uuid::new_v4(),
            phase: SessionPhase::Idle,
            mode: None,
            last_valid: prior_value.clone(),
            json_text: prior_value.clone(),
            prior_value,
            selection: None,
            expanded: BTreeSet::new(),
            form: DiagnosticForm::default(),
            transcript: Vec::new(),
            interim: String::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    fn expect_phase(&self, allowed: &[SessionPhase], action: &'static str) -> Result<(), SessionError> {
        if self.phase.is_terminal() {
            return Err(SessionError::Closed(self.phase));
        }
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                phase: self.phase,
                action,
            })
        }
    }

    pub fn begin_selection(&mut self) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::Idle], "empezar la selección")?;
        self.phase = SessionPhase::Selecting;
        Ok(())
    }

    /// Expande o contrae un nodo intermedio. Devuelve si queda expandido.
    pub fn toggle<S: AsRef<str>>(&mut self, path: &[S]) -> Result<bool, SessionError> {
        self.expect_phase(&[SessionPhase::Selecting], "expandir categorías")?;
        let (labels, node) = taxonomy::solution_tree()
            .canonical_path(path)
            .ok_or_else(|| SessionError::UnknownCategory(taxonomy::display_path(path)))?;
        let key = taxonomy::display_path(&labels);
        if node.is_leaf() {
            return Err(SessionError::LeafNotExpandable(key));
        }

        if self.expanded.remove(&key) {
            Ok(false)
        } else {
            self.expanded.insert(key);
            Ok(true)
        }
    }

    /// Cierra la selección con una hoja y entra en modo formulario o voz.
    pub fn choose(&mut self, selection: SolutionSelection, mode: EditMode) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::Selecting], "elegir una solución")?;
        let selection = match selection {
            SolutionSelection::Path { path } => {
                let (labels, node) = taxonomy::solution_tree()
                    .canonical_path(&path)
                    .ok_or_else(|| SessionError::UnknownCategory(taxonomy::display_path(&path)))?;
                if !node.is_leaf() {
                    return Err(SessionError::NotALeaf(taxonomy::display_path(&labels)));
                }
                if node.free_text {
                    return Err(SessionError::EmptyOther);
                }
                SolutionSelection::Path { path: labels }
            }
            SolutionSelection::Other { text } if text.trim().is_empty() => {
                return Err(SessionError::EmptyOther);
            }
            SolutionSelection::Other { text } => SolutionSelection::Other {
                text: text.trim().to_string(),
            },
        };

        self.selection = Some(selection);
        self.mode = Some(mode);
        match mode {
            EditMode::Form => {
                self.phase = SessionPhase::FormEditing;
                self.regenerate_from_form()
            }
            EditMode::Voice => {
                self.phase = SessionPhase::VoiceEditing;
                self.regenerate_from_transcript()
            }
        }
    }

    pub fn update_form(&mut self, form: DiagnosticForm) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::FormEditing], "editar el formulario")?;
        self.form = form;
        self.regenerate_from_form()
    }

    pub fn push_transcript(&mut self, event: TranscriptEvent) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::VoiceEditing], "dictar")?;
        match event {
            TranscriptEvent::Interim(text) => {
                self.interim = text;
                Ok(())
            }
            TranscriptEvent::Final(text) => {
                self.interim.clear();
                let text = text.trim();
                if !text.is_empty() {
                    self.transcript.push(text.to_string());
                }
                self.regenerate_from_transcript()
            }
        }
    }

    /// Sustituye el texto activo por el editado a mano. Un JSON inválido no es
    /// un fallo de la operación: se registra el error y se conserva `last_valid`.
    pub fn edit_preview(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.expect_phase(
            &[
                SessionPhase::FormEditing,
                SessionPhase::VoiceEditing,
                SessionPhase::PreviewEditing,
            ],
            "editar la vista previa",
        )?;
        self.phase = SessionPhase::PreviewEditing;
        self.json_text = text.into();
        match validate_json_text(&self.json_text) {
            Ok(()) => {
                self.last_valid = self.json_text.clone();
                self.error = None;
            }
            Err(e) => self.error = Some(e),
        }
        Ok(())
    }

    pub fn missing_required(&self) -> Vec<&'static str> {
        match self.mode {
            Some(EditMode::Form) => self.form.missing_required(),
            _ => Vec::new(),
        }
    }

    pub fn can_apply(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::FormEditing | SessionPhase::VoiceEditing | SessionPhase::PreviewEditing
        ) && validate_json_text(&self.json_text).is_ok()
            && self.missing_required().is_empty()
    }

    /// Confirma el texto activo. Devuelve el valor que se escribe en el campo anfitrión.
    pub fn apply(&mut self) -> Result<String, SessionError> {
        self.expect_phase(
            &[
                SessionPhase::FormEditing,
                SessionPhase::VoiceEditing,
                SessionPhase::PreviewEditing,
            ],
            "aplicar",
        )?;
        validate_json_text(&self.json_text)?;
        let missing = self.missing_required();
        if !missing.is_empty() {
            return Err(SessionError::MissingFields(missing));
        }

        self.phase = SessionPhase::Applied;
        if self.json_text.trim().is_empty() {
            Ok(self.prior_value.clone())
        } else {
            Ok(self.json_text.clone())
        }
    }

    /// Descarta la sesión y devuelve el valor previo.
    pub fn cancel(&mut self) -> Result<String, SessionError> {
        if self.phase.is_terminal() {
            return Err(SessionError::Closed(self.phase));
        }
        self.phase = SessionPhase::Cancelled;
        Ok(self.prior_value.clone())
    }

    fn selection_action(&self) -> String {
        self.selection
            .as_ref()
            .map(SolutionSelection::action)
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn regenerate_from_form(&mut self) -> Result<(), SessionError> {
        let keywords = self.form.to_keywords(&self.selection_action());
        let text = payload::render(&payload::to_canonical_payload(&keywords))?;
        self.set_generated(text);
        Ok(())
    }

    fn regenerate_from_transcript(&mut self) -> Result<(), SessionError> {
        let mut keywords = extract_keywords(&self.transcript.join(" "));
        if keywords.action == UNKNOWN {
            keywords.action = self.selection_action();
        }
        let text = payload::render(&payload::to_canonical_payload(&keywords))?;
        self.set_generated(text);
        Ok(())
    }

    fn set_generated(&mut self, text: String) {
        self.last_valid = text.clone();
        self.json_text = text;
        self.error = None;
    }
}

/// Tope de sesiones abiertas; al superarlo se descarta la menos usada.
pub const MAX_OPEN_SESSIONS: usize = 256;

#[derive(Debug)]
struct RegistryEntry {
    session: EditingSession,
    last_touched: DateTime<Utc>,
}

/// Sesiones abiertas del servidor. Una sesión que nadie toca durante
/// `idle_ttl` se considera abandonada (modal cerrado, pestaña perdida).
#[derive(Debug)]
pub struct SessionRegistry {
    entries: HashMap<Uuid, RegistryEntry>,
    idle_ttl: Duration,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            idle_ttl,
            capacity,
        }
    }

    /// Descarta las sesiones inactivas. Devuelve cuántas se han eliminado.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.idle_ttl;
        self.entries.retain(|_, entry| now - entry.last_touched <= ttl);
        before - self.entries.len()
    }

    pub fn insert(&mut self, session: EditingSession, now: DateTime<Utc>) {
        self.evict_idle(now);
        while !self.entries.is_empty() && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_touched)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                self.entries.remove(&id);
            }
        }
        self.entries.insert(
            session.id,
            RegistryEntry {
                session,
                last_touched: now,
            },
        );
    }

    /// Sesión abierta con ese id; cada acceso renueva su plazo de inactividad.
    pub fn touch(&mut self, id: &Uuid, now: DateTime<Utc>) -> Option<&mut EditingSession> {
        self.evict_idle(now);
        let entry = self.entries.get_mut(id)?;
        entry.last_touched = now;
        Some(&mut entry.session)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<EditingSession> {
        self.entries.remove(id).map(|entry| entry.session)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::parse_payload;

    fn path(segments: &[&str]) -> SolutionSelection {
        SolutionSelection::Path {
            path: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn selecting() -> EditingSession {
        let mut session = EditingSession::new("previous ticket text");
        session.begin_selection().unwrap();
        session
    }

    #[test]
    fn toggle_expands_and_collapses_branches() {
        let mut session = selecting();
        assert!(session.toggle(&["Open GDCO"]).unwrap());
        assert!(session.toggle(&["Open GDCO", "Action"]).unwrap());
        assert!(!session.toggle(&["Open GDCO"]).unwrap());
        assert!(session.expanded.contains("Open GDCO > Action"));
        assert_eq!(session.phase, SessionPhase::Selecting);
    }

    #[test]
    fn client_casing_is_replaced_by_tree_labels() {
        let mut session = selecting();
        assert!(session.toggle(&["open gdco"]).unwrap());
        assert!(!session.toggle(&["Open GDCO"]).unwrap());
        assert!(session.expanded.is_empty());

        session
            .choose(path(&["open gdco", "ACTION", "reseat"]), EditMode::Voice)
            .unwrap();
        assert_eq!(session.selection, Some(path(&["Open GDCO", "Action", "Reseat"])));
        let payload = parse_payload(&session.json_text).unwrap();
        assert_eq!(payload.action, "Action - Reseat");
    }

    #[test]
    fn leaves_are_terminal() {
        let mut session = selecting();
        let err = session.toggle(&["Open GDCO", "Action", "Reseat"]).unwrap_err();
        assert!(matches!(err, SessionError::LeafNotExpandable(_)));

        let err = session.choose(path(&["Open GDCO", "Action"]), EditMode::Form).unwrap_err();
        assert!(matches!(err, SessionError::NotALeaf(_)));
        assert_eq!(session.phase, SessionPhase::Selecting);
    }

    #[test]
    fn unknown_categories_are_rejected() {
        let mut session = selecting();
        let err = session.choose(path(&["Open GDCO", "Teleport"]), EditMode::Voice).unwrap_err();
        assert!(matches!(err, SessionError::UnknownCategory(ref p) if p == "Open GDCO > Teleport"));
    }

    #[test]
    fn other_requires_text() {
        let mut session = selecting();
        assert!(matches!(
            session.choose(path(&["Other"]), EditMode::Form),
            Err(SessionError::EmptyOther)
        ));
        assert!(matches!(
            session.choose(SolutionSelection::Other { text: " ".into() }, EditMode::Form),
            Err(SessionError::EmptyOther)
        ));
        session
            .choose(SolutionSelection::Other { text: "Replace riser".into() }, EditMode::Form)
            .unwrap();
        let payload = parse_payload(&session.json_text).unwrap();
        assert_eq!(payload.action, "Replace riser");
    }

    #[test]
    fn form_mode_blocks_apply_until_required_fields_are_filled() {
        let mut session = selecting();
        session.choose(path(&["Open GDCO", "Action", "Replace"]), EditMode::Form).unwrap();
        assert!(!session.can_apply());
        assert!(matches!(session.apply(), Err(SessionError::MissingFields(ref m)) if m.len() == 2));
        assert_eq!(session.phase, SessionPhase::FormEditing);

        session
            .update_form(DiagnosticForm {
                fault_code: "35670".into(),
                location: "Slot 1".into(),
                component_type: "FPGA".into(),
                ..DiagnosticForm::default()
            })
            .unwrap();
        assert!(session.can_apply());

        let applied = session.apply().unwrap();
        let payload = parse_payload(&applied).unwrap();
        assert_eq!(payload.action, "Action - Replace");
        assert_eq!(payload.reason, "CSIDiag_35670");
        assert_eq!(payload.part_failures[0].location, "Slot 1");
        assert_eq!(session.phase, SessionPhase::Applied);
    }

    #[test]
    fn voice_mode_appends_final_segments_in_order() {
        let mut session = selecting();
        session.choose(path(&["Open GDCO", "Action", "Reseat"]), EditMode::Voice).unwrap();

        let payload = parse_payload(&session.json_text).unwrap();
        assert_eq!(payload.action, "Action - Reseat");

        session.push_transcript(TranscriptEvent::Interim("replace fp".into())).unwrap();
        assert_eq!(session.interim, "replace fp");
        assert!(session.transcript.is_empty());

        session.push_transcript(TranscriptEvent::Final("Replace FPGA".into())).unwrap();
        session.push_transcript(TranscriptEvent::Final("fault code 35670 at slot 1".into())).unwrap();
        assert!(session.interim.is_empty());
        assert_eq!(session.transcript, vec!["Replace FPGA", "fault code 35670 at slot 1"]);

        let payload = parse_payload(&session.json_text).unwrap();
        assert_eq!(payload.action, "Replace");
        assert_eq!(payload.component_type, "FPGA");
        assert_eq!(payload.fault_code, "35670");
        assert_eq!(payload.part_failures[0].location, "Slot 1");
        assert!(session.can_apply());
    }

    #[test]
    fn malformed_preview_keeps_last_valid_and_blocks_apply() {
        let mut session = selecting();
        session.choose(path(&["Keep on Probation"]), EditMode::Voice).unwrap();
        let generated = session.json_text.clone();

        session.edit_preview("{\n  \"Action\": \n}").unwrap();
        assert_eq!(session.phase, SessionPhase::PreviewEditing);
        let err = session.error.clone().unwrap();
        assert_eq!(err.line, 3);
        assert_eq!(session.last_valid, generated);
        assert!(!session.can_apply());
        assert!(matches!(session.apply(), Err(SessionError::InvalidJson(_))));

        session.edit_preview("{\"Action\": \"Hold\"}").unwrap();
        assert!(session.error.is_none());
        assert_eq!(session.last_valid, "{\"Action\": \"Hold\"}");
        assert_eq!(session.apply().unwrap(), "{\"Action\": \"Hold\"}");
    }

    #[test]
    fn blank_preview_applies_the_prior_value() {
        let mut session = selecting();
        session.choose(path(&["Return to Production"]), EditMode::Voice).unwrap();
        session.edit_preview("   ").unwrap();
        assert_eq!(session.apply().unwrap(), "previous ticket text");
    }

    #[test]
    fn cancel_reverts_and_closes() {
        let mut session = selecting();
        session.choose(path(&["Return to Production"]), EditMode::Form).unwrap();
        assert_eq!(session.cancel().unwrap(), "previous ticket text");
        assert_eq!(session.phase, SessionPhase::Cancelled);

        assert!(matches!(session.cancel(), Err(SessionError::Closed(SessionPhase::Cancelled))));
        assert!(matches!(
            session.edit_preview("{}"),
            Err(SessionError::Closed(SessionPhase::Cancelled))
        ));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut session = EditingSession::new("");
        assert!(matches!(
            session.toggle(&["Open GDCO"]),
            Err(SessionError::InvalidTransition { phase: SessionPhase::Idle, .. })
        ));
        assert!(matches!(
            session.apply(),
            Err(SessionError::InvalidTransition { .. })
        ));

        session.begin_selection().unwrap();
        assert!(session.begin_selection().is_err());
        assert!(session.push_transcript(TranscriptEvent::Final("x".into())).is_err());
    }

    #[test]
    fn form_updates_are_not_accepted_in_voice_mode() {
        let mut session = selecting();
        session.choose(path(&["Open GDCO", "Investigate", "Cable Check"]), EditMode::Voice).unwrap();
        assert!(matches!(
            session.update_form(DiagnosticForm::default()),
            Err(SessionError::InvalidTransition { phase: SessionPhase::VoiceEditing, .. })
        ));
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let start = Utc::now();
        let mut registry = SessionRegistry::new(Duration::minutes(30), MAX_OPEN_SESSIONS);
        let abandoned = EditingSession::new("");
        let active = EditingSession::new("");
        let (abandoned_id, active_id) = (abandoned.id, active.id);
        registry.insert(abandoned, start);
        registry.insert(active, start);

        assert!(registry.touch(&active_id, start + Duration::minutes(20)).is_some());
        assert_eq!(registry.evict_idle(start + Duration::minutes(31)), 1);
        assert!(registry.touch(&abandoned_id, start + Duration::minutes(31)).is_none());
        assert!(registry.touch(&active_id, start + Duration::minutes(45)).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&active_id).is_some());
        assert!(registry.remove(&active_id).is_none());
    }

    #[test]
    fn full_registry_drops_the_least_recently_used() {
        let start = Utc::now();
        let mut registry = SessionRegistry::new(Duration::minutes(30), 2);
        let sessions: Vec<EditingSession> = (0..3).map(|_| EditingSession::new("")).collect();
        let ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
        let mut sessions = sessions.into_iter();

        registry.insert(sessions.next().unwrap(), start);
        registry.insert(sessions.next().unwrap(), start + Duration::seconds(1));
        registry.touch(&ids[0], start + Duration::seconds(2));
        registry.insert(sessions.next().unwrap(), start + Duration::seconds(3));

        assert_eq!(registry.len(), 2);
        let now = start + Duration::seconds(4);
        assert!(registry.touch(&ids[0], now).is_some());
        assert!(registry.touch(&ids[1], now).is_none());
        assert!(registry.touch(&ids[2], now).is_some());
    }
}
