//! Acción recomendada para un nodo en probation y el plan que se deriva de ella.

use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{
    extract::extract_keywords,
    payload::{self, DiagnosticPayload},
    session::{EditingSession, SessionError},
};

pub const DEFAULT_HOLD_REASON: &str = "Nodo en espera de validación antes de volver a producción.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum RecommendedAction {
    AutoSage,
    DriInput,
    Hold,
}

impl FromStr for RecommendedAction {
    type Err = anyhow::Error;

    /// Acepta las variantes que usa el frontend: "AutoSage", "auto_sage", "DRI Input"...
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "autosage" | "sage" => Ok(Self::AutoSage),
            "driinput" | "dri" => Ok(Self::DriInput),
            "hold" | "onhold" => Ok(Self::Hold),
            _ => Err(anyhow!("Acción recomendada no soportada: {s}")),
        }
    }
}

impl TryFrom<String> for RecommendedAction {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum ProbationPlan {
    /// El payload se genera directamente a partir de las notas del nodo.
    AutoGenerated {
        node_id: String,
        payload: DiagnosticPayload,
        json: String,
    },
    /// Un DRI tiene que componer el ticket en una sesión de edición.
    AwaitingDri {
        node_id: String,
        session: EditingSession,
    },
    OnHold { node_id: String, reason: String },
}

pub fn plan_for(
    node_id: &str,
    action: RecommendedAction,
    notes: &str,
) -> Result<ProbationPlan, SessionError> {
    let node_id = node_id.trim().to_string();
    match action {
        RecommendedAction::AutoSage => {
            let payload = payload::to_canonical_payload(&extract_keywords(notes));
            let json = payload::render(&payload)?;
            Ok(ProbationPlan::AutoGenerated {
                node_id,
                payload,
                json,
            })
        }
        RecommendedAction::DriInput => {
            let mut session = EditingSession::new(notes.trim());
            session.begin_selection()?;
            Ok(ProbationPlan::AwaitingDri { node_id, session })
        }
        RecommendedAction::Hold => {
            let reason = if notes.trim().is_empty() {
                DEFAULT_HOLD_REASON.to_string()
            } else {
                notes.trim().to_string()
            };
            Ok(ProbationPlan::OnHold { node_id, reason })
        }
    }
}
