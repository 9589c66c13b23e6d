//! Demo educativa de "cribado" de radiografías.
//!
//! No hay ningún modelo: el análisis es una función mock que deriva datos de
//! demostración deterministas a partir de los bytes del fichero subido.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use mime_guess::mime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{load_json, update_json, KeyValueStore, RECENT_ANALYSES_KEY};

pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
pub const MAX_RECENT_ANALYSES: usize = 10;
pub const DISCLAIMER: &str =
    "Resultado de demostración con fines educativos. No constituye un diagnóstico médico.";

const REGIONS: &[&str] = &[
    "lóbulo superior derecho",
    "lóbulo medio derecho",
    "lóbulo inferior derecho",
    "lóbulo superior izquierdo",
    "lóbulo inferior izquierdo",
    "hilio",
    "mediastino",
];

const OBSERVATIONS: &[&str] = &[
    "opacidad nodular",
    "densidad focal",
    "patrón reticular",
    "sin hallazgos relevantes",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.33 {
            Self::Low
        } else if score < 0.66 {
            Self::Moderate
        } else {
            Self::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub region: String,
    pub observation: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub analyzed_at: DateTime<Utc>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub findings: Vec<Finding>,
    pub disclaimer: String,
    pub demo: bool,
}

/// Lo que se guarda en la lista de análisis recientes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub id: Uuid,
    pub filename: String,
    pub analyzed_at: DateTime<Utc>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
}

impl From<&AnalysisResult> for AnalysisSummary {
    fn from(result: &AnalysisResult) -> Self {
        Self {
            id: result.id,
            filename: result.filename.clone(),
            analyzed_at: result.analyzed_at,
            risk_score: result.risk_score,
            risk_level: result.risk_level,
        }
    }
}

/// Tipo MIME de la subida; sólo se aceptan imágenes y DICOM.
pub fn detect_mime(filename: &str) -> Result<String> {
    let is_dicom = filename.to_lowercase().ends_with(".dcm");
    if is_dicom {
        return Ok("application/dicom".to_string());
    }
    match mime_guess::from_path(filename).first() {
        Some(m) if m.type_() == mime::IMAGE => Ok(m.essence_str().to_string()),
        Some(m) => Err(anyhow!("Tipo de fichero no soportado: {m}")),
        None => Err(anyhow!("No se pudo determinar el tipo de '{filename}'")),
    }
}

pub fn analyze_image(filename: &str, bytes: &[u8]) -> Result<AnalysisResult> {
    if bytes.is_empty() {
        bail!("El fichero '{filename}' está vacío");
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        bail!("El fichero supera el máximo de {} MB", MAX_UPLOAD_BYTES / (1024 * 1024));
    }
    let mime_type = detect_mime(filename)?;

    let seed = fingerprint(bytes);
    let risk_score = round3((seed % 1000) as f64 / 1000.0);
    let findings_count = 1 + ((seed >> 10) % 3) as usize;
    let findings = (0..findings_count)
        .map(|i| {
            let bits = seed.rotate_right(13 * (i as u32 + 1));
            Finding {
                region: REGIONS[(bits % REGIONS.len() as u64) as usize].to_string(),
                observation: OBSERVATIONS[((bits >> 8) % OBSERVATIONS.len() as u64) as usize]
                    .to_string(),
                confidence: round3(0.5 + ((bits >> 16) % 50) as f64 / 100.0),
            }
        })
        .collect();

    Ok(AnalysisResult {
        id: Uuid::new_v4(),
        filename: filename.to_string(),
        mime_type,
        size_bytes: bytes.len() as u64,
        analyzed_at: Utc::now(),
        risk_score,
        risk_level: RiskLevel::from_score(risk_score),
        findings,
        disclaimer: DISCLAIMER.to_string(),
        demo: true,
    })
}

/// Inserta el resumen al principio de la lista y la recorta.
pub fn record_analysis(store: &dyn KeyValueStore, result: &AnalysisResult) -> Result<()> {
    update_json(store, RECENT_ANALYSES_KEY, |recent: &mut Vec<AnalysisSummary>| {
        recent.insert(0, AnalysisSummary::from(result));
        recent.truncate(MAX_RECENT_ANALYSES);
    })?;
    Ok(())
}

pub fn recent_analyses(store: &dyn KeyValueStore) -> Result<Vec<AnalysisSummary>> {
    Ok(load_json(store, RECENT_ANALYSES_KEY)?.unwrap_or_default())
}

// FNV-1a de 64 bits: basta para que la demo sea reproducible por fichero.
fn fingerprint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
