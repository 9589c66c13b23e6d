//! Modelo canónico del payload `CSIDiagnostic/1.1` y su construcción a partir
//! de una selección, de palabras clave extraídas o de un formulario manual.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{extract::ExtractedKeywords, taxonomy};

pub const PAYLOAD_TYPE: &str = "CSIDiagnostic/1.1";
pub const CSI_DIAG_VERSION: &str = "1.1.7.0";
/// Valor por defecto de todo campo que no se puede derivar de la entrada.
pub const UNKNOWN: &str = "Unknown";
pub const REASON_PREFIX: &str = "CSIDiag_";

/// Payload de diagnóstico tal y como lo consume el pipeline externo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct DiagnosticPayload {
    #[serde(rename = "$type")]
    pub payload_type: String,
    pub action: String,
    pub reason: String,
    pub component_type: String,
    pub fault_code: String,
    pub mnemonic: String,
    pub diagnostic_module: String,
    pub execution_id: String,
    #[serde(rename = "DERMarker")]
    pub der_marker: String,
    #[serde(rename = "CSIDiagVersion")]
    pub csi_diag_version: String,
    pub component_category: String,
    pub total_parts: u32,
    pub source_of_fault: String,
    pub part_failures: Vec<PartFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct PartFailure {
    pub manufacturer: String,
    pub serial_number: String,
    pub model_number: String,
    pub location: String,
    pub subclass1: String,
    pub subclass2: String,
    #[serde(rename = "Diagnostic_Summary")]
    pub diagnostic_summary: String,
    #[serde(rename = "DateandTimestamp")]
    pub date_and_timestamp: String,
    pub count: u32,
}

impl DiagnosticPayload {
    /// Respeta los valores fijos del formato: tipo, versión y una única pieza.
    pub fn is_canonical(&self) -> bool {
        self.payload_type == PAYLOAD_TYPE
            && self.csi_diag_version == CSI_DIAG_VERSION
            && self.total_parts == 1
            && self.part_failures.len() == 1
            && self.part_failures[0].count == 1
    }
}

/// Construye el payload a partir de una ruta del árbol de soluciones.
/// Nunca falla: lo que no aporta la ruta queda como "Unknown".
pub fn build_from_selection<S: AsRef<str>>(path: &[S]) -> DiagnosticPayload {
    let keywords = ExtractedKeywords {
        action: taxonomy::selection_action(&taxonomy::canonicalize(path)),
        ..ExtractedKeywords::default()
    };
    to_canonical_payload(&keywords)
}

/// Mapeo campo a campo. Cada llamada genera un `ExecutionId` nuevo.
pub fn to_canonical_payload(keywords: &ExtractedKeywords) -> DiagnosticPayload {
    let timestamp = if keywords.timestamp == UNKNOWN {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    } else {
        keywords.timestamp.clone()
    };

    DiagnosticPayload {
        payload_type: PAYLOAD_TYPE.to_string(),
        action: keywords.action.clone(),
        reason: format!("{REASON_PREFIX}{}", keywords.fault_code),
        component_type: keywords.component_type.clone(),
        fault_code: keywords.fault_code.clone(),
        mnemonic: keywords.mnemonic.clone(),
        diagnostic_module: keywords.diagnostic_module.clone(),
        execution_id: Uuid::new_v4().to_string(),
        der_marker: keywords.der_marker.clone(),
        csi_diag_version: CSI_DIAG_VERSION.to_string(),
        component_category: keywords.component_category.clone(),
        total_parts: 1,
        source_of_fault: keywords.source_of_fault.clone(),
        part_failures: vec![PartFailure {
            manufacturer: keywords.manufacturer.clone(),
            serial_number: keywords.serial_number.clone(),
            model_number: keywords.model_number.clone(),
            location: keywords.location.clone(),
            subclass1: keywords.subclass1.clone(),
            subclass2: keywords.subclass2.clone(),
            diagnostic_summary: keywords.summary.clone(),
            date_and_timestamp: timestamp,
            count: 1,
        }],
    }
}

/// JSON con indentación de 2 espacios; idempotente para payloads bien formados.
pub fn render(payload: &DiagnosticPayload) -> serde_json::Result<String> {
    serde_json::to_string_pretty(payload)
}

pub fn parse_payload(text: &str) -> serde_json::Result<DiagnosticPayload> {
    serde_json::from_str(text)
}

/// JSON Schema del payload para la validación en el frontend.
pub fn payload_schema() -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(schemars::schema_for!(DiagnosticPayload))
}

/// Campos del modo formulario. `FaultCode` y `Location` son obligatorios.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticForm {
    pub component_type: String,
    pub fault_code: String,
    pub location: String,
    pub serial_number: String,
    pub manufacturer: String,
    pub model_number: String,
    pub mnemonic: String,
    pub diagnostic_module: String,
    pub der_marker: String,
    pub component_category: String,
    pub source_of_fault: String,
    pub subclass1: String,
    pub subclass2: String,
    pub summary: String,
}

impl DiagnosticForm {
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.fault_code.trim().is_empty() {
            missing.push("FaultCode");
        }
        if self.location.trim().is_empty() {
            missing.push("Location");
        }
        missing
    }

    pub fn to_keywords(&self, action: &str) -> ExtractedKeywords {
        ExtractedKeywords {
            action: or_unknown(action),
            component_type: or_unknown(&self.component_type),
            fault_code: or_unknown(&self.fault_code),
            location: or_unknown(&self.location),
            serial_number: or_unknown(&self.serial_number),
            manufacturer: or_unknown(&self.manufacturer),
            model_number: or_unknown(&self.model_number),
            mnemonic: or_unknown(&self.mnemonic),
            diagnostic_module: or_unknown(&self.diagnostic_module),
            der_marker: or_unknown(&self.der_marker),
            component_category: or_unknown(&self.component_category),
            source_of_fault: or_unknown(&self.source_of_fault),
            subclass1: or_unknown(&self.subclass1),
            subclass2: or_unknown(&self.subclass2),
            timestamp: UNKNOWN.to_string(),
            summary: or_unknown(&self.summary),
        }
    }
}

fn or_unknown(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}
