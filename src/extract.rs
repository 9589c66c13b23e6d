//! Extracción heurística de palabras clave a partir de transcripciones de voz.
//!
//! Cada campo tiene su propio matcher; el primer match gana y los matchers no
//! interactúan entre sí. No es una gramática: un campo sin match queda como
//! "Unknown" y el resultado puede ser incompleto o impreciso.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::payload::UNKNOWN;

/// Resultado transitorio de aplicar todos los matchers a una transcripción.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedKeywords {
    pub component_type: String,
    pub action: String,
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
    pub timestamp: String,
    /// Transcripción completa recortada; no procede de ningún matcher.
    pub summary: String,
}

impl Default for ExtractedKeywords {
    fn default() -> Self {
        let unknown = || UNKNOWN.to_string();
        Self {
            component_type: unknown(),
            action: unknown(),
            fault_code: unknown(),
            location: unknown(),
            serial_number: unknown(),
            manufacturer: unknown(),
            model_number: unknown(),
            mnemonic: unknown(),
            diagnostic_module: unknown(),
            der_marker: unknown(),
            component_category: unknown(),
            source_of_fault: unknown(),
            subclass1: unknown(),
            subclass2: unknown(),
            timestamp: unknown(),
            summary: unknown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordField {
    ComponentType,
    Action,
    FaultCode,
    Location,
    SerialNumber,
    Manufacturer,
    ModelNumber,
    Mnemonic,
    DiagnosticModule,
    DerMarker,
    ComponentCategory,
    SourceOfFault,
    Subclass1,
    Subclass2,
    Timestamp,
}

impl ExtractedKeywords {
    fn slot(&mut self, field: KeywordField) -> &mut String {
        match field {
            KeywordField::ComponentType => &mut self.component_type,
            KeywordField::Action => &mut self.action,
            KeywordField::FaultCode => &mut self.fault_code,
            KeywordField::Location => &mut self.location,
            KeywordField::SerialNumber => &mut self.serial_number,
            KeywordField::Manufacturer => &mut self.manufacturer,
            KeywordField::ModelNumber => &mut self.model_number,
            KeywordField::Mnemonic => &mut self.mnemonic,
            KeywordField::DiagnosticModule => &mut self.diagnostic_module,
            KeywordField::DerMarker => &mut self.der_marker,
            KeywordField::ComponentCategory => &mut self.component_category,
            KeywordField::SourceOfFault => &mut self.source_of_fault,
            KeywordField::Subclass1 => &mut self.subclass1,
            KeywordField::Subclass2 => &mut self.subclass2,
            KeywordField::Timestamp => &mut self.timestamp,
        }
    }
}

const COMPONENT_TYPES: &[&str] = &[
    "FPGA", "CPU", "DIMM", "NIC", "SSD", "HDD", "NVMe", "PSU", "GPU", "BMC", "TPM",
    "Motherboard", "Backplane", "Riser", "Fan", "Cable",
];

const MANUFACTURERS: &[&str] = &[
    "Intel", "AMD", "NVIDIA", "Samsung", "Micron", "SK Hynix", "Hynix", "Seagate",
    "Western Digital", "Toshiba", "Mellanox", "Broadcom", "Xilinx", "Kingston",
];

// Separador entre la etiqueta y el valor: "serial: X", "serial # X", "serial is X".
const SEP: &str = r"\s*(?:[:#=]|\bis\b)?\s*";

struct Matcher {
    field: KeywordField,
    pattern: Regex,
    normalize: fn(&Captures) -> String,
}

fn matcher(field: KeywordField, pattern: &str, normalize: fn(&Captures) -> String) -> Option<Matcher> {
    match Regex::new(pattern) {
        Ok(pattern) => Some(Matcher {
            field,
            pattern,
            normalize,
        }),
        Err(e) => {
            error!("Patrón inválido para {:?}: {}", field, e);
            None
        }
    }
}

fn alternation(words: &[&str]) -> String {
    words
        .iter()
        .map(|w| regex::escape(w).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|")
}

// El orden importa sólo dentro de cada campo: el primer match gana.
static MATCHERS: Lazy<Vec<Matcher>> = Lazy::new(|| {
    use KeywordField::*;
    [
        matcher(
            ComponentType,
            &format!(r"(?i)\b({})\b", alternation(COMPONENT_TYPES)),
            |c| canonical(COMPONENT_TYPES, &c[1]),
        ),
        matcher(
            Action,
            r"(?i)\b(replac(?:e|es|ed|ing)|reseat(?:s|ed|ing)?|swap(?:s|ped|ping)?|reimag(?:e|es|ed|ing)|reboot(?:s|ed|ing)?|power(?:ed|ing)?[\s-]+cycl(?:e|es|ed|ing)|updat(?:e|es|ed|ing)|repair(?:s|ed|ing)?|inspect(?:s|ed|ing)?)\b",
            |c| action_base(&c[1]),
        ),
        matcher(
            FaultCode,
            r"(?i)\b(?:(?:fault|error)\s+)?code\s*[:#]?\s*(\d{3,6})\b",
            |c| c[1].to_string(),
        ),
        matcher(
            Location,
            r"(?i)\b(slot|bay|socket|port|rack|position)\s*[:#]?\s*([a-z]?\d+[a-z]?)\b",
            |c| format!("{} {}", title_case(&c[1]), c[2].to_uppercase()),
        ),
        matcher(
            SerialNumber,
            &format!(r"(?i)\b(?:serial(?:\s+number)?|s/n|sn){SEP}([a-z0-9][a-z0-9-]{{3,}})\b"),
            |c| c[1].to_uppercase(),
        ),
        matcher(
            Manufacturer,
            &format!(r"(?i)\b({})\b", alternation(MANUFACTURERS)),
            |c| canonical(MANUFACTURERS, &c[1]),
        ),
        matcher(
            ModelNumber,
            &format!(r"(?i)\b(?:model(?:\s+number)?|part\s+number|p/n){SEP}([a-z0-9][a-z0-9._-]{{2,}})\b"),
            |c| c[1].to_uppercase(),
        ),
        matcher(
            Mnemonic,
            &format!(r"(?i)\bmnemonic\b{SEP}([a-z0-9_]+)"),
            |c| c[1].to_string(),
        ),
        matcher(
            DiagnosticModule,
            &format!(r"(?i)(?:\bdiagnostic\s+module\b{SEP}|\bmodule\s*(?:[:=]|\bis\b)\s*)([a-z0-9_.-]+)"),
            |c| c[1].to_string(),
        ),
        matcher(
            DerMarker,
            &format!(r"(?i)\bDER\b(?:\s+marker)?{SEP}([a-z0-9_-]+)"),
            |c| c[1].to_string(),
        ),
        matcher(
            ComponentCategory,
            r"(?i)\b(memory|storage|network(?:ing)?|compute|power|cooling|accelerator)\b",
            |c| title_case(&c[1]),
        ),
        matcher(
            SourceOfFault,
            &format!(
                r"(?i)\b(?:caused\s+by|due\s+to|source(?:\s+of\s+fault)?){SEP}(?:(?:a|an|the)\s+)?(hardware|firmware|software|cabling|environment|operator)\b"
            ),
            |c| title_case(&c[1]),
        ),
        matcher(
            Subclass1,
            &format!(r"(?i)\bsub\s?class\s*(?:1|one){SEP}([a-z0-9_-]+)"),
            |c| c[1].to_string(),
        ),
        matcher(
            Subclass2,
            &format!(r"(?i)\bsub\s?class\s*(?:2|two){SEP}([a-z0-9_-]+)"),
            |c| c[1].to_string(),
        ),
        matcher(
            Timestamp,
            r"\b(\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2})?Z?)?)",
            |c| c[1].to_string(),
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Aplica los matchers a la transcripción. Nunca falla.
pub fn extract_keywords(transcript: &str) -> ExtractedKeywords {
    let mut keywords = ExtractedKeywords::default();
    let text = transcript.trim();
    if text.is_empty() {
        return keywords;
    }

    for m in MATCHERS.iter() {
        if let Some(caps) = m.pattern.captures(text) {
            *keywords.slot(m.field) = (m.normalize)(&caps);
        }
    }
    keywords.summary = text.to_string();
    keywords
}

fn canonical(table: &[&str], matched: &str) -> String {
    let matched = matched.split_whitespace().collect::<Vec<_>>().join(" ");
    table
        .iter()
        .find(|entry| entry.eq_ignore_ascii_case(&matched))
        .map(|entry| entry.to_string())
        .unwrap_or(matched)
}

/// Forma base del verbo reconocido ("swapped" → "Swap").
fn action_base(verb: &str) -> String {
    const BASES: &[(&str, &str)] = &[
        ("replac", "Replace"),
        ("reseat", "Reseat"),
        ("swap", "Swap"),
        ("reimag", "Reimage"),
        ("reboot", "Reboot"),
        ("power", "Power Cycle"),
        ("updat", "Update"),
        ("repair", "Repair"),
        ("inspect", "Inspect"),
    ];
    let verb = verb.to_lowercase();
    BASES
        .iter()
        .find(|(stem, _)| verb.starts_with(stem))
        .map(|(_, base)| base.to_string())
        .unwrap_or_else(|| title_case(&verb))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_matcher_compiles() {
        assert_eq!(MATCHERS.len(), 15);
    }

    #[test]
    fn extracts_the_basic_ticket_fields() {
        let keywords = extract_keywords("Replace FPGA fault code 35670 at slot 1");
        assert_eq!(keywords.action, "Replace");
        assert_eq!(keywords.component_type, "FPGA");
        assert_eq!(keywords.fault_code, "35670");
        assert_eq!(keywords.location, "Slot 1");
        assert_eq!(keywords.summary, "Replace FPGA fault code 35670 at slot 1");
    }

    #[test]
    fn missing_action_defaults_to_unknown() {
        let keywords = extract_keywords("The node keeps flapping after the last maintenance window");
        assert_eq!(keywords.action, UNKNOWN);
        assert_eq!(keywords.fault_code, UNKNOWN);
        assert_eq!(keywords.location, UNKNOWN);
    }

    #[test]
    fn empty_transcript_yields_defaults() {
        assert_eq!(extract_keywords("   "), ExtractedKeywords::default());
    }

    #[test]
    fn extracts_part_details() {
        let keywords = extract_keywords(
            "Samsung DIMM serial number s0k3ab12 model number M393A4K40DB3 in bay a3, \
             caused by a firmware issue",
        );
        assert_eq!(keywords.manufacturer, "Samsung");
        assert_eq!(keywords.component_type, "DIMM");
        assert_eq!(keywords.serial_number, "S0K3AB12");
        assert_eq!(keywords.model_number, "M393A4K40DB3");
        assert_eq!(keywords.location, "Bay A3");
        assert_eq!(keywords.source_of_fault, "Firmware");
    }

    #[test]
    fn multi_word_labels_are_canonicalised() {
        let keywords = extract_keywords("western   digital drive, power cycled the node");
        assert_eq!(keywords.manufacturer, "Western Digital");
        assert_eq!(keywords.action, "Power Cycle");
    }

    #[test]
    fn first_match_wins_per_field() {
        let keywords = extract_keywords("reseat the nic in slot 2 then replace the cable in slot 4");
        assert_eq!(keywords.action, "Reseat");
        assert_eq!(keywords.component_type, "NIC");
        assert_eq!(keywords.location, "Slot 2");
    }

    #[test]
    fn labelled_identifiers() {
        let keywords = extract_keywords(
            "mnemonic: FPGA_LINK_DOWN diagnostic module is FpgaHealth.v2 DER marker DER-1182 \
             subclass 1 Link subclass two Training 2024-05-03T10:15:00Z",
        );
        assert_eq!(keywords.mnemonic, "FPGA_LINK_DOWN");
        assert_eq!(keywords.diagnostic_module, "FpgaHealth.v2");
        assert_eq!(keywords.der_marker, "DER-1182");
        assert_eq!(keywords.subclass1, "Link");
        assert_eq!(keywords.subclass2, "Training");
        assert_eq!(keywords.timestamp, "2024-05-03T10:15:00Z");
    }

    #[test]
    fn inflected_actions_map_to_their_base_verb() {
        let cases = [
            ("Replacing FPGA fault code 35670 at slot 1", "Replace"),
            ("replaced the PSU", "Replace"),
            ("Swapped the NIC in slot 2", "Swap"),
            ("swapping DIMMs", "Swap"),
            ("Updating firmware on slot 3", "Update"),
            ("updated the BMC", "Update"),
            ("reimaging the node", "Reimage"),
            ("reseated the riser", "Reseat"),
            ("rebooting now", "Reboot"),
            ("inspected the cable", "Inspect"),
            ("repairs pending", "Repair"),
            ("power-cycling the chassis", "Power Cycle"),
        ];
        for (text, expected) in cases {
            assert_eq!(extract_keywords(text).action, expected, "{text}");
        }
    }

    #[test]
    fn lookalike_words_are_not_actions() {
        assert_eq!(extract_keywords("the replacement part arrived").action, UNKNOWN);
        assert_eq!(extract_keywords("swapfile usage is high").action, UNKNOWN);
    }

    #[test]
    fn bare_module_mentions_are_not_module_names() {
        assert_eq!(extract_keywords("the module failed after reboot").diagnostic_module, UNKNOWN);
        assert_eq!(extract_keywords("module: NicProbe").diagnostic_module, "NicProbe");
        assert_eq!(extract_keywords("diagnostic module MemTest86").diagnostic_module, "MemTest86");
    }

    #[test]
    fn category_is_independent_of_component() {
        let keywords = extract_keywords("memory errors on the CPU");
        assert_eq!(keywords.component_category, "Memory");
        assert_eq!(keywords.component_type, "CPU");
    }
}
