//! Validación del JSON editado a mano en la vista previa.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error de sintaxis con posición 1-based (línea y columna).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message} (línea {line}, columna {column})")]
pub struct JsonTextError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl From<serde_json::Error> for JsonTextError {
    fn from(e: serde_json::Error) -> Self {
        let line = e.line().max(1);
        // serde_json informa columna 0 cuando el error cae justo tras un salto de línea
        let column = e.column().max(1);
        let full = e.to_string();
        let suffix = format!(" at line {} column {}", e.line(), e.column());
        let message = full.strip_suffix(&suffix).unwrap_or(&full).to_string();
        Self {
            message,
            line,
            column,
        }
    }
}

/// Anidamiento máximo aceptado. El parser es recursivo: por encima de este
/// nivel el documento se rechaza antes de tocar la pila.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Texto vacío o en blanco se considera válido (payload vacío).
pub fn validate_json_text(text: &str) -> Result<(), JsonTextError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    parse_value(text)?;
    Ok(())
}

/// Valida y re-imprime con indentación de 2 espacios conservando el orden de claves.
pub fn reformat_json_text(text: &str) -> Result<String, JsonTextError> {
    if text.trim().is_empty() {
        return Ok(String::new());
    }
    let value = parse_value(text)?;
    serde_json::to_string_pretty(&value).map_err(JsonTextError::from)
}

fn parse_value(text: &str) -> Result<Value, JsonTextError> {
    check_depth(text)?;
    let mut deserializer = serde_json::Deserializer::from_str(text);
    // El límite de serde_json (128) lo sustituye `check_depth`
    deserializer.disable_recursion_limit();
    let value = Value::deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(value)
}

/// Recorre el texto contando corchetes y llaves fuera de cadenas.
fn check_depth(text: &str) -> Result<(), JsonTextError> {
    let (mut depth, mut line, mut column) = (0usize, 1usize, 0usize);
    let (mut in_string, mut escaped) = (false, false);
    for ch in text.chars() {
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }

        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(JsonTextError {
                        message: format!("anidamiento superior a {MAX_NESTING_DEPTH} niveles"),
                        line,
                        column,
                    });
                }
            }
            ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_is_valid() {
        assert!(validate_json_text("").is_ok());
        assert!(validate_json_text("  \n\t ").is_ok());
    }

    #[test]
    fn valid_documents_pass() {
        assert!(validate_json_text(r#"{"Action": "Replace", "TotalParts": 1}"#).is_ok());
        assert!(validate_json_text("[1, 2, 3]").is_ok());
        assert!(validate_json_text("\"plain string\"").is_ok());
    }

    #[test]
    fn reports_line_of_the_offending_character() {
        let text = "{\n  \"Action\": \"Replace\",\n  \"FaultCode\": tru,\n  \"Location\": \"Slot 1\"\n}";
        let err = validate_json_text(text).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.column >= 1);
        assert!(!err.message.contains("at line"));
    }

    #[test]
    fn reports_missing_value_on_the_closing_line() {
        let text = "{\n  \"a\": 1,\n  \"b\":\n}";
        let err = validate_json_text(text).unwrap_err();
        assert_eq!(err.line, 4);
        assert_eq!(err.column, 1);
    }

    #[test]
    fn trailing_comma_is_rejected_on_first_line() {
        let err = validate_json_text(r#"{"a": 1,}"#).unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("trailing comma"));
    }

    #[test]
    fn column_is_never_zero() {
        let err = validate_json_text("{\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);
    }

    #[test]
    fn reformat_preserves_key_order() {
        let formatted = reformat_json_text(r#"{"z": 1, "a": {"y": true, "b": null}}"#).unwrap();
        assert_eq!(
            formatted,
            "{\n  \"z\": 1,\n  \"a\": {\n    \"y\": true,\n    \"b\": null\n  }\n}"
        );
        assert_eq!(reformat_json_text(&formatted).unwrap(), formatted);
    }

    #[test]
    fn deeply_nested_documents_are_valid() {
        let depth = 200;
        let text = format!("{}{}", "[".repeat(depth), "]".repeat(depth));
        assert!(validate_json_text(&text).is_ok());

        let objects = format!("{}1{}", "{\"a\":".repeat(depth), "}".repeat(depth));
        assert!(reformat_json_text(&objects).is_ok());
    }

    #[test]
    fn nesting_past_the_limit_is_reported_with_position() {
        let depth = MAX_NESTING_DEPTH + 1;
        let text = format!("{}{}", "[".repeat(depth), "]".repeat(depth));
        let err = validate_json_text(&text).unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, depth);

        let at_limit = format!("{}{}", "[".repeat(MAX_NESTING_DEPTH), "]".repeat(MAX_NESTING_DEPTH));
        assert!(validate_json_text(&at_limit).is_ok());
    }

    #[test]
    fn brackets_inside_strings_do_not_count_as_nesting() {
        let text = format!("{{\"note\": \"{}\\\" ]\"}}", "[".repeat(MAX_NESTING_DEPTH * 2));
        assert!(validate_json_text(&text).is_ok());
    }

    #[test]
    fn reformat_surfaces_syntax_errors() {
        let err = reformat_json_text("{\"a\": }").unwrap_err();
        assert_eq!(err.line, 1);
    }
}
