//! Carga y gestión de configuración de la aplicación (servidor, asistente y store).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    /// Respuestas deterministas sin red, para demos y tests.
    Mock,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "mock" | "demo" => Ok(Self::Mock),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Memory,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de store no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub frontend_dir: String,
    pub open_browser: bool,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,

    pub store_backend: StoreBackend,
    pub store_path: PathBuf,

    /// Minutos sin actividad tras los que una sesión de edición se descarta.
    pub session_idle_minutes: i64,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una función de búsqueda arbitraria.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());
        let frontend_dir = lookup("FRONTEND_DIR").unwrap_or_else(|| "frontend".to_string());

        let open_browser = match lookup("OPEN_BROWSER") {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| anyhow!("OPEN_BROWSER debe ser true/false, no '{raw}'"))?,
            None => true,
        };

        let llm_provider_str = lookup("LLM_PROVIDER").unwrap_or_else(|| "mock".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;
        let llm_chat_model =
            lookup("LLM_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let store_backend_str = lookup("STORE_BACKEND").unwrap_or_else(|| "file".to_string());
        let store_backend = StoreBackend::from_str(&store_backend_str)?;
        let store_path = match lookup("STORE_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_store_path()?,
        };

        let session_idle_minutes = match lookup("SESSION_IDLE_MINUTES") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|m| (1..=MAX_SESSION_IDLE_MINUTES).contains(m))
                .ok_or_else(|| {
                    anyhow!("SESSION_IDLE_MINUTES debe estar entre 1 y {MAX_SESSION_IDLE_MINUTES}, no '{raw}'")
                })?,
            None => 30,
        };

        Ok(Self {
            server_addr,
            frontend_dir,
            open_browser,
            llm_provider,
            llm_chat_model,
            store_backend,
            store_path,
            session_idle_minutes,
        })
    }
}

const MAX_SESSION_IDLE_MINUTES: i64 = 24 * 60;

fn default_store_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow!("No se pudo determinar un directorio de datos; define STORE_PATH"))?;
    Ok(base.join("csi-dashboard").join("store.json"))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = AppConfig::from_lookup(lookup_from(&[("STORE_PATH", "/tmp/csi/store.json")])).unwrap();
        assert_eq!(cfg.server_addr, "127.0.0.1:3322");
        assert_eq!(cfg.frontend_dir, "frontend");
        assert!(cfg.open_browser);
        assert_eq!(cfg.llm_provider, LlmProvider::Mock);
        assert_eq!(cfg.llm_chat_model, "gpt-4o-mini");
        assert_eq!(cfg.store_backend, StoreBackend::File);
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/csi/store.json"));
        assert_eq!(cfg.session_idle_minutes, 30);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("SERVER_ADDR", "0.0.0.0:8080"),
            ("OPEN_BROWSER", "off"),
            ("LLM_PROVIDER", "OpenAI"),
            ("STORE_BACKEND", "memory"),
            ("STORE_PATH", "/tmp/x.json"),
            ("SESSION_IDLE_MINUTES", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.session_idle_minutes, 5);
        assert_eq!(cfg.server_addr, "0.0.0.0:8080");
        assert!(!cfg.open_browser);
        assert_eq!(cfg.llm_provider, LlmProvider::OpenAI);
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(AppConfig::from_lookup(lookup_from(&[("LLM_PROVIDER", "gemini"), ("STORE_PATH", "x")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("STORE_BACKEND", "s3"), ("STORE_PATH", "x")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("OPEN_BROWSER", "maybe"), ("STORE_PATH", "x")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("SESSION_IDLE_MINUTES", "0"), ("STORE_PATH", "x")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("SESSION_IDLE_MINUTES", "soon"), ("STORE_PATH", "x")])).is_err());
    }
}
