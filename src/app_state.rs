use std::sync::{Arc, Mutex};

use chrono::Duration;
use tokio::sync::oneshot;

use crate::{
    assistant::AssistantManager,
    config::AppConfig,
    session::{SessionRegistry, MAX_OPEN_SESSIONS},
    store::KeyValueStore,
};

#[derive(Clone)]
pub struct AppState {
    pub assistant: AssistantManager,
    pub store: Arc<dyn KeyValueStore>,
    /// Sesiones de edición abiertas. Se descartan al aplicar, cancelar,
    /// cerrar el modal o quedar inactivas.
    pub sessions: Arc<Mutex<SessionRegistry>>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn KeyValueStore>,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            assistant: AssistantManager::from_config(config),
            store,
            sessions: Arc::new(Mutex::new(SessionRegistry::new(
                Duration::minutes(config.session_idle_minutes),
                MAX_OPEN_SESSIONS,
            ))),
            status: Arc::new(Mutex::new(Status {
                message: "Servidor listo.".to_string(),
                ..Status::default()
            })),
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub message: String,
    pub analyses_run: u64,
    pub queries_answered: u64,
}
