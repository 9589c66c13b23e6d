//! Asistente de la consola de probation: proxy de consultas libres hacia un LLM
//! (vía Rig) o hacia un proveedor mock para el modo demo.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::{AppConfig, LlmProvider},
    extract::extract_keywords,
    payload::UNKNOWN,
    store::{load_json, update_json, KeyValueStore, CHAT_HISTORY_KEY},
};

pub const MAX_HISTORY_MESSAGES: usize = 50;
/// Mensajes previos que se envían como contexto al modelo.
const CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn now(role: ChatRole, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Gestor del asistente.
#[derive(Debug, Clone)]
pub struct AssistantManager {
    pub provider: LlmProvider,
    pub chat_model: String,
}

impl AssistantManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        }
    }

    /// Responde a una consulta libre usando el historial reciente como contexto.
    pub async fn answer(&self, question: &str, history: &[ChatMessage]) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            bail!("La consulta está vacía");
        }
        match self.provider {
            LlmProvider::OpenAI => self.answer_with_openai(question, history).await,
            LlmProvider::Mock => Ok(mock_answer(question)),
        }
    }

    async fn answer_with_openai(&self, question: &str, history: &[ChatMessage]) -> Result<String> {
        use rig::completion::Prompt;
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        const SYSTEM_PROMPT: &str = r#"
Eres el asistente de la consola de probation de nodos de hardware.
Respondes en el idioma del usuario, de forma clara y concisa.
Ayudas a decidir si un nodo vuelve a producción, sigue en espera o necesita un ticket GDCO,
y a identificar componente, código de fallo y ubicación cuando el usuario los mencione.
Si no tienes información suficiente, dilo explícitamente.
"#;

        let client = openai::Client::from_env();

        // Modelo de chat por defecto si no se ha configurado otro
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble(SYSTEM_PROMPT)
            .context(&history_context(history))
            .build();

        let answer = agent
            .prompt(question)
            .await
            .map_err(|e| anyhow!("Error del proveedor LLM: {e}"))?;
        Ok(answer)
    }
}

fn history_context(history: &[ChatMessage]) -> String {
    let start = history.len().saturating_sub(CONTEXT_MESSAGES);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|m| {
            let who = match m.role {
                ChatRole::User => "usuario",
                ChatRole::Assistant => "asistente",
            };
            format!("{who}: {}", m.content)
        })
        .collect();
    format!("Conversación previa:\n{}", lines.join("\n"))
}

/// Respuesta determinista del modo demo: resume lo que se reconoce en la consulta.
fn mock_answer(question: &str) -> String {
    let keywords = extract_keywords(question);
    let mut facts = Vec::new();
    if keywords.component_type != UNKNOWN {
        facts.push(format!("componente {}", keywords.component_type));
    }
    if keywords.fault_code != UNKNOWN {
        facts.push(format!("código de fallo {}", keywords.fault_code));
    }
    if keywords.location != UNKNOWN {
        facts.push(format!("ubicación {}", keywords.location));
    }

    if facts.is_empty() {
        "[demo] No he reconocido componente, código de fallo ni ubicación. \
         Indica el nodo y el síntoma para proponer un siguiente paso."
            .to_string()
    } else {
        format!(
            "[demo] He identificado: {}. Recomendación: abrir un ticket GDCO y mantener el nodo en probation hasta validar la reparación.",
            facts.join(", ")
        )
    }
}

pub fn load_history(store: &dyn KeyValueStore) -> Result<Vec<ChatMessage>> {
    Ok(load_json(store, CHAT_HISTORY_KEY)?.unwrap_or_default())
}

/// Añade pregunta y respuesta al historial persistido (recortado a los últimos mensajes).
pub fn append_exchange(store: &dyn KeyValueStore, question: &str, answer: &str) -> Result<Vec<ChatMessage>> {
    update_json(store, CHAT_HISTORY_KEY, |history: &mut Vec<ChatMessage>| {
        history.push(ChatMessage::now(ChatRole::User, question.trim()));
        history.push(ChatMessage::now(ChatRole::Assistant, answer));
        if history.len() > MAX_HISTORY_MESSAGES {
            let excess = history.len() - MAX_HISTORY_MESSAGES;
            history.drain(..excess);
        }
    })
}

pub fn clear_history(store: &dyn KeyValueStore) -> Result<()> {
    store.remove(CHAT_HISTORY_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn mock_manager() -> AssistantManager {
        AssistantManager {
            provider: LlmProvider::Mock,
            chat_model: String::new(),
        }
    }

    #[test]
    fn mock_answer_mentions_recognised_fields() {
        let answer = tokio_test::block_on(
            mock_manager().answer("node 12 has a FPGA fault code 35670 at slot 1", &[]),
        )
        .unwrap();
        assert!(answer.starts_with("[demo]"));
        assert!(answer.contains("componente FPGA"));
        assert!(answer.contains("código de fallo 35670"));
        assert!(answer.contains("ubicación Slot 1"));
    }

    #[test]
    fn mock_answer_without_keywords_asks_for_details() {
        let answer = tokio_test::block_on(mock_manager().answer("hello?", &[])).unwrap();
        assert!(answer.contains("No he reconocido"));
    }

    #[tokio::test]
    async fn blank_questions_are_rejected() {
        assert!(mock_manager().answer("   ", &[]).await.is_err());
    }

    #[test]
    fn history_is_appended_and_capped() {
        let store = MemoryStore::default();
        for i in 0..30 {
            append_exchange(&store, &format!("q{i}"), &format!("a{i}")).unwrap();
        }
        let history = load_history(&store).unwrap();
        assert_eq!(history.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(history.last().unwrap().content, "a29");
        assert_eq!(history.last().unwrap().role, ChatRole::Assistant);
        assert_eq!(history[0].content, "q5");

        clear_history(&store).unwrap();
        assert!(load_history(&store).unwrap().is_empty());
    }

    #[test]
    fn concurrent_exchanges_are_all_recorded() {
        let store = MemoryStore::default();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    append_exchange(store, &format!("q{i}"), &format!("a{i}")).unwrap();
                });
            }
        });
        let history = load_history(&store).unwrap();
        assert_eq!(history.len(), 16);
        for i in 0..8 {
            assert!(history.iter().any(|m| m.content == format!("q{i}")));
        }
    }

    #[test]
    fn context_keeps_only_recent_messages() {
        let history: Vec<ChatMessage> = (0..15)
            .map(|i| ChatMessage::now(ChatRole::User, &format!("m{i}")))
            .collect();
        let context = history_context(&history);
        assert!(!context.contains("usuario: m4\n"));
        assert!(context.contains("usuario: m5\n"));
        assert!(context.ends_with("usuario: m14"));
    }
}
