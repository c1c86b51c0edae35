use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::clients::llm::LlmClient;
use crate::models::{OrchestratorState, Route};

const CHAT_SYSTEM_PROMPT: &str = "You are AESOP, a biomedical literature review assistant. \
You are currently in conversation mode: respond briefly and warmly, and when relevant remind \
the user that you can search PubMed for medical research questions. Never give medical advice.";

const CHAT_FALLBACK: &str = "I ran into an issue processing that message. If you have a \
medical research question, ask away and I'll search the literature for you.";

/// Canned replies for trivial messages. Keeps the most common traffic off the
/// LLM entirely.
pub fn canned_response(message: &str) -> Option<&'static str> {
    let cleaned: String = message
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    match cleaned.trim() {
        "hi" | "hello" | "hey" | "yo" | "good morning" | "good evening" => Some(
            "Hello! I'm AESOP, a biomedical literature review assistant. \
             Ask me a medical research question and I'll search PubMed, grade the \
             evidence, and synthesize a structured review.",
        ),
        "thanks" | "thank you" | "thx" | "ty" => {
            Some("You're welcome! Let me know if you have another research question.")
        }
        "bye" | "goodbye" => Some("Goodbye! Come back any time you need the literature reviewed."),
        "ok" | "okay" | "got it" | "i see" | "understood" | "sure" | "yes" | "yeah" => {
            Some("Great — what would you like to look into next?")
        }
        "cool" | "nice" | "awesome" | "perfect" | "great" => {
            Some("Glad to hear it! Anything else you'd like me to dig into?")
        }
        _ => None,
    }
}

/// Chat node: canned replies first, LLM for nuanced conversation.
pub struct ChatTask {
    llm: Arc<dyn LlmClient>,
}

impl ChatTask {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn respond(&self, state: &OrchestratorState) -> String {
        if let Some(canned) = canned_response(&state.input_message) {
            info!("chat canned response");
            return canned.to_string();
        }

        let previous_topic = state
            .session_context
            .as_ref()
            .map(|s| s.original_query.chars().take(100).collect::<String>())
            .unwrap_or_default();

        let prompt = format!(
            "Previous research topic in this session: {}\n\nUser message: {}",
            if previous_topic.is_empty() {
                "None"
            } else {
                previous_topic.as_str()
            },
            state.input_message
        );

        match self.llm.complete(CHAT_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "chat LLM failed, using fallback");
                CHAT_FALLBACK.to_string()
            }
        }
    }
}

#[async_trait]
impl Task for ChatTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let response = self.respond(&state).await;

        state.route = Some(Route::Chat);
        state.chat_response = Some(response.clone());
        context.set("state", &state).await;

        Ok(TaskResult::new(Some(response), NextAction::Continue))
    }
}
