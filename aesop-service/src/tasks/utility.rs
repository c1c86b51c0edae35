use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::clients::llm::LlmClient;
use crate::models::{OrchestratorState, Route};

const UTILITY_SYSTEM_PROMPT: &str = "You reformat existing research summaries: shorten, \
convert to bullet points, simplify the language, extract the conclusion, or organize into \
a table — whatever the user asks. Preserve every factual claim and every PMID citation. \
Never add information that is not in the original. Output the reformatted content directly, \
without preamble.";

const NO_SUMMARY_TEXT: &str = "I don't have a previous research summary to reformat. \
Ask a research question first, then I can transform the results.";

const UTILITY_FALLBACK: &str = "I couldn't reformat the summary just now. \
Please try again, or phrase the transformation differently.";

/// Utility node: reformats the session's synthesis on request. Never invents
/// content — everything comes from the cached summary.
pub struct UtilityTask {
    llm: Arc<dyn LlmClient>,
}

impl UtilityTask {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Task for UtilityTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let summary = state
            .session_context
            .as_ref()
            .map(|s| s.synthesis_summary.clone())
            .unwrap_or_default();

        let response = if summary.is_empty() {
            // Intent validation should have rerouted this; answer gracefully anyway
            NO_SUMMARY_TEXT.to_string()
        } else {
            let prompt = format!(
                "## Original research summary\n{summary}\n\n## Request\n{}\n\nReformat the summary accordingly.",
                state.input_message
            );
            match self.llm.complete(UTILITY_SYSTEM_PROMPT, &prompt).await {
                Ok(text) => {
                    info!(
                        original_len = summary.len(),
                        result_len = text.len(),
                        "utility transform completed"
                    );
                    text.trim().to_string()
                }
                Err(e) => {
                    warn!(error = %e, "utility LLM failed, using fallback");
                    UTILITY_FALLBACK.to_string()
                }
            }
        };

        state.route = Some(Route::Utility);
        state.utility_response = Some(response.clone());
        context.set("state", &state).await;

        Ok(TaskResult::new(Some(response), NextAction::Continue))
    }
}
