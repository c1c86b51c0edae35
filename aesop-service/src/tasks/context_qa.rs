use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::clients::llm::LlmClient;
use crate::models::{OrchestratorState, Route};

const CONTEXT_QA_SYSTEM_PROMPT: &str = "You answer follow-up questions about previously \
retrieved biomedical literature. Use ONLY the papers provided; cite them by PMID. If the \
papers do not contain the answer, say so plainly instead of speculating.";

const QA_FALLBACK: &str = "I couldn't answer that from the cached papers just now. \
Please try again, or ask a fresh research question.";

const MAX_QA_PAPERS: usize = 10;

/// Context Q&A node (Route C): answers from cached papers, no retrieval.
pub struct ContextQaTask {
    llm: Arc<dyn LlmClient>,
}

impl ContextQaTask {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Task for ContextQaTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let papers_block = state
            .session_context
            .as_ref()
            .map(|s| s.papers_context(MAX_QA_PAPERS))
            .unwrap_or_else(|| "No papers available from previous search.".to_string());

        let prompt = format!(
            "## Cached papers\n{papers_block}\n\n## Question\n{}",
            state.input_message
        );

        let response = match self.llm.complete(CONTEXT_QA_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => {
                info!("context QA answered from cache");
                text.trim().to_string()
            }
            Err(e) => {
                warn!(error = %e, "context QA LLM failed, using fallback");
                QA_FALLBACK.to_string()
            }
        };

        state.route = Some(Route::ContextQa);
        state.qa_response = Some(response.clone());
        context.set("state", &state).await;

        Ok(TaskResult::new(Some(response), NextAction::Continue))
    }
}
