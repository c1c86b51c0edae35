use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::clients::embedding::EmbeddingClient;
use crate::models::{
    CachedPaper, MAX_CACHED_PAPERS, MAX_SUMMARY_CHARS, OrchestratorState, Recommendation, Route,
    SessionContext,
};
use crate::stores::session::SessionStore;

/// Terminal node: persist or refresh the session context.
///
/// Research routes write the full context (papers, synthesis, embedding) and
/// reset the TTL; chat, utility and context-QA only extend the TTL of an
/// existing session. Pure chat never creates one. Storage failures degrade the
/// request to stateless single-turn, never fail it.
pub struct SaveSessionTask {
    store: Arc<dyn SessionStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl SaveSessionTask {
    pub fn new(store: Arc<dyn SessionStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { store, embedder }
    }

    fn cache_papers(state: &OrchestratorState) -> Vec<CachedPaper> {
        // Route B already assembled the merged cache view
        if !state.merged_papers.is_empty() {
            let mut papers = state.merged_papers.clone();
            papers.truncate(MAX_CACHED_PAPERS);
            return papers;
        }

        let mut papers: Vec<CachedPaper> = state
            .papers
            .iter()
            .filter_map(|paper| {
                let grade = state.grades.iter().find(|g| g.pmid == paper.pmid)?;
                if grade.recommendation == Recommendation::Discard {
                    return None;
                }
                let mut cached = CachedPaper::from_paper(paper);
                cached.relevance_score = Some(grade.relevance_score);
                cached.methodology_score = Some(grade.methodology_score);
                cached.quality_score = Some(grade.quality_score());
                cached.recommendation = Some(
                    match grade.recommendation {
                        Recommendation::Keep => "keep",
                        Recommendation::NeedsMore => "needs_more",
                        Recommendation::Discard => "discard",
                    }
                    .to_string(),
                );
                Some(cached)
            })
            .collect();

        papers.sort_by(|a, b| {
            b.quality_score
                .unwrap_or(0.0)
                .total_cmp(&a.quality_score.unwrap_or(0.0))
        });
        papers.truncate(MAX_CACHED_PAPERS);
        papers
    }

    async fn write_full_context(&self, state: &OrchestratorState) {
        let query_embedding = match self.embedder.embed(&state.input_message).await {
            Ok(v) => v,
            Err(e) => {
                // An embeddingless session still serves Route C and utility turns
                warn!(error = %e, "session embedding failed, caching without one");
                state
                    .session_context
                    .as_ref()
                    .map(|s| s.query_embedding.clone())
                    .unwrap_or_default()
            }
        };

        let synthesis_summary: String = state
            .synthesis_output
            .clone()
            .unwrap_or_default()
            .chars()
            .take(MAX_SUMMARY_CHARS)
            .collect();

        let (turn_count, created_at) = match &state.session_context {
            Some(existing) => (existing.turn_count + 1, existing.created_at),
            None => (1, Utc::now()),
        };

        let context = SessionContext {
            session_id: state.session_id.clone(),
            original_query: state.input_message.clone(),
            query_embedding,
            retrieved_papers: Self::cache_papers(state),
            synthesis_summary,
            turn_count,
            created_at,
            updated_at: Utc::now(),
        };

        match self.store.put(&context).await {
            Ok(()) => info!(
                session_id = state.session_id.as_str(),
                papers = context.retrieved_papers.len(),
                turn = turn_count,
                "session context saved"
            ),
            Err(e) => warn!(
                session_id = state.session_id.as_str(),
                error = %e,
                "session save failed, continuing stateless"
            ),
        }
    }

    async fn extend_ttl(&self, state: &OrchestratorState) {
        // Only sessions that already exist get their TTL refreshed
        if state.session_context.is_none() {
            return;
        }
        match self.store.touch(&state.session_id).await {
            Ok(true) => debug!(session_id = state.session_id.as_str(), "session TTL extended"),
            Ok(false) => debug!(
                session_id = state.session_id.as_str(),
                "session already expired, not recreated"
            ),
            Err(e) => warn!(
                session_id = state.session_id.as_str(),
                error = %e,
                "session TTL extension failed"
            ),
        }
    }
}

#[async_trait]
impl Task for SaveSessionTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        match state.route {
            Some(Route::FullGraph) | Some(Route::AugmentedContext) => {
                self.write_full_context(&state).await
            }
            _ => self.extend_ttl(&state).await,
        }

        Ok(TaskResult::new(None, NextAction::End))
    }
}
