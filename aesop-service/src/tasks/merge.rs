use std::collections::HashSet;
use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use tracing::info;

use crate::clients::llm::LlmClient;
use crate::models::{
    CachedPaper, GradedPaper, MAX_CACHED_PAPERS, OrchestratorState, Recommendation,
};
use crate::tasks::critic::Grader;

/// Route B merge node: union cached KEEP papers with the fresh scout batch,
/// grade only the papers the cache has not already accepted, and rebuild the
/// graded list for synthesis. On pmid collisions the new grade wins.
pub struct MergeTask {
    grader: Grader,
}

impl MergeTask {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            grader: Grader::new(llm),
        }
    }
}

#[async_trait]
impl Task for MergeTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let cached_keeps: Vec<CachedPaper> = state
            .session_context
            .as_ref()
            .map(|s| {
                s.retrieved_papers
                    .iter()
                    .filter(|p| p.is_keep())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let kept_pmids: HashSet<String> = cached_keeps.iter().map(|p| p.pmid.clone()).collect();

        // Only papers the cache has not already accepted get graded
        let new_papers: Vec<_> = state
            .papers
            .iter()
            .filter(|p| !kept_pmids.contains(&p.pmid))
            .cloned()
            .collect();

        let grades = self
            .grader
            .grade_papers(&state.input_message, &new_papers)
            .await;

        let mut merged: Vec<CachedPaper> = cached_keeps;
        let mut graded: Vec<GradedPaper> = merged
            .iter()
            .map(|p| GradedPaper {
                pmid: p.pmid.clone(),
                title: p.title.clone(),
                abstract_text: p.abstract_text.clone(),
                quality_score: p.quality_score.unwrap_or(0.5),
            })
            .collect();

        for (paper, grade) in new_papers.iter().zip(grades.iter()) {
            if grade.recommendation == Recommendation::Discard {
                continue;
            }
            let quality = grade.quality_score();
            graded.push(GradedPaper {
                pmid: paper.pmid.clone(),
                title: paper.title.clone(),
                abstract_text: paper.abstract_text.clone(),
                quality_score: quality,
            });

            let mut cached = CachedPaper::from_paper(paper);
            cached.relevance_score = Some(grade.relevance_score);
            cached.methodology_score = Some(grade.methodology_score);
            cached.quality_score = Some(quality);
            cached.recommendation = Some(
                match grade.recommendation {
                    Recommendation::Keep => "keep",
                    Recommendation::NeedsMore => "needs_more",
                    Recommendation::Discard => "discard",
                }
                .to_string(),
            );
            merged.push(cached);
        }

        merged.sort_by(|a, b| {
            b.quality_score
                .unwrap_or(0.0)
                .total_cmp(&a.quality_score.unwrap_or(0.0))
        });
        merged.truncate(MAX_CACHED_PAPERS);

        graded.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
        graded.truncate(MAX_CACHED_PAPERS);

        info!(
            cached = kept_pmids.len(),
            new = new_papers.len(),
            merged = merged.len(),
            "merge completed"
        );

        state.grades = grades;
        state.merged_papers = merged;
        state.graded_papers = graded;
        context.set("state", &state).await;

        Ok(TaskResult::new(None, NextAction::Continue))
    }
}
