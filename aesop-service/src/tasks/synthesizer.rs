use std::collections::HashSet;
use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::clients::llm::LlmClient;
use crate::models::{GradedPaper, OrchestratorState};

/// Quality split between the high- and lower-quality evidence sections.
pub const HIGH_QUALITY_CUTOFF: f64 = 0.7;

const SYNTHESIS_SYSTEM_PROMPT: &str = "You write structured biomedical evidence reviews \
from graded abstracts. Cite evidence by PMID. Describe the literature; never give medical \
advice.";

const NO_EVIDENCE_REVIEW: &str = "## Background\n\nNo evidence was found for this question.\n\n\
## Conclusion\n\nThe literature search did not return analyzable abstracts, so no \
evidence-based review can be produced. Consider rephrasing the question or broadening \
its scope.";

static PMID_CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bPMID[:\s#]*(\d+)\b").expect("invalid citation pattern"));

fn format_papers(papers: &[&GradedPaper]) -> String {
    if papers.is_empty() {
        return "(none)".to_string();
    }
    papers
        .iter()
        .map(|p| {
            format!(
                "PMID: {}\nQuality Score: {:.2}\nTitle: {}\nAbstract: {}",
                p.pmid, p.quality_score, p.title, p.abstract_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Remove `PMID n` citations that do not correspond to a retrieved paper.
/// Model output is not trusted to cite honestly.
pub fn sanitize_citations(text: &str, known_pmids: &HashSet<String>) -> String {
    PMID_CITATION_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            if known_pmids.contains(&caps[1]) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// Synthesizer node: turns the graded paper set into a structured review.
pub struct SynthesizerTask {
    llm: Arc<dyn LlmClient>,
}

impl SynthesizerTask {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn synthesize(&self, state: &OrchestratorState) -> String {
        if state.graded_papers.is_empty() {
            return NO_EVIDENCE_REVIEW.to_string();
        }

        let high: Vec<&GradedPaper> = state
            .graded_papers
            .iter()
            .filter(|p| p.quality_score >= HIGH_QUALITY_CUTOFF)
            .collect();
        let low: Vec<&GradedPaper> = state
            .graded_papers
            .iter()
            .filter(|p| p.quality_score < HIGH_QUALITY_CUTOFF)
            .collect();

        let prompt = format!(
            r#"Write a structured evidence review for this research question.

Research question: {query}

## High-quality papers (quality >= {cutoff})
{high_block}

## Lower-quality papers
{low_block}

Produce markdown with exactly these H2 sections, in order:
## Background
## High-Quality Evidence
## Lower-Quality Evidence
## Limitations
## Conclusion

Cite papers inline as "PMID <number>". Only cite the papers listed above."#,
            query = state.input_message,
            cutoff = HIGH_QUALITY_CUTOFF,
            high_block = format_papers(&high),
            low_block = format_papers(&low),
        );

        let raw = match self.llm.complete(SYNTHESIS_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "synthesis LLM failed, emitting minimal review");
                return format!(
                    "## Background\n\nA structured review could not be generated for this \
                     question.\n\n## Conclusion\n\n{} graded paper(s) met quality thresholds, \
                     but the synthesis step failed. Please retry.",
                    state.graded_papers.len()
                );
            }
        };

        let known: HashSet<String> = state
            .graded_papers
            .iter()
            .map(|p| p.pmid.clone())
            .collect();
        sanitize_citations(raw.trim(), &known)
    }
}

#[async_trait]
impl Task for SynthesizerTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let review = self.synthesize(&state).await;

        info!(
            papers = state.graded_papers.len(),
            chars = review.len(),
            "synthesis completed"
        );

        state.synthesis_output = Some(review.clone());
        context.set("state", &state).await;

        Ok(TaskResult::new(Some(review), NextAction::Continue))
    }
}
