use std::collections::HashSet;
use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::clients::llm::{parse_string_array, LlmClient};
use crate::clients::pubmed::PubMed;
use crate::models::{OrchestratorState, Paper, Route};

pub const MAX_QUERY_VARIANTS: usize = 5;
pub const SEARCH_RETMAX: usize = 10;
pub const FETCH_BATCH_SIZE: usize = 3;
const MAX_CONTEXT_TITLES: usize = 10;

const SCOUT_SYSTEM_PROMPT: &str = "You are a biomedical literature search specialist. \
You turn research questions into effective PubMed search queries.";

/// Scout node: expands the query, searches PubMed, fetches abstracts.
/// Degrades to partial or empty results; never fails the request.
pub struct ScoutTask {
    llm: Arc<dyn LlmClient>,
    pubmed: Arc<dyn PubMed>,
}

impl ScoutTask {
    pub fn new(llm: Arc<dyn LlmClient>, pubmed: Arc<dyn PubMed>) -> Self {
        Self { llm, pubmed }
    }

    /// Expand the research query into 3-5 search variants. Falls back to the
    /// original query when nothing parseable comes back.
    async fn expand_query(&self, query: &str, context_titles: &[String]) -> Vec<String> {
        let titles_block = if context_titles.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nTitles already retrieved for this session (avoid duplicating their focus):\n{}",
                context_titles.join("\n")
            )
        };

        let prompt = format!(
            r#"Generate between 3 and 5 PubMed search query variants for this research question.

Guidelines:
- Quote multi-word medical terms for exact phrases
- Use OR between related terms to broaden results
- Use AND only to combine distinct concepts
- Cover both the primary condition and broader symptom/finding angles

Research question: {query}{titles_block}

Return only a JSON array of strings."#
        );

        let raw = match self.llm.complete(SCOUT_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "query expansion failed, falling back to original query");
                return vec![query.to_string()];
            }
        };

        let mut variants = parse_string_array(&raw);
        variants.truncate(MAX_QUERY_VARIANTS);

        if variants.is_empty() {
            warn!("no query variants parsed, falling back to original query");
            vec![query.to_string()]
        } else {
            variants
        }
    }

    /// Search every variant and merge identifiers in first-seen order.
    async fn search_all(&self, variants: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut pmids = Vec::new();

        for variant in variants {
            match self.pubmed.search(variant, SEARCH_RETMAX).await {
                Ok(ids) => {
                    for id in ids {
                        if seen.insert(id.clone()) {
                            pmids.push(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(query = %variant, error = %e, "search variant failed");
                }
            }
        }

        pmids
    }

    /// Fetch abstracts in small batches; a failed batch is dropped.
    async fn fetch_all(&self, pmids: &[String]) -> Vec<Paper> {
        let mut papers = Vec::new();

        for batch in pmids.chunks(FETCH_BATCH_SIZE) {
            match self.pubmed.fetch(batch).await {
                Ok(mut fetched) => papers.append(&mut fetched),
                Err(e) => {
                    warn!(batch_size = batch.len(), error = %e, "fetch batch failed");
                }
            }
        }

        papers
    }
}

#[async_trait]
impl Task for ScoutTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        // Route B searches in the context of the session's original question
        let (query, context_titles) = match (&state.route, &state.session_context) {
            (Some(Route::AugmentedContext), Some(session)) => (
                format!("{} {}", session.original_query, state.input_message),
                session
                    .retrieved_papers
                    .iter()
                    .take(MAX_CONTEXT_TITLES)
                    .map(|p| p.title.clone())
                    .collect::<Vec<_>>(),
            ),
            _ => (state.input_message.clone(), Vec::new()),
        };

        let variants = self.expand_query(&query, &context_titles).await;
        let pmids = self.search_all(&variants).await;
        let papers = self.fetch_all(&pmids).await;

        info!(
            iteration = state.iteration + 1,
            variants = variants.len(),
            identifiers = pmids.len(),
            papers = papers.len(),
            "scout completed"
        );

        state.expanded_queries = variants;
        state.papers = papers;
        state.iteration += 1;
        context.set("state", &state).await;

        Ok(TaskResult::new(None, NextAction::Continue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct ArrayLlm(String);

    #[async_trait]
    impl LlmClient for ArrayLlm {
        async fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    struct ScriptedPubMed {
        fail_search_for: Option<String>,
        fail_fetch_containing: Option<String>,
    }

    #[async_trait]
    impl PubMed for ScriptedPubMed {
        async fn search(&self, query: &str, _retmax: usize) -> anyhow::Result<Vec<String>> {
            if self.fail_search_for.as_deref() == Some(query) {
                return Err(anyhow!("search backend down"));
            }
            // Same hits for every variant, to exercise deduplication
            Ok(vec!["1".into(), "2".into(), "3".into(), "4".into()])
        }

        async fn fetch(&self, pmids: &[String]) -> anyhow::Result<Vec<Paper>> {
            if let Some(poison) = &self.fail_fetch_containing {
                if pmids.contains(poison) {
                    return Err(anyhow!("fetch backend down"));
                }
            }
            Ok(pmids
                .iter()
                .map(|pmid| Paper {
                    pmid: pmid.clone(),
                    title: format!("Paper {pmid}"),
                    abstract_text: "abstract".to_string(),
                    publication_year: Some(2023),
                    journal: None,
                })
                .collect())
        }
    }

    fn scout(llm_response: &str, pubmed: ScriptedPubMed) -> ScoutTask {
        ScoutTask::new(
            Arc::new(ArrayLlm(llm_response.to_string())),
            Arc::new(pubmed),
        )
    }

    #[tokio::test]
    async fn merges_and_dedupes_identifiers_across_variants() {
        let task = scout(
            r#"["\"type 2 diabetes\" AND treatment", "metformin OR insulin", "glycemic control"]"#,
            ScriptedPubMed {
                fail_search_for: None,
                fail_fetch_containing: None,
            },
        );

        let context = Context::new();
        context
            .set("state", OrchestratorState::new("q", "s", None))
            .await;
        task.run(context.clone()).await.unwrap();

        let state: OrchestratorState = context.get("state").await.unwrap();
        assert_eq!(state.expanded_queries.len(), 3);
        // 4 unique pmids despite 3 variants returning the same ids
        assert_eq!(state.papers.len(), 4);
        assert_eq!(state.iteration, 1);
    }

    #[tokio::test]
    async fn unparseable_expansion_falls_back_to_the_original_query() {
        let task = scout(
            "",
            ScriptedPubMed {
                fail_search_for: None,
                fail_fetch_containing: None,
            },
        );

        let context = Context::new();
        context
            .set("state", OrchestratorState::new("my question", "s", None))
            .await;
        task.run(context.clone()).await.unwrap();

        let state: OrchestratorState = context.get("state").await.unwrap();
        assert_eq!(state.expanded_queries, vec!["my question".to_string()]);
        assert!(!state.papers.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_batches_are_dropped_not_fatal() {
        // pmids [1,2,3,4] batch as [1,2,3] + [4]; poisoning "2" kills batch one
        let task = scout(
            r#"["only variant"]"#,
            ScriptedPubMed {
                fail_search_for: None,
                fail_fetch_containing: Some("2".to_string()),
            },
        );

        let context = Context::new();
        context
            .set("state", OrchestratorState::new("q", "s", None))
            .await;
        task.run(context.clone()).await.unwrap();

        let state: OrchestratorState = context.get("state").await.unwrap();
        assert_eq!(
            state.papers.iter().map(|p| p.pmid.clone()).collect::<Vec<_>>(),
            vec!["4".to_string()]
        );
    }
}
