use std::sync::Arc;

use agent_flow::{Context, Graph, GraphBuilder, GraphError, Task};
use tracing::info;

use crate::clients::embedding::EmbeddingClient;
use crate::clients::llm::LlmClient;
use crate::clients::pubmed::PubMed;
use crate::models::{
    CriticDecision, Intent, MAX_CRAG_ITERATIONS, OrchestratorState, Route,
};
use crate::stores::memory::AcceptanceMemory;
use crate::stores::session::SessionStore;
use crate::tasks::{
    ChatTask, ContextQaTask, CriticTask, IntentTask, MergeTask, RouterTask, SaveSessionTask,
    ScoutTask, SynthesizerTask, UtilityTask,
};

/// Everything the orchestrator graph needs to talk to the outside world.
pub struct EngineDeps {
    /// Model used for grading, synthesis and context Q&A
    pub llm: Arc<dyn LlmClient>,
    /// Cheaper model for intent, chat and utility traffic
    pub light_llm: Arc<dyn LlmClient>,
    pub pubmed: Arc<dyn PubMed>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub session_store: Arc<dyn SessionStore>,
    pub memory: Arc<dyn AcceptanceMemory>,
}

fn state_of(ctx: &Context) -> Option<OrchestratorState> {
    ctx.get_sync::<OrchestratorState>("state")
}

/// Build the orchestrator graph:
///
/// ```text
/// intent ─┬ chat ──────────────────────────┐
///         ├ utility ───────────────────────┤
///         └ router ─┬ (C) context_qa ──────┤
///                   └ (A/B) scout ─┬ (B) merge ── synthesizer ──┤
///                                  └ (A) critic ─┬ retrieve_more ∧ iter<3 → scout
///                                                └ synthesizer ─┤
///                                                   save_session ── END
/// ```
///
/// The CRAG iteration cap lives in the critic→scout edge condition, here in
/// the wiring rather than inside the Critic.
pub fn build_orchestrator_graph(deps: &EngineDeps) -> Graph {
    let intent_task: Arc<dyn Task> = Arc::new(IntentTask::new(deps.light_llm.clone()));
    let chat_task: Arc<dyn Task> = Arc::new(ChatTask::new(deps.light_llm.clone()));
    let utility_task: Arc<dyn Task> = Arc::new(UtilityTask::new(deps.light_llm.clone()));
    let router_task: Arc<dyn Task> = Arc::new(RouterTask);
    let scout_task: Arc<dyn Task> = Arc::new(ScoutTask::new(deps.llm.clone(), deps.pubmed.clone()));
    let critic_task: Arc<dyn Task> = Arc::new(CriticTask::new(
        deps.llm.clone(),
        deps.memory.clone(),
        deps.embedder.clone(),
    ));
    let merge_task: Arc<dyn Task> = Arc::new(MergeTask::new(deps.llm.clone()));
    let synthesizer_task: Arc<dyn Task> = Arc::new(SynthesizerTask::new(deps.llm.clone()));
    let context_qa_task: Arc<dyn Task> = Arc::new(ContextQaTask::new(deps.llm.clone()));
    let save_session_task: Arc<dyn Task> = Arc::new(SaveSessionTask::new(
        deps.session_store.clone(),
        deps.embedder.clone(),
    ));

    let intent_id = intent_task.id().to_string();
    let chat_id = chat_task.id().to_string();
    let utility_id = utility_task.id().to_string();
    let router_id = router_task.id().to_string();
    let scout_id = scout_task.id().to_string();
    let critic_id = critic_task.id().to_string();
    let merge_id = merge_task.id().to_string();
    let synthesizer_id = synthesizer_task.id().to_string();
    let context_qa_id = context_qa_task.id().to_string();
    let save_session_id = save_session_task.id().to_string();

    GraphBuilder::new("aesop_orchestrator")
        .add_task(intent_task)
        .add_task(chat_task)
        .add_task(utility_task)
        .add_task(router_task)
        .add_task(scout_task)
        .add_task(critic_task)
        .add_task(merge_task)
        .add_task(synthesizer_task)
        .add_task(context_qa_task)
        .add_task(save_session_task)
        // Intent fan-out
        .add_conditional_edge(&intent_id, &chat_id, |ctx| {
            matches!(state_of(ctx).and_then(|s| s.intent), Some(Intent::Chat))
        })
        .add_conditional_edge(&intent_id, &utility_id, |ctx| {
            matches!(state_of(ctx).and_then(|s| s.intent), Some(Intent::Utility))
        })
        .add_edge(&intent_id, &router_id)
        // Router fan-out
        .add_conditional_edge(&router_id, &context_qa_id, |ctx| {
            matches!(state_of(ctx).and_then(|s| s.route), Some(Route::ContextQa))
        })
        .add_edge(&router_id, &scout_id)
        // Route B peels off to the merge node; Route A goes to the critic
        .add_conditional_edge(&scout_id, &merge_id, |ctx| {
            matches!(
                state_of(ctx).and_then(|s| s.route),
                Some(Route::AugmentedContext)
            )
        })
        .add_edge(&scout_id, &critic_id)
        // CRAG loop, capped centrally
        .add_conditional_edge(&critic_id, &scout_id, |ctx| {
            state_of(ctx).is_some_and(|s| {
                s.critic_decision == Some(CriticDecision::RetrieveMore)
                    && s.iteration < MAX_CRAG_ITERATIONS
            })
        })
        .add_edge(&critic_id, &synthesizer_id)
        .add_edge(&merge_id, &synthesizer_id)
        // Terminal fan-in
        .add_edge(&synthesizer_id, &save_session_id)
        .add_edge(&chat_id, &save_session_id)
        .add_edge(&utility_id, &save_session_id)
        .add_edge(&context_qa_id, &save_session_id)
        .set_start_task(&intent_id)
        .build()
}

/// What one `/chat` request produced.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub response: String,
    pub session_id: String,
    pub route_taken: String,
    pub intent: Option<String>,
    pub intent_confidence: Option<f64>,
    pub papers_count: usize,
    pub critic_decision: Option<String>,
    pub avg_quality: Option<f64>,
}

/// Drive one message through the orchestrator graph.
pub async fn run_message(
    graph: &Graph,
    state: OrchestratorState,
) -> Result<ChatOutcome, GraphError> {
    let context = Context::new();
    context.set("state", &state).await;

    graph.execute(context.clone()).await?;

    let mut final_state: OrchestratorState = context
        .get("state")
        .await
        .ok_or_else(|| GraphError::ContextError("state lost during execution".to_string()))?;

    // Graceful degradation: when the loop cap cut off a retrieve_more verdict
    // the request still proceeds to synthesis, and is reported as sufficient
    // with the truthful avg_quality.
    if matches!(final_state.route, Some(Route::FullGraph))
        && final_state.critic_decision == Some(CriticDecision::RetrieveMore)
    {
        info!(
            iteration = final_state.iteration,
            "iteration cap reached, forcing sufficient"
        );
        final_state.critic_decision = Some(CriticDecision::Sufficient);
    }

    Ok(ChatOutcome {
        response: final_state.response(),
        session_id: final_state.session_id.clone(),
        route_taken: final_state
            .route
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| "chat".to_string()),
        intent: final_state.intent.map(|i| i.as_str().to_string()),
        intent_confidence: final_state.intent_confidence,
        papers_count: final_state.papers_count(),
        critic_decision: final_state.critic_decision.map(|d| d.as_str().to_string()),
        avg_quality: final_state.avg_quality,
    })
}
