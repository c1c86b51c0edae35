use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dimension of query embeddings (pinned by the acceptance memory schema).
pub const EMBEDDING_DIM: usize = 1536;

/// Maximum papers kept in a session context or merged set.
pub const MAX_CACHED_PAPERS: usize = 15;

/// Synthesis summary is truncated to this many characters before caching.
pub const MAX_SUMMARY_CHARS: usize = 1500;

/// Hard cap on CRAG retrieval iterations per request.
pub const MAX_CRAG_ITERATIONS: u32 = 3;

/// Paper retrieved from PubMed. Immutable after fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub pmid: String,
    pub title: String,
    pub abstract_text: String,
    pub publication_year: Option<i32>,
    pub journal: Option<String>,
}

/// Critic verdict on a single paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    #[serde(alias = "KEEP", alias = "Keep")]
    Keep,
    #[serde(alias = "DISCARD", alias = "Discard")]
    Discard,
    #[serde(alias = "NEEDS_MORE", alias = "NeedsMore", alias = "needs more")]
    NeedsMore,
}

/// Structured evaluation of a single abstract, after score enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperGrade {
    /// Injected by the engine, never trusted from the LLM
    #[serde(default)]
    pub pmid: String,
    pub relevance_score: f64,
    pub methodology_score: f64,
    #[serde(default)]
    pub sample_size_adequate: bool,
    /// Normalized lowercase; empty when the reported design is unknown
    #[serde(default)]
    pub study_type: String,
    pub recommendation: Recommendation,
}

impl PaperGrade {
    /// Combined quality score, penalized when the sample size is inadequate.
    pub fn quality_score(&self) -> f64 {
        let base = (self.relevance_score + self.methodology_score) / 2.0;
        if self.sample_size_adequate {
            base
        } else {
            base * 0.7
        }
    }
}

/// Paper that survived grading, as handed to the synthesizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedPaper {
    pub pmid: String,
    pub title: String,
    pub abstract_text: String,
    pub quality_score: f64,
}

/// Paper cached inside a session context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPaper {
    pub pmid: String,
    pub title: String,
    pub abstract_text: String,
    pub publication_year: Option<i32>,
    pub journal: Option<String>,
    pub relevance_score: Option<f64>,
    pub methodology_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub recommendation: Option<String>,
}

impl CachedPaper {
    pub fn from_paper(paper: &Paper) -> Self {
        Self {
            pmid: paper.pmid.clone(),
            title: paper.title.clone(),
            abstract_text: paper.abstract_text.clone(),
            publication_year: paper.publication_year,
            journal: paper.journal.clone(),
            relevance_score: None,
            methodology_score: None,
            quality_score: None,
            recommendation: None,
        }
    }

    pub fn is_keep(&self) -> bool {
        self.recommendation.as_deref() == Some("keep")
    }
}

/// Cached context from previous turns in a session.
/// Stored under `aesop:session:{session_id}` with a sliding 60 minute TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub original_query: String,
    #[serde(default)]
    pub query_embedding: Vec<f32>,
    #[serde(default)]
    pub retrieved_papers: Vec<CachedPaper>,
    #[serde(default)]
    pub synthesis_summary: String,
    pub turn_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionContext {
    /// Format cached papers for LLM context injection, best first.
    pub fn papers_context(&self, max_papers: usize) -> String {
        if self.retrieved_papers.is_empty() {
            return "No papers available from previous search.".to_string();
        }

        let mut papers: Vec<&CachedPaper> = self.retrieved_papers.iter().collect();
        papers.sort_by(|a, b| {
            b.quality_score
                .unwrap_or(0.0)
                .total_cmp(&a.quality_score.unwrap_or(0.0))
        });

        papers
            .iter()
            .take(max_papers)
            .enumerate()
            .map(|(i, paper)| {
                let abstract_snippet: String = paper.abstract_text.chars().take(600).collect();
                format!(
                    "[Paper {}]\nPMID: {}\nTitle: {}\nQuality Score: {}\nAbstract: {}",
                    i + 1,
                    paper.pmid,
                    paper.title,
                    paper
                        .quality_score
                        .map(|q| format!("{q:.2}"))
                        .unwrap_or_else(|| "N/A".to_string()),
                    abstract_snippet,
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

/// One accepted-evidence row, appended to the durable acceptance memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceRecord {
    pub research_query: String,
    pub query_embedding: Vec<f32>,
    pub pmid: String,
    pub study_type: Option<String>,
    pub publication_year: Option<i32>,
    pub relevance_score: f64,
    pub methodology_score: f64,
    pub quality_score: f64,
    pub iteration: i32,
    pub accepted_at: DateTime<Utc>,
}

/// md5 of the lowercased, trimmed query — the exact-match key of the
/// acceptance memory (the Postgres schema derives the same value server-side).
pub fn query_hash(query: &str) -> String {
    format!("{:x}", md5::compute(query.trim().to_lowercase()))
}

/// Classified user intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Research,
    FollowupResearch,
    Chat,
    Utility,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Research => "research",
            Intent::FollowupResearch => "followup_research",
            Intent::Chat => "chat",
            Intent::Utility => "utility",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "research" => Some(Intent::Research),
            "followup_research" => Some(Intent::FollowupResearch),
            "chat" => Some(Intent::Chat),
            "utility" => Some(Intent::Utility),
            _ => None,
        }
    }
}

/// Execution route chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Route A: Scout → Critic (CRAG loop) → Synthesizer
    FullGraph,
    /// Route B: Scout → merge with cache → Synthesizer
    AugmentedContext,
    /// Route C: answer from cached papers, no retrieval
    ContextQa,
    Chat,
    Utility,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::FullGraph => "full_graph",
            Route::AugmentedContext => "augmented_context",
            Route::ContextQa => "context_qa",
            Route::Chat => "chat",
            Route::Utility => "utility",
        }
    }
}

/// Output of the router for research intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub route: Route,
    pub reasoning: String,
    pub keyword_overlap: f64,
}

/// Global CRAG verdict over one graded iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticDecision {
    Sufficient,
    RetrieveMore,
}

impl CriticDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriticDecision::Sufficient => "sufficient",
            CriticDecision::RetrieveMore => "retrieve_more",
        }
    }
}

/// Per-request orchestrator state, shared between graph tasks through the
/// flow context. Never outlives the request that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub input_message: String,
    pub session_id: String,

    pub intent: Option<Intent>,
    pub intent_confidence: Option<f64>,

    pub route: Option<Route>,
    pub router_decision: Option<RouterDecision>,
    pub session_context: Option<SessionContext>,

    // Scout output
    #[serde(default)]
    pub expanded_queries: Vec<String>,
    #[serde(default)]
    pub papers: Vec<Paper>,

    // Critic output
    #[serde(default)]
    pub grades: Vec<PaperGrade>,
    #[serde(default)]
    pub graded_papers: Vec<GradedPaper>,
    pub critic_decision: Option<CriticDecision>,
    pub avg_quality: Option<f64>,
    pub memory_boost: f64,

    // Route B merge output
    #[serde(default)]
    pub merged_papers: Vec<CachedPaper>,

    pub iteration: u32,

    pub chat_response: Option<String>,
    pub utility_response: Option<String>,
    pub qa_response: Option<String>,
    pub synthesis_output: Option<String>,
}

impl OrchestratorState {
    pub fn new(
        input_message: impl Into<String>,
        session_id: impl Into<String>,
        session_context: Option<SessionContext>,
    ) -> Self {
        Self {
            input_message: input_message.into(),
            session_id: session_id.into(),
            intent: None,
            intent_confidence: None,
            route: None,
            router_decision: None,
            session_context,
            expanded_queries: Vec::new(),
            papers: Vec::new(),
            grades: Vec::new(),
            graded_papers: Vec::new(),
            critic_decision: None,
            avg_quality: None,
            memory_boost: 0.0,
            merged_papers: Vec::new(),
            iteration: 0,
            chat_response: None,
            utility_response: None,
            qa_response: None,
            synthesis_output: None,
        }
    }

    /// The user-facing response for whichever route ran.
    pub fn response(&self) -> String {
        match self.route {
            Some(Route::Chat) => self.chat_response.clone().unwrap_or_default(),
            Some(Route::Utility) => self.utility_response.clone().unwrap_or_default(),
            Some(Route::ContextQa) => self.qa_response.clone().unwrap_or_default(),
            _ => self.synthesis_output.clone().unwrap_or_default(),
        }
    }

    /// Number of papers backing the response, per route.
    pub fn papers_count(&self) -> usize {
        match self.route {
            Some(Route::FullGraph) => self.graded_papers.len(),
            Some(Route::AugmentedContext) => self.merged_papers.len(),
            _ => self
                .session_context
                .as_ref()
                .map(|s| s.retrieved_papers.len())
                .unwrap_or(0),
        }
    }
}
