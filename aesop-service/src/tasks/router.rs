use std::collections::HashSet;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::models::{Intent, OrchestratorState, Route, RouterDecision, SessionContext};

/// At or above this title-token overlap a follow-up is answerable from cache.
pub const CONTEXT_OVERLAP: f64 = 0.35;
/// At or above this overlap (but below CONTEXT_OVERLAP) the topic is related
/// enough to augment the cache with a fresh search.
pub const AUGMENT_OVERLAP: f64 = 0.15;

static DEICTIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(these|those|this|that)\s+(studies|papers|results|articles|findings)\b")
        .expect("invalid deictic pattern")
});

static PRONOUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(them|it)\b").expect("invalid pronoun pattern"));

static REFERENCE_NOUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(studies|papers|results|articles|findings|study|paper)\b")
        .expect("invalid reference noun pattern")
});

static PMID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bpmid\s*[:#]?\s*\d+\b").expect("invalid pmid pattern"));

static ORDINAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(first|second|third|fourth|fifth)\s+(paper|study|article)\b")
        .expect("invalid ordinal pattern")
});

static NUMBERED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(paper|study)\s*#?\s*\d+\b").expect("invalid numbered pattern")
});

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "what", "are", "the", "for", "with", "and", "how", "does", "did", "can", "could",
        "would", "should", "these", "those", "this", "that", "about", "from", "been",
        "have", "has", "had", "there", "their", "they", "them", "its", "your", "you",
        "which", "when", "where", "why", "then", "but", "not", "yes", "all", "any",
        "some", "more", "most", "other", "into", "over", "such", "only", "same", "than",
        "very", "just", "also", "now", "here", "well", "way", "may", "use", "used",
        "using", "tell", "show", "find", "found", "was", "were", "will",
    ]
    .into_iter()
    .collect()
});

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z]+\b").expect("invalid word pattern"));

/// Deictic marker: a demonstrative + reference noun, or a bare pronoun close
/// to one.
pub fn has_deictic_reference(message: &str) -> bool {
    let lower = message.to_lowercase();
    if DEICTIC_RE.is_match(&lower) {
        return true;
    }
    pronoun_near_reference(&lower)
}

fn pronoun_near_reference(lower: &str) -> bool {
    let nouns: Vec<(usize, usize)> = REFERENCE_NOUN_RE
        .find_iter(lower)
        .map(|m| (m.start(), m.end()))
        .collect();
    if nouns.is_empty() {
        return false;
    }

    PRONOUN_RE.find_iter(lower).any(|p| {
        nouns.iter().any(|(start, end)| {
            // within 15 characters on either side of the pronoun
            p.start().saturating_sub(15) <= *end && *start <= p.end() + 15
        })
    })
}

/// Explicit reference: a PMID, or an ordinal/numbered paper mention.
pub fn has_explicit_reference(message: &str) -> bool {
    PMID_RE.is_match(message) || ORDINAL_RE.is_match(message) || NUMBERED_RE.is_match(message)
}

fn content_terms(text: &str) -> HashSet<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w.as_str()))
        .collect()
}

/// Jaccard similarity between message terms and the union of cached paper
/// title tokens, with stopwords removed.
pub fn keyword_overlap(message: &str, session: &SessionContext) -> f64 {
    let message_terms = content_terms(message);

    let mut title_terms: HashSet<String> = HashSet::new();
    for paper in &session.retrieved_papers {
        title_terms.extend(content_terms(&paper.title));
    }
    title_terms.extend(content_terms(&session.original_query));

    if message_terms.is_empty() || title_terms.is_empty() {
        return 0.0;
    }

    let intersection = message_terms.intersection(&title_terms).count() as f64;
    let union = message_terms.union(&title_terms).count() as f64;
    intersection / union
}

/// Route a research-intent message. Overlap bands are closed at the bottom:
/// J >= 0.35 answers from cache, J in [0.15, 0.35) augments it, below that a
/// full retrieval runs.
pub fn decide_route(
    intent: Intent,
    message: &str,
    session: Option<&SessionContext>,
) -> RouterDecision {
    let Some(session) = session else {
        return RouterDecision {
            route: Route::FullGraph,
            reasoning: "no session context, full retrieval".to_string(),
            keyword_overlap: 0.0,
        };
    };

    let deictic = has_deictic_reference(message);
    let explicit = has_explicit_reference(message);
    let overlap = keyword_overlap(message, session);

    if intent == Intent::FollowupResearch || deictic || explicit || overlap >= CONTEXT_OVERLAP {
        return RouterDecision {
            route: Route::ContextQa,
            reasoning: format!(
                "context reference (followup={}, deictic={deictic}, explicit={explicit}, overlap={overlap:.2})",
                intent == Intent::FollowupResearch
            ),
            keyword_overlap: overlap,
        };
    }

    if overlap >= AUGMENT_OVERLAP {
        return RouterDecision {
            route: Route::AugmentedContext,
            reasoning: format!("related topic, overlap={overlap:.2}"),
            keyword_overlap: overlap,
        };
    }

    RouterDecision {
        route: Route::FullGraph,
        reasoning: format!("new topic, overlap={overlap:.2}"),
        keyword_overlap: overlap,
    }
}

/// Router node for research intents.
pub struct RouterTask;

#[async_trait]
impl Task for RouterTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let intent = state.intent.unwrap_or(Intent::Research);
        let decision = decide_route(intent, &state.input_message, state.session_context.as_ref());

        info!(
            route = decision.route.as_str(),
            reasoning = decision.reasoning.as_str(),
            "router decision"
        );

        state.route = Some(decision.route);
        state.router_decision = Some(decision);
        context.set("state", &state).await;

        Ok(TaskResult::new(None, NextAction::Continue))
    }
}
