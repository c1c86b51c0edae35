use std::sync::Arc;

use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clients::llm::{extract_json_object, LlmClient};
use crate::models::{Intent, OrchestratorState, SessionContext};

// Stage 1: trivial messages that never need an LLM round-trip.
static TRIVIAL_CHAT: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^hi+$",
        r"^hello+$",
        r"^hey+$",
        r"^yo$",
        r"^thanks?(\s+you)?$",
        r"^thank\s+you$",
        r"^thx$",
        r"^ty$",
        r"^bye$",
        r"^goodbye$",
        r"^ok(ay)?$",
        r"^yes$",
        r"^no$",
        r"^yeah$",
        r"^nope$",
        r"^sure$",
        r"^cool$",
        r"^great$",
        r"^nice$",
        r"^awesome$",
        r"^perfect$",
        r"^got\s*it$",
        r"^i\s+see$",
        r"^understood$",
        r"^good\s+morning$",
        r"^good\s+evening$",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid trivial-chat pattern"))
    .collect()
});

// Stage 2 keyword sets. The four sets are disjoint by construction.
pub const MEDICAL_KEYWORDS: &[&str] = &[
    // conditions
    "diabetes", "cancer", "tumor", "asthma", "alzheimer", "parkinson", "arthritis",
    "hypertension", "stroke", "heart disease", "covid", "influenza", "pneumonia",
    "hepatitis", "hiv", "depression", "anxiety", "schizophrenia", "bipolar", "adhd",
    "autism", "epilepsy", "migraine", "obesity", "anemia", "leukemia", "lymphoma",
    "melanoma", "thrombosis", "embolism",
    // treatments and drugs
    "treatment", "therapy", "medication", "drug", "medicine", "vaccine", "antibiotic",
    "chemotherapy", "radiation", "surgery", "transplant", "metformin", "insulin",
    "ibuprofen", "aspirin", "statin", "steroid", "antidepressant", "opioid",
    // clinical terms
    "symptom", "diagnosis", "prognosis", "etiology", "pathology", "clinical",
    "patient", "disease", "disorder", "syndrome", "chronic", "acute", "benign",
    "malignant", "remission", "dosage", "side effect", "adverse effect",
    // research terms
    "study", "trial", "randomized", "placebo", "efficacy", "mortality", "morbidity",
    "incidence", "prevalence", "meta-analysis", "systematic review", "pubmed",
    // anatomy
    "blood", "liver", "kidney", "lung", "brain", "heart", "bone", "muscle", "nerve",
    "artery", "immune", "hormone",
];

pub const SYSTEM_KEYWORDS: &[&str] = &[
    "who are you",
    "what are you",
    "your name",
    "about yourself",
    "what can you do",
    "how do you work",
    "how does this work",
    "are you a bot",
    "are you ai",
    "are you human",
    "can i chat",
    "can we talk",
    "is this free",
    "do you remember",
    "your purpose",
    "what is aesop",
    "what is this",
];

pub const FOLLOWUP_KEYWORDS: &[&str] = &[
    "these studies",
    "those studies",
    "the studies",
    "these papers",
    "those papers",
    "the papers",
    "these results",
    "those results",
    "the findings",
    "these findings",
    "first paper",
    "second paper",
    "first study",
    "second study",
    "compare them",
    "compare these",
    "which one",
    "which study",
    "tell me more",
    "more details",
    "elaborate",
    "go deeper",
];

pub const UTILITY_KEYWORDS: &[&str] = &[
    "make it shorter",
    "make it simpler",
    "make it longer",
    "bullet points",
    "numbered list",
    "summarize it",
    "simplify it",
    "reformat",
    "just the conclusion",
    "just the summary",
    "key points only",
    "shorter version",
    "simpler version",
    "as a table",
];

fn has_keyword(message_lower: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| message_lower.contains(kw))
}

fn is_trivial_chat(message_lower: &str) -> bool {
    let cleaned: String = message_lower
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let cleaned = cleaned.trim();
    TRIVIAL_CHAT.iter().any(|p| p.is_match(cleaned))
}

#[derive(Debug, Deserialize)]
struct IntentVerdict {
    intent: String,
    #[serde(default)]
    confidence: Option<f64>,
}

const INTENT_SYSTEM_PROMPT: &str = "You classify messages sent to a biomedical literature \
review assistant. Respond with strict JSON only.";

/// Four-stage hybrid intent classifier: regex fast path, keyword sets,
/// LLM fallback, then context validation.
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn classify(
        &self,
        message: &str,
        session: Option<&SessionContext>,
    ) -> (Intent, f64) {
        let message = message.trim();
        let lower = message.to_lowercase();

        // Stage 1: fast path
        if message.len() < 2 || is_trivial_chat(&lower) {
            debug!("intent fast path: trivial chat");
            return (Intent::Chat, 0.98);
        }

        // Stage 2: keyword sets
        let has_medical = has_keyword(&lower, MEDICAL_KEYWORDS);
        let has_system = has_keyword(&lower, SYSTEM_KEYWORDS);
        let has_followup = has_keyword(&lower, FOLLOWUP_KEYWORDS);
        let has_utility = has_keyword(&lower, UTILITY_KEYWORDS);
        let has_session = session.is_some();
        let has_synthesis = session
            .map(|s| !s.synthesis_summary.is_empty())
            .unwrap_or(false);

        let staged = if has_followup && has_session {
            Some((Intent::FollowupResearch, 0.90))
        } else if has_utility && has_session && has_synthesis {
            Some((Intent::Utility, 0.90))
        } else if has_system && !has_medical {
            Some((Intent::Chat, 0.85))
        } else if has_medical && !has_followup && !has_utility {
            Some((Intent::Research, 0.85))
        } else {
            None
        };

        // Stage 3: LLM for the ambiguous remainder
        let (intent, confidence) = match staged {
            Some(hit) => hit,
            None => self.llm_classify(message, has_session).await,
        };

        // Stage 4: context validation
        self.validate(
            intent,
            confidence,
            message,
            has_medical,
            has_session,
            has_synthesis,
        )
    }

    async fn llm_classify(&self, message: &str, has_session: bool) -> (Intent, f64) {
        let prompt = format!(
            r#"Classify the intent of this message.

Message: {message}
Active session with prior results: {has_session}

Intents:
- "research": a new biomedical literature question
- "followup_research": a question about previously retrieved results
- "chat": greetings, small talk, questions about the assistant itself
- "utility": a request to reformat or condense prior output

Respond with only a JSON object: {{"intent": "...", "confidence": 0.0}}"#,
        );

        let response = match self.llm.complete(INTENT_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "intent LLM call failed, defaulting to chat");
                return (Intent::Chat, 0.4);
            }
        };

        let parsed = extract_json_object(&response)
            .and_then(|json| serde_json::from_str::<IntentVerdict>(&json).ok())
            .and_then(|verdict| {
                Intent::parse(&verdict.intent)
                    .map(|intent| (intent, verdict.confidence.unwrap_or(0.7).clamp(0.0, 1.0)))
            });

        match parsed {
            Some(hit) => hit,
            None => {
                warn!("unparseable intent response, defaulting to chat");
                (Intent::Chat, 0.4)
            }
        }
    }

    fn validate(
        &self,
        intent: Intent,
        confidence: f64,
        message: &str,
        has_medical: bool,
        has_session: bool,
        has_synthesis: bool,
    ) -> (Intent, f64) {
        match intent {
            Intent::FollowupResearch if !has_session => {
                debug!("intent validation: followup without session, rewriting to research");
                (Intent::Research, confidence)
            }
            Intent::Utility if !has_synthesis => {
                debug!("intent validation: utility without prior output, rewriting to chat");
                (Intent::Chat, confidence)
            }
            Intent::Research
                if message.split_whitespace().count() < 3 && !has_medical =>
            {
                debug!("intent validation: short non-medical research message, rewriting to chat");
                (Intent::Chat, confidence)
            }
            _ => (intent, confidence),
        }
    }
}

/// Intent node: classifies the message and records the result in state.
pub struct IntentTask {
    classifier: IntentClassifier,
}

impl IntentTask {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            classifier: IntentClassifier::new(llm),
        }
    }
}

#[async_trait]
impl Task for IntentTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let mut state: OrchestratorState = context
            .get("state")
            .await
            .ok_or_else(|| GraphError::ContextError("state not found in context".to_string()))?;

        let (intent, confidence) = self
            .classifier
            .classify(&state.input_message, state.session_context.as_ref())
            .await;

        info!(
            intent = intent.as_str(),
            confidence = format!("{confidence:.2}").as_str(),
            "intent classified"
        );

        state.intent = Some(intent);
        state.intent_confidence = Some(confidence);
        context.set("state", &state).await;

        Ok(TaskResult::new(None, NextAction::Continue))
    }
}
