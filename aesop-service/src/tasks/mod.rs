pub mod chat;
pub mod context_qa;
pub mod critic;
pub mod intent;
pub mod merge;
pub mod router;
pub mod save_session;
pub mod scout;
pub mod synthesizer;
pub mod utility;

pub use chat::ChatTask;
pub use context_qa::ContextQaTask;
pub use critic::CriticTask;
pub use intent::IntentTask;
pub use merge::MergeTask;
pub use router::RouterTask;
pub use save_session::SaveSessionTask;
pub use scout::ScoutTask;
pub use synthesizer::SynthesizerTask;
pub use utility::UtilityTask;
