pub mod embedding;
pub mod llm;
pub mod pubmed;

pub use embedding::{cosine_similarity, EmbeddingClient, HttpEmbeddingClient};
pub use llm::{LlmClient, OpenRouterLlm};
pub use pubmed::{HttpPubMedClient, PubMed};
