use anyhow::Context as _;

/// Environment-derived service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// OpenRouter key for all completion calls
    pub llm_api_key: String,
    /// Model used for grading, synthesis and Q&A
    pub llm_model: String,
    /// Cheaper model for intent/chat/utility traffic
    pub light_model: String,
    pub embeddings_api_key: String,
    pub embeddings_base_url: String,
    pub embeddings_model: String,
    /// When unset the acceptance memory runs in-process (useful for dev)
    pub database_url: Option<String>,
    pub pubmed_base_url: String,
}

pub const DEFAULT_PUBMED_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let llm_api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY environment variable is required")?;

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .unwrap_or(3000);

        Ok(Self {
            port,
            llm_api_key,
            llm_model: std::env::var("AESOP_LLM_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4.1-mini".to_string()),
            light_model: std::env::var("AESOP_LIGHT_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            embeddings_api_key: std::env::var("EMBEDDINGS_API_KEY").unwrap_or_default(),
            embeddings_base_url: std::env::var("EMBEDDINGS_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            embeddings_model: std::env::var("EMBEDDINGS_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            pubmed_base_url: std::env::var("PUBMED_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_PUBMED_BASE.to_string()),
        })
    }
}
