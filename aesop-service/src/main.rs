use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use aesop_service::clients::{HttpEmbeddingClient, HttpPubMedClient, OpenRouterLlm};
use aesop_service::stores::memory::{InMemoryAcceptanceMemory, PostgresAcceptanceMemory};
use aesop_service::stores::session::InMemorySessionStore;
use aesop_service::stores::AcceptanceMemory;
use aesop_service::{build_router, AppState, Config, EngineDeps};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let embedder = Arc::new(HttpEmbeddingClient::new(
        config.embeddings_base_url.clone(),
        config.embeddings_api_key.clone(),
        config.embeddings_model.clone(),
    )?);

    let memory: Arc<dyn AcceptanceMemory> = match &config.database_url {
        Some(url) => Arc::new(PostgresAcceptanceMemory::connect(url, embedder.clone()).await?),
        None => {
            warn!("DATABASE_URL not set, acceptance memory will not survive restarts");
            Arc::new(InMemoryAcceptanceMemory::new(embedder.clone()))
        }
    };

    let deps = EngineDeps {
        llm: Arc::new(OpenRouterLlm::new(
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )),
        light_llm: Arc::new(OpenRouterLlm::new(
            config.llm_api_key.clone(),
            config.light_model.clone(),
        )),
        pubmed: Arc::new(HttpPubMedClient::new(config.pubmed_base_url.clone())?),
        embedder,
        session_store: Arc::new(InMemorySessionStore::new()),
        memory,
    };

    let app = build_router(AppState::new(&deps));
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let addr = listener.local_addr()?;

    info!("AESOP evidence synthesis engine starting on {addr}");
    info!("Health check endpoint: http://{addr}/health");
    info!("Chat endpoint: POST http://{addr}/chat");

    axum::serve(listener, app).await?;

    Ok(())
}
