use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clients::embedding::{cosine_similarity, EmbeddingClient};
use crate::models::{query_hash, AcceptanceRecord};

/// Ceiling on the threshold bias derived from memory.
pub const MAX_MEMORY_BOOST: f64 = 0.15;
/// Minimum cosine similarity for the vector-search fallback path.
pub const SIMILARITY_THRESHOLD: f64 = 0.75;
/// Exponential recency decay per day of record age.
pub const DECAY_LAMBDA: f64 = 0.01;
/// At most this many rows feed one bias computation.
pub const MEMORY_FETCH_LIMIT: i64 = 10;

/// Durable store of accepted evidence. Append-only; reads bias the CRAG
/// sufficiency threshold and never touch individual grades.
#[async_trait]
pub trait AcceptanceMemory: Send + Sync {
    /// Append one accepted-evidence row. Failures are the caller's to log.
    async fn record(&self, record: &AcceptanceRecord) -> anyhow::Result<()>;

    /// Bias in [0, 0.15] for the given query. Never errors: any storage or
    /// embedding failure degrades to 0.0 so the CRAG loop stays live.
    async fn fetch_bias(&self, query: &str) -> f64;
}

/// Shared bias math: similarity- and recency-weighted mean quality,
/// clamped to the boost ceiling.
fn bias_from_rows(rows: &[(f64, DateTime<Utc>, f64)], now: DateTime<Utc>) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }

    let sum: f64 = rows
        .iter()
        .map(|(quality, accepted_at, similarity)| {
            let age_days = (now - *accepted_at).num_days().max(0) as f64;
            let recency = (-DECAY_LAMBDA * age_days).exp();
            quality * similarity * recency
        })
        .sum();

    (sum / rows.len() as f64).clamp(0.0, MAX_MEMORY_BOOST)
}

fn vector_literal(embedding: &[f32]) -> String {
    let joined = embedding
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{joined}]")
}

/// Postgres + pgvector acceptance memory.
pub struct PostgresAcceptanceMemory {
    pool: PgPool,
    embedder: Arc<dyn EmbeddingClient>,
}

impl PostgresAcceptanceMemory {
    pub async fn connect(
        database_url: &str,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool, embedder };
        store.init_schema().await?;
        info!("acceptance memory connected");
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS critic_acceptance_memory (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                research_query text NOT NULL,
                query_hash text GENERATED ALWAYS AS (md5(lower(trim(research_query)))) STORED,
                query_embedding vector(1536) NOT NULL,
                pmid text NOT NULL,
                study_type text,
                publication_year int,
                relevance_score double precision CHECK (relevance_score >= 0 AND relevance_score <= 1),
                methodology_score double precision CHECK (methodology_score >= 0 AND methodology_score <= 1),
                quality_score double precision CHECK (quality_score >= 0 AND quality_score <= 1),
                iteration int NOT NULL,
                accepted_at timestamptz NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cam_query_hash ON critic_acceptance_memory (query_hash)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cam_query_embedding ON critic_acceptance_memory \
             USING ivfflat (query_embedding vector_cosine_ops) WITH (lists = 100)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_bias_inner(&self, query: &str) -> anyhow::Result<f64> {
        // Exact-match fast path
        let rows: Vec<(f64, DateTime<Utc>, f64)> = sqlx::query_as(
            "SELECT quality_score, accepted_at, 1.0::float8 AS similarity \
             FROM critic_acceptance_memory \
             WHERE query_hash = md5(lower(trim($1))) \
             ORDER BY accepted_at DESC LIMIT $2",
        )
        .bind(query)
        .bind(MEMORY_FETCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            return Ok(bias_from_rows(&rows, Utc::now()));
        }

        // Vector-similarity fallback
        let embedding = self.embedder.embed(query).await?;
        let literal = vector_literal(&embedding);

        let rows: Vec<(f64, DateTime<Utc>, f64)> = sqlx::query_as(
            "SELECT quality_score, accepted_at, \
                    1 - (query_embedding <=> $1::vector) AS similarity \
             FROM critic_acceptance_memory \
             WHERE 1 - (query_embedding <=> $1::vector) >= $2 \
             ORDER BY similarity DESC LIMIT $3",
        )
        .bind(&literal)
        .bind(SIMILARITY_THRESHOLD)
        .bind(MEMORY_FETCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(bias_from_rows(&rows, Utc::now()))
    }
}

#[async_trait]
impl AcceptanceMemory for PostgresAcceptanceMemory {
    async fn record(&self, record: &AcceptanceRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO critic_acceptance_memory \
             (research_query, query_embedding, pmid, study_type, publication_year, \
              relevance_score, methodology_score, quality_score, iteration, accepted_at) \
             VALUES ($1, $2::vector, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&record.research_query)
        .bind(vector_literal(&record.query_embedding))
        .bind(&record.pmid)
        .bind(&record.study_type)
        .bind(record.publication_year)
        .bind(record.relevance_score)
        .bind(record.methodology_score)
        .bind(record.quality_score)
        .bind(record.iteration)
        .bind(record.accepted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_bias(&self, query: &str) -> f64 {
        match self.fetch_bias_inner(query).await {
            Ok(bias) => bias,
            Err(e) => {
                warn!(error = %e, "memory bias lookup failed, using 0.0");
                0.0
            }
        }
    }
}

/// In-process acceptance memory with the same bias semantics, used when no
/// database is configured and throughout the test suite.
pub struct InMemoryAcceptanceMemory {
    rows: RwLock<Vec<AcceptanceRecord>>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl InMemoryAcceptanceMemory {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            embedder,
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl AcceptanceMemory for InMemoryAcceptanceMemory {
    async fn record(&self, record: &AcceptanceRecord) -> anyhow::Result<()> {
        self.rows.write().await.push(record.clone());
        Ok(())
    }

    async fn fetch_bias(&self, query: &str) -> f64 {
        let rows = self.rows.read().await;

        let hash = query_hash(query);
        let mut matched: Vec<(f64, DateTime<Utc>, f64)> = rows
            .iter()
            .filter(|r| query_hash(&r.research_query) == hash)
            .map(|r| (r.quality_score, r.accepted_at, 1.0))
            .collect();
        matched.sort_by(|a, b| b.1.cmp(&a.1));
        matched.truncate(MEMORY_FETCH_LIMIT as usize);

        if matched.is_empty() {
            let embedding = match self.embedder.embed(query).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "memory embedding failed, using 0.0");
                    return 0.0;
                }
            };

            matched = rows
                .iter()
                .filter_map(|r| {
                    let similarity =
                        cosine_similarity(&embedding, &r.query_embedding) as f64;
                    (similarity >= SIMILARITY_THRESHOLD)
                        .then_some((r.quality_score, r.accepted_at, similarity))
                })
                .collect();
            matched.sort_by(|a, b| b.2.total_cmp(&a.2));
            matched.truncate(MEMORY_FETCH_LIMIT as usize);
        }

        bias_from_rows(&matched, Utc::now())
    }
}
