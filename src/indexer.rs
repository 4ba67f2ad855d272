use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::chunk;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::extract::{self, SourceKind};
use crate::models::Policy;
use crate::store;

/// Chunk, embed, and store a policy's excerpts, replacing any prior set for
/// the same policy id. The delete and insert run in one transaction, so a
/// re-upload never leaves stale excerpts behind and a failure leaves the
/// previous set intact.
///
/// Returns the number of chunks written.
pub async fn reindex_policy(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
    policy: &Policy,
    content: &str,
) -> Result<usize> {
    let drafts = chunk::chunk_policy_text(content);

    // Embed before touching the stored set; an embedding failure aborts the
    // reindex with the old excerpts still in place.
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(drafts.len());
    let batch_size = batch_size.max(1);
    for batch in drafts.chunks(batch_size) {
        let inputs: Vec<String> = batch.iter().map(|d| d.embed_input.clone()).collect();
        let mut batch_vecs = provider
            .embed(&inputs)
            .await
            .with_context(|| format!("Failed to embed chunks for policy {}", policy.id))?;
        if batch_vecs.len() != inputs.len() {
            anyhow::bail!(
                "Embedding provider returned {} vectors for {} inputs",
                batch_vecs.len(),
                inputs.len()
            );
        }
        vectors.append(&mut batch_vecs);
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM policy_chunks WHERE policy_id = ?")
        .bind(&policy.id)
        .execute(&mut *tx)
        .await?;

    for (index, (draft, vector)) in drafts.iter().zip(vectors.iter()).enumerate() {
        let blob = embedding::vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO policy_chunks
                (id, policy_id, policy_name, payer, state, effective_date,
                 section, page, chunk_index, text, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&policy.id)
        .bind(&policy.name)
        .bind(&policy.payer)
        .bind(&policy.state)
        .bind(&policy.effective_date)
        .bind(&draft.section)
        .bind(draft.page)
        .bind(index as i64)
        .bind(&draft.text)
        .bind(&blob)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        policy_id = %policy.id,
        policy_name = %policy.name,
        chunks = drafts.len(),
        "reindexed policy"
    );

    Ok(drafts.len())
}

/// CLI entry point: register a policy from a local file and index it.
pub async fn run_index(
    config: &Config,
    path: &std::path::Path,
    name: &str,
    payer: &str,
    state: &str,
    effective_date: &str,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        anyhow::bail!("Indexing requires embeddings. Set [embedding] provider in config.");
    }

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read policy file: {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("policy")
        .to_string();

    let kind = SourceKind::detect("application/octet-stream", &filename);
    let content = extract::extract_text_blocking(bytes, kind, config.ocr.clone()).await;
    if content.trim().is_empty() {
        anyhow::bail!("No text could be extracted from {}", path.display());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;

    let policy = store::upsert_policy(&pool, name, payer, state, effective_date).await?;
    let count = reindex_policy(
        &pool,
        provider.as_ref(),
        config.embedding.batch_size,
        &policy,
        &content,
    )
    .await?;

    store::record_audit(
        &pool,
        "index_policy",
        None,
        serde_json::json!({ "policy_id": policy.id, "chunks": count }),
    )
    .await;

    println!("indexed policy");
    println!("  id: {}", policy.id);
    println!("  name: {}", policy.name);
    println!("  chunks: {}", count);

    pool.close().await;
    Ok(())
}
