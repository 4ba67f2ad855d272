use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::PolicyHit;

/// Rank policy excerpts against a query by embedding similarity.
///
/// `payer` and `state` are case-insensitive substring pre-filters; an unset
/// filter matches everything. Results are sorted by descending score; ties
/// keep the candidate set's stored order. At most `k` hits are returned, and
/// an empty candidate set yields an empty list, not an error.
pub async fn search_policies(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    query: &str,
    payer: Option<&str>,
    state: Option<&str>,
    k: usize,
) -> Result<Vec<PolicyHit>> {
    let candidates = fetch_candidates(pool, payer, state).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embedding::embed_query(provider, query).await?;

    let mut hits: Vec<PolicyHit> = candidates
        .into_iter()
        .filter_map(|c| {
            // No stored embedding means the chunk cannot be scored.
            let vec = c.embedding?;
            let score = embedding::cosine_similarity(&query_vec, &vec);
            Some(PolicyHit {
                policy_id: c.policy_id,
                policy_name: c.policy_name,
                effective_date: c.effective_date,
                section: c.section,
                page: c.page,
                excerpt_id: c.excerpt_id,
                text: c.text,
                score,
            })
        })
        .collect();

    // Stable sort keeps stored order for equal scores.
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);

    Ok(hits)
}

struct Candidate {
    policy_id: String,
    policy_name: String,
    effective_date: String,
    section: String,
    page: i64,
    excerpt_id: String,
    text: String,
    embedding: Option<Vec<f32>>,
}

async fn fetch_candidates(
    pool: &SqlitePool,
    payer: Option<&str>,
    state: Option<&str>,
) -> Result<Vec<Candidate>> {
    let mut sql = String::from(
        "SELECT id, policy_id, policy_name, effective_date, section, page, text, embedding \
         FROM policy_chunks WHERE 1=1",
    );
    if payer.is_some() {
        sql.push_str(" AND LOWER(payer) LIKE '%' || LOWER(?) || '%'");
    }
    if state.is_some() {
        sql.push_str(" AND LOWER(state) LIKE '%' || LOWER(?) || '%'");
    }
    sql.push_str(" ORDER BY rowid");

    let mut query = sqlx::query(&sql);
    if let Some(p) = payer {
        query = query.bind(p.to_string());
    }
    if let Some(s) = state {
        query = query.bind(s.to_string());
    }

    let rows = query.fetch_all(pool).await?;

    let candidates = rows
        .iter()
        .map(|row| {
            let blob: Option<Vec<u8>> = row.get("embedding");
            Candidate {
                excerpt_id: row.get("id"),
                policy_id: row.get("policy_id"),
                policy_name: row.get("policy_name"),
                effective_date: row.get("effective_date"),
                section: row.get("section"),
                page: row.get("page"),
                text: row.get("text"),
                embedding: blob.map(|b| embedding::blob_to_vec(&b)),
            }
        })
        .collect();

    Ok(candidates)
}

/// CLI entry point: run a search and print ranked excerpts.
pub async fn run_search(
    config: &Config,
    query: &str,
    payer: Option<String>,
    state: Option<String>,
    k: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        anyhow::bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let k = k.unwrap_or(config.retrieval.default_k);

    let hits = search_policies(
        &pool,
        provider.as_ref(),
        query,
        payer.as_deref(),
        state.as_deref(),
        k,
    )
    .await?;

    if hits.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {} (page {})",
            i + 1,
            hit.score,
            hit.policy_name,
            hit.section,
            hit.page
        );
        println!("    effective: {}", hit.effective_date);
        let preview: String = hit.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", preview.replace('\n', " "));
        println!("    id: {}", hit.excerpt_id);
        println!();
    }

    pool.close().await;
    Ok(())
}
