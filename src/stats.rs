//! Database statistics overview.
//!
//! Summarizes what the pipeline has accumulated: case counts by status,
//! document and policy counts, chunk and embedding coverage, and a per-payer
//! breakdown. Used by `apd stats` to give confidence that uploads and
//! indexing are working as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-payer breakdown of policy and chunk counts.
struct PayerStats {
    payer: String,
    state: String,
    policy_count: i64,
    chunk_count: i64,
    embedded_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_cases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cases")
        .fetch_one(&pool)
        .await?;

    let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;

    let total_policies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policies")
        .fetch_one(&pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_chunks")
        .fetch_one(&pool)
        .await?;

    let total_embedded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM policy_chunks WHERE embedding IS NOT NULL")
            .fetch_one(&pool)
            .await?;

    let total_audit: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Appealdesk — Database Stats");
    println!("===========================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Cases:         {}", total_cases);
    println!("  Documents:     {}", total_documents);
    println!("  Policies:      {}", total_policies);
    println!("  Chunks:        {}", total_chunks);
    println!(
        "  Embedded:      {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!("  Audit entries: {}", total_audit);

    // Cases by pipeline status
    let status_rows = sqlx::query(
        "SELECT status, COUNT(*) AS case_count FROM cases GROUP BY status ORDER BY case_count DESC, status",
    )
    .fetch_all(&pool)
    .await?;

    if !status_rows.is_empty() {
        println!();
        println!("  Cases by status:");
        for row in &status_rows {
            let status: String = row.get("status");
            let count: i64 = row.get("case_count");
            println!("    {:<18} {}", status, count);
        }
    }

    // Per-payer breakdown of the retrieval corpus
    let payer_rows = sqlx::query(
        r#"
        SELECT
            p.payer,
            p.state,
            COUNT(DISTINCT p.id) AS policy_count,
            COUNT(c.id) AS chunk_count,
            COUNT(c.embedding) AS embedded_count
        FROM policies p
        LEFT JOIN policy_chunks c ON c.policy_id = p.id
        GROUP BY p.payer, p.state
        ORDER BY policy_count DESC, p.payer, p.state
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut payer_stats: Vec<PayerStats> = Vec::new();
    for row in &payer_rows {
        payer_stats.push(PayerStats {
            payer: row.get("payer"),
            state: row.get("state"),
            policy_count: row.get("policy_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
        });
    }

    if !payer_stats.is_empty() {
        println!();
        println!("  By payer:");
        println!(
            "  {:<28} {:>5} {:>9} {:>8} {:>10}",
            "PAYER", "STATE", "POLICIES", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(64));

        for s in &payer_stats {
            println!(
                "  {:<28} {:>5} {:>9} {:>8} {:>10}",
                s.payer, s.state, s.policy_count, s.chunk_count, s.embedded_count
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
