use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create cases table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cases (
            id TEXT PRIMARY KEY,
            patient_name TEXT NOT NULL,
            payer TEXT NOT NULL,
            state TEXT NOT NULL,
            cpt_codes TEXT NOT NULL DEFAULT '[]',
            icd10_codes TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'new',
            reviewed INTEGER NOT NULL DEFAULT 0,
            reviewed_at INTEGER,
            extracted_facts TEXT,
            policy_matches TEXT,
            denial_analysis TEXT,
            generated_draft TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
            size_bytes INTEGER NOT NULL DEFAULT 0,
            text TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (case_id) REFERENCES cases(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create policies table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policies (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            payer TEXT NOT NULL,
            state TEXT NOT NULL,
            effective_date TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create policy_chunks table; citation metadata is denormalized onto
    // every chunk so retrieval never joins back to policies.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policy_chunks (
            id TEXT PRIMARY KEY,
            policy_id TEXT NOT NULL,
            policy_name TEXT NOT NULL,
            payer TEXT NOT NULL,
            state TEXT NOT NULL,
            effective_date TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT 'General',
            page INTEGER NOT NULL DEFAULT 1,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB,
            created_at INTEGER NOT NULL,
            UNIQUE(policy_id, chunk_index),
            FOREIGN KEY (policy_id) REFERENCES policies(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create audit_log table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            case_id TEXT,
            details TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_case_id ON documents(case_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_policy_chunks_policy_id ON policy_chunks(policy_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_case_id ON audit_log(case_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cases_created_at ON cases(created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
