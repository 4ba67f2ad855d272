//! SQLite persistence for cases, documents, policies, and the audit trail.

use anyhow::{anyhow, Result};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::models::{AuditEntry, Case, CaseStatus, Document, DocumentKind, Policy};

// ============ Cases ============

pub async fn create_case(
    pool: &SqlitePool,
    patient_name: &str,
    payer: &str,
    state: &str,
    cpt_codes: &[String],
    icd10_codes: &[String],
) -> Result<Case> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO cases (id, patient_name, payer, state, cpt_codes, icd10_codes,
                           status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 'new', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(patient_name)
    .bind(payer)
    .bind(state)
    .bind(serde_json::to_string(cpt_codes)?)
    .bind(serde_json::to_string(icd10_codes)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_case(pool, &id)
        .await?
        .ok_or_else(|| anyhow!("Case {} vanished after insert", id))
}

pub async fn get_case(pool: &SqlitePool, id: &str) -> Result<Option<Case>> {
    let row = sqlx::query("SELECT * FROM cases WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| map_case(&r)).transpose()
}

pub async fn list_cases(pool: &SqlitePool) -> Result<Vec<Case>> {
    let rows = sqlx::query("SELECT * FROM cases ORDER BY created_at DESC, id")
        .fetch_all(pool)
        .await?;

    rows.iter().map(map_case).collect()
}

fn map_case(row: &sqlx::sqlite::SqliteRow) -> Result<Case> {
    let status_raw: String = row.get("status");
    let status = CaseStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("Invalid case status in database: {}", status_raw))?;

    Ok(Case {
        id: row.get("id"),
        patient_name: row.get("patient_name"),
        payer: row.get("payer"),
        state: row.get("state"),
        cpt_codes: parse_string_list(row.get("cpt_codes")),
        icd10_codes: parse_string_list(row.get("icd10_codes")),
        status,
        reviewed: row.get::<i64, _>("reviewed") != 0,
        reviewed_at: row.get("reviewed_at"),
        extracted_facts: parse_json_column(row.get("extracted_facts")),
        policy_matches: parse_json_column(row.get("policy_matches")),
        denial_analysis: parse_json_column(row.get("denial_analysis")),
        generated_draft: parse_json_column(row.get("generated_draft")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_string_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn parse_json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Persist one stage's artifact and move the case to that stage's resulting
/// state. Re-running an earlier stage rolls the status back; downstream
/// artifacts are kept but considered stale.
async fn save_stage_artifact(
    pool: &SqlitePool,
    case_id: &str,
    sql: &str,
    value: &serde_json::Value,
    status: CaseStatus,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(sql)
        .bind(serde_json::to_string(value)?)
        .bind(status.as_str())
        .bind(now)
        .bind(case_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(anyhow!("Case not found: {}", case_id));
    }
    Ok(())
}

pub async fn save_extracted_facts(
    pool: &SqlitePool,
    case_id: &str,
    facts: &serde_json::Value,
) -> Result<()> {
    save_stage_artifact(
        pool,
        case_id,
        "UPDATE cases SET extracted_facts = ?, status = ?, updated_at = ? WHERE id = ?",
        facts,
        CaseStatus::FactsExtracted,
    )
    .await
}

pub async fn save_policy_matches(
    pool: &SqlitePool,
    case_id: &str,
    matches: &serde_json::Value,
) -> Result<()> {
    save_stage_artifact(
        pool,
        case_id,
        "UPDATE cases SET policy_matches = ?, status = ?, updated_at = ? WHERE id = ?",
        matches,
        CaseStatus::PoliciesMatched,
    )
    .await
}

pub async fn save_denial_analysis(
    pool: &SqlitePool,
    case_id: &str,
    analysis: &serde_json::Value,
) -> Result<()> {
    save_stage_artifact(
        pool,
        case_id,
        "UPDATE cases SET denial_analysis = ?, status = ?, updated_at = ? WHERE id = ?",
        analysis,
        CaseStatus::Analyzed,
    )
    .await
}

pub async fn save_generated_draft(
    pool: &SqlitePool,
    case_id: &str,
    draft: &serde_json::Value,
) -> Result<()> {
    save_stage_artifact(
        pool,
        case_id,
        "UPDATE cases SET generated_draft = ?, status = ?, updated_at = ? WHERE id = ?",
        draft,
        CaseStatus::Drafted,
    )
    .await
}

pub async fn mark_reviewed(pool: &SqlitePool, case_id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE cases SET reviewed = 1, reviewed_at = ?, status = ?, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(CaseStatus::Reviewed.as_str())
    .bind(now)
    .bind(case_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(anyhow!("Case not found: {}", case_id));
    }
    Ok(())
}

// ============ Documents ============

pub async fn insert_document(
    pool: &SqlitePool,
    case_id: &str,
    kind: DocumentKind,
    filename: &str,
    content_type: &str,
    size_bytes: i64,
    text: &str,
) -> Result<Document> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO documents (id, case_id, kind, filename, content_type, size_bytes, text, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(case_id)
    .bind(kind.as_str())
    .bind(filename)
    .bind(content_type)
    .bind(size_bytes)
    .bind(text)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Document {
        id,
        case_id: case_id.to_string(),
        kind,
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        size_bytes,
        text: text.to_string(),
        created_at: now,
    })
}

pub async fn get_documents(pool: &SqlitePool, case_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE case_id = ? ORDER BY created_at, id")
        .bind(case_id)
        .fetch_all(pool)
        .await?;

    rows.iter().map(map_document).collect()
}

fn map_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let kind_raw: String = row.get("kind");
    let kind = DocumentKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("Invalid document kind in database: {}", kind_raw))?;

    Ok(Document {
        id: row.get("id"),
        case_id: row.get("case_id"),
        kind,
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        size_bytes: row.get("size_bytes"),
        text: row.get("text"),
        created_at: row.get("created_at"),
    })
}

// ============ Policies ============

/// Find or create a policy by (name, payer, state). Re-registering updates
/// the effective date and keeps the id stable so reindexing replaces the
/// existing chunk set.
pub async fn upsert_policy(
    pool: &SqlitePool,
    name: &str,
    payer: &str,
    state: &str,
    effective_date: &str,
) -> Result<Policy> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM policies WHERE name = ? AND payer = ? AND state = ?")
            .bind(name)
            .bind(payer)
            .bind(state)
            .fetch_optional(pool)
            .await?;

    let id = match existing {
        Some(id) => {
            sqlx::query("UPDATE policies SET effective_date = ? WHERE id = ?")
                .bind(effective_date)
                .bind(&id)
                .execute(pool)
                .await?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let now = chrono::Utc::now().timestamp();
            sqlx::query(
                "INSERT INTO policies (id, name, payer, state, effective_date, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(name)
            .bind(payer)
            .bind(state)
            .bind(effective_date)
            .bind(now)
            .execute(pool)
            .await?;
            id
        }
    };

    get_policy(pool, &id)
        .await?
        .ok_or_else(|| anyhow!("Policy {} vanished after upsert", id))
}

pub async fn get_policy(pool: &SqlitePool, id: &str) -> Result<Option<Policy>> {
    let row = sqlx::query("SELECT * FROM policies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| map_policy(&r)))
}

pub async fn list_policies(pool: &SqlitePool) -> Result<Vec<Policy>> {
    let rows = sqlx::query("SELECT * FROM policies ORDER BY created_at DESC, id")
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(map_policy).collect())
}

fn map_policy(row: &sqlx::sqlite::SqliteRow) -> Policy {
    Policy {
        id: row.get("id"),
        name: row.get("name"),
        payer: row.get("payer"),
        state: row.get("state"),
        effective_date: row.get("effective_date"),
        created_at: row.get("created_at"),
    }
}

// ============ Audit trail ============

/// Record an audit entry. Fire-and-forget: storage failures are logged and
/// never propagated to the caller.
pub async fn record_audit(
    pool: &SqlitePool,
    action: &str,
    case_id: Option<&str>,
    details: serde_json::Value,
) {
    let now = chrono::Utc::now().timestamp();
    let details_text = details.to_string();

    let result = sqlx::query(
        "INSERT INTO audit_log (action, case_id, details, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(action)
    .bind(case_id)
    .bind(&details_text)
    .bind(now)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!(action = action, error = %e, "failed to record audit entry");
    }
}

pub async fn list_audit(pool: &SqlitePool, case_id: Option<&str>) -> Result<Vec<AuditEntry>> {
    let rows = match case_id {
        Some(id) => {
            sqlx::query("SELECT * FROM audit_log WHERE case_id = ? ORDER BY id DESC")
                .bind(id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM audit_log ORDER BY id DESC")
                .fetch_all(pool)
                .await?
        }
    };

    Ok(rows
        .iter()
        .map(|row| AuditEntry {
            id: row.get("id"),
            action: row.get("action"),
            case_id: row.get("case_id"),
            details: parse_json_column(row.get("details")).unwrap_or(serde_json::Value::Null),
            created_at: row.get("created_at"),
        })
        .collect())
}
