//! The four-stage drafting pipeline.
//!
//! Each stage reads persisted case state, makes at most one generation call,
//! and writes its artifact back to the case:
//!
//! 1. **Extraction** — structured facts from the uploaded documents.
//! 2. **Policy matching** — semantic retrieval of relevant policy excerpts.
//! 3. **Denial analysis** — a missing-documentation checklist.
//! 4. **Draft generation** — a citation-carrying appeal letter.
//!
//! Stages gate on the case having reached the prior stage's status. Malformed
//! model output never fails a stage: the raw response is folded into a
//! degraded artifact and the pipeline stays live. Only precondition violations
//! and provider/storage faults are surfaced as errors.

use serde_json::{json, Value};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::chunk::truncate_chars;
use crate::embedding::EmbeddingProvider;
use crate::llm::GenerationProvider;
use crate::models::{Case, CaseStatus, DocumentKind};
use crate::{search, store};

/// Pipeline failure taxonomy. Anything not covered here (unparseable model
/// output, empty retrieval results) is not an error.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No case with the given id.
    #[error("Case not found: {0}")]
    CaseNotFound(String),

    /// The case is not ready for the requested stage.
    #[error("{0}")]
    Precondition(String),

    /// The generation or embedding provider call failed.
    #[error("Provider error: {0:#}")]
    Provider(anyhow::Error),

    /// A database read or write failed.
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

// ============ JSON recovery ============

/// Extract the first balanced bracketed span from `raw`, where `open`/`close`
/// are `{`/`}` or `[`/`]`. Scans with a depth counter from the first opening
/// bracket to its matching close, ignoring brackets inside JSON strings.
/// Returns `None` if no opening bracket exists or the span never balances.
fn balanced_span(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Recover the first balanced JSON object embedded in free text.
/// Returns `None` when no balanced `{...}` span exists or it fails to parse.
pub fn recover_json_object(raw: &str) -> Option<Value> {
    let span = balanced_span(raw, '{', '}')?;
    serde_json::from_str(span).ok()
}

/// Recover the first balanced JSON array embedded in free text.
pub fn recover_json_array(raw: &str) -> Option<Value> {
    let span = balanced_span(raw, '[', ']')?;
    serde_json::from_str(span).ok()
}

fn degraded_marker(tag: &str, raw: &str) -> Value {
    json!({ "error": tag, "raw_response": truncate_chars(raw, 500) })
}

// ============ Shared helpers ============

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn load_case(pool: &SqlitePool, case_id: &str) -> Result<Case, PipelineError> {
    store::get_case(pool, case_id)
        .await
        .map_err(PipelineError::Storage)?
        .ok_or_else(|| PipelineError::CaseNotFound(case_id.to_string()))
}

fn require_status(case: &Case, needed: CaseStatus, message: &str) -> Result<(), PipelineError> {
    if case.status.has_reached(needed) {
        Ok(())
    } else {
        Err(PipelineError::Precondition(message.to_string()))
    }
}

fn str_or<'a>(value: &'a Value, key: &str, default: &'a str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or(default)
}

fn scalar_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn case_facts(case: &Case) -> Value {
    case.extracted_facts.clone().unwrap_or_else(|| json!({}))
}

fn case_matches(case: &Case) -> Vec<Value> {
    case.policy_matches
        .as_ref()
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

// ============ Stage 1: extraction ============

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You are an administrative assistant for healthcare prior authorization and appeals. You do not provide medical advice. Extract structured data from the following documents for an insurance appeal case.

Hard rules:
- If information is missing, ask for it or list it as \"Missing\".
- Do not invent clinical facts, codes, dates, or policy criteria.
- Only use facts explicitly found in the documents.

Return ONLY valid JSON with no markdown formatting.";

/// Stage 1: extract structured facts from the case's uploaded documents.
///
/// Requires a denial-letter document with non-empty text; clinical notes and
/// imaging reports are included when present. The resulting artifact is
/// persisted as the case's `extracted_facts` and returned.
pub async fn extract_facts(
    pool: &SqlitePool,
    generator: &dyn GenerationProvider,
    case_id: &str,
) -> Result<Value, PipelineError> {
    let case = load_case(pool, case_id).await?;

    let documents = store::get_documents(pool, &case.id)
        .await
        .map_err(PipelineError::Storage)?;

    let mut denial_text = String::new();
    let mut clinical_text = String::new();
    let mut imaging_text = String::new();
    for doc in &documents {
        match doc.kind {
            DocumentKind::DenialLetter => denial_text = doc.text.clone(),
            DocumentKind::ClinicalNotes => clinical_text = doc.text.clone(),
            DocumentKind::ImagingReport => imaging_text = doc.text.clone(),
            _ => {}
        }
    }

    if denial_text.is_empty() {
        return Err(PipelineError::Precondition(
            "A denial letter document is required for extraction".to_string(),
        ));
    }

    let user_prompt = format!(
        "\
Extract structured data from these documents.

Return JSON with:
- payer_name
- denial_reasons: [list]
- denial_reason_category: (missing_documentation | medical_necessity | coding_billing | authorization_issue | eligibility | other)
- requested_service (plain English)
- CPT_HCPCS_codes: [list]
- ICD10_codes: [list]
- patient_age (if present)
- key_clinical_facts: [bullet list of facts explicitly stated]
- dates: {{date_of_service, denial_date, submission_date if present}}
- missing_information: [list of fields needed to proceed]

Only use facts explicitly found in the documents. If not present, set null and add to missing_information.

DENIAL LETTER:
{denial}

CLINICAL NOTES:
{clinical}

IMAGING REPORT:
{imaging}",
        denial = truncate_chars(&denial_text, 8000),
        clinical = if clinical_text.is_empty() {
            "Not provided".to_string()
        } else {
            truncate_chars(&clinical_text, 4000)
        },
        imaging = if imaging_text.is_empty() {
            "Not provided".to_string()
        } else {
            truncate_chars(&imaging_text, 4000)
        },
    );

    let response = generator
        .generate(EXTRACTION_SYSTEM_PROMPT, &user_prompt)
        .await
        .map_err(PipelineError::Provider)?;

    let facts = match balanced_span(&response, '{', '}') {
        None => degraded_marker("Could not parse extraction", &response),
        Some(span) => serde_json::from_str(span)
            .unwrap_or_else(|_| degraded_marker("Invalid JSON in response", &response)),
    };
    let degraded = facts.get("error").is_some();
    if degraded {
        warn!(case_id = %case.id, "fact extraction produced a degraded artifact");
    }

    store::save_extracted_facts(pool, &case.id, &facts)
        .await
        .map_err(PipelineError::Storage)?;

    store::record_audit(
        pool,
        "extract_facts",
        Some(&case.id),
        json!({ "model": generator.model_name(), "degraded": degraded }),
    )
    .await;

    info!(case_id = %case.id, degraded, "extracted case facts");
    Ok(facts)
}

// ============ Stage 2: policy matching ============

/// Build the retrieval query for a case from its extracted facts: requested
/// service, up to three denial reasons, and the case's procedure codes.
/// Falls back to `"<payer> coverage criteria"` when all are absent.
pub fn build_policy_query(case: &Case, facts: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(service) = facts.get("requested_service").and_then(|v| v.as_str()) {
        if !service.is_empty() {
            parts.push(service.to_string());
        }
    }
    if let Some(reasons) = facts.get("denial_reasons").and_then(|v| v.as_array()) {
        for reason in reasons.iter().take(3) {
            if let Some(r) = reason.as_str() {
                parts.push(r.to_string());
            }
        }
    }
    parts.extend(case.cpt_codes.iter().cloned());

    if parts.is_empty() {
        format!("{} coverage criteria", case.payer)
    } else {
        parts.join(" ")
    }
}

/// Stage 2: retrieve policy excerpts relevant to the case.
///
/// Filters by the case's payer and state, persists the ranked hits as the
/// case's `policy_matches`, and returns them.
pub async fn match_policies(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    case_id: &str,
    k: usize,
) -> Result<Value, PipelineError> {
    let case = load_case(pool, case_id).await?;
    require_status(
        &case,
        CaseStatus::FactsExtracted,
        "Facts must be extracted before policies can be matched",
    )?;

    let facts = case_facts(&case);
    let query = build_policy_query(&case, &facts);

    let hits = search::search_policies(
        pool,
        embedder,
        &query,
        Some(&case.payer),
        Some(&case.state),
        k,
    )
    .await
    .map_err(PipelineError::Provider)?;

    let matches = serde_json::to_value(&hits).map_err(|e| PipelineError::Storage(e.into()))?;

    store::save_policy_matches(pool, &case.id, &matches)
        .await
        .map_err(PipelineError::Storage)?;

    store::record_audit(
        pool,
        "match_policies",
        Some(&case.id),
        json!({ "query": query, "matches": hits.len() }),
    )
    .await;

    info!(case_id = %case.id, matches = hits.len(), "matched policies");
    Ok(matches)
}

// ============ Stage 3: denial analysis ============

const ANALYSIS_SYSTEM_PROMPT: &str = "\
You are an administrative assistant for healthcare prior authorization and appeals. Generate a missing documentation checklist based on case facts and policy requirements.

Return ONLY valid JSON with no markdown formatting.";

/// Stage 3: produce a missing-documentation checklist from the case facts and
/// matched policy excerpts, persisted as the case's `denial_analysis`.
pub async fn analyze_denial(
    pool: &SqlitePool,
    generator: &dyn GenerationProvider,
    case_id: &str,
) -> Result<Value, PipelineError> {
    let case = load_case(pool, case_id).await?;
    require_status(
        &case,
        CaseStatus::PoliciesMatched,
        "Policies must be matched before the denial can be analyzed",
    )?;

    let facts = case_facts(&case);
    let matches = case_matches(&case);

    let policy_excerpts = matches
        .iter()
        .take(5)
        .map(|m| {
            format!(
                "[{} | {} | Page {}]: {}",
                str_or(m, "policy_name", "Policy"),
                str_or(m, "section", ""),
                scalar_string(m.get("page")),
                truncate_chars(str_or(m, "text", ""), 500),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let facts_json =
        serde_json::to_string_pretty(&facts).map_err(|e| PipelineError::Storage(e.into()))?;

    let user_prompt = format!(
        "\
Using the case facts and policy excerpts, produce a checklist of required documentation.

CASE FACTS:
{facts}

POLICY EXCERPTS:
{excerpts}

Return JSON array:
[
  {{\"item\":\"...\", \"required_by_policy_citation\":\"[CITATION: PolicyName | Section | Page]\", \"status\":\"Present|Missing|Unknown\", \"notes\":\"...\"}}
]",
        facts = facts_json,
        excerpts = if policy_excerpts.is_empty() {
            "No matching policies found"
        } else {
            &policy_excerpts
        },
    );

    let response = generator
        .generate(ANALYSIS_SYSTEM_PROMPT, &user_prompt)
        .await
        .map_err(PipelineError::Provider)?;

    let checklist = match balanced_span(&response, '[', ']') {
        None => json!([{
            "item": "Unable to generate checklist",
            "status": "Unknown",
            "notes": truncate_chars(&response, 200),
        }]),
        Some(span) => serde_json::from_str(span).unwrap_or_else(|_| {
            json!([{
                "item": "Parse error",
                "status": "Unknown",
                "notes": truncate_chars(&response, 200),
            }])
        }),
    };

    let checklist_items = checklist.as_array().map(|a| a.len()).unwrap_or(0);
    let analysis = json!({
        "denial_category": facts
            .get("denial_reason_category")
            .cloned()
            .unwrap_or_else(|| json!("unknown")),
        "denial_reasons": facts
            .get("denial_reasons")
            .cloned()
            .unwrap_or_else(|| json!([])),
        "missing_docs_checklist": checklist,
        "analyzed_at": now_iso(),
    });

    store::save_denial_analysis(pool, &case.id, &analysis)
        .await
        .map_err(PipelineError::Storage)?;

    store::record_audit(
        pool,
        "analyze_denial",
        Some(&case.id),
        json!({ "checklist_items": checklist_items }),
    )
    .await;

    info!(case_id = %case.id, checklist_items, "analyzed denial");
    Ok(analysis)
}

// ============ Stage 4: draft generation ============

const DRAFT_SYSTEM_PROMPT: &str = "\
You are an administrative assistant for healthcare prior authorization and appeals. Draft a first-level appeal letter.

Hard rules:
- If information is missing, ask for it or list it as \"Missing\".
- Do not invent clinical facts, codes, dates, or policy criteria.
- Every policy-based claim must include a citation: [CITATION: PolicyName | EffectiveDate | Section/Page | ExcerptID]
- If you cannot find support in the retrieved policy text, say so and mark the draft \"Not reviewable\".
- Use a professional, concise tone suitable for payer appeals.

Return ONLY valid JSON with no markdown formatting.";

/// Stage 4: generate the appeal letter draft with citations.
///
/// The prompt redacts the patient name. An unparseable response still
/// completes the stage: the raw text becomes a non-reviewable letter body.
pub async fn generate_draft(
    pool: &SqlitePool,
    generator: &dyn GenerationProvider,
    case_id: &str,
) -> Result<Value, PipelineError> {
    run_draft_stage(pool, generator, case_id, "generate_draft").await
}

/// Re-run Stage 4 against the case's current facts and matches. No new
/// retrieval happens; only the generation call is repeated.
pub async fn regenerate_draft(
    pool: &SqlitePool,
    generator: &dyn GenerationProvider,
    case_id: &str,
) -> Result<Value, PipelineError> {
    run_draft_stage(pool, generator, case_id, "regenerate_draft").await
}

async fn run_draft_stage(
    pool: &SqlitePool,
    generator: &dyn GenerationProvider,
    case_id: &str,
    audit_action: &str,
) -> Result<Value, PipelineError> {
    let case = load_case(pool, case_id).await?;
    require_status(
        &case,
        CaseStatus::Analyzed,
        "The denial must be analyzed before a draft can be generated",
    )?;

    let facts = case_facts(&case);
    let matches = case_matches(&case);

    let excerpts: Vec<Value> = matches
        .iter()
        .take(5)
        .map(|m| {
            json!({
                "policy_name": m.get("policy_name").cloned().unwrap_or_else(|| json!("")),
                "effective_date": m.get("effective_date").cloned().unwrap_or_else(|| json!("")),
                "section": m.get("section").cloned().unwrap_or_else(|| json!("")),
                "page": m.get("page").cloned().unwrap_or_else(|| json!("")),
                "excerpt_id": m.get("excerpt_id").cloned().unwrap_or_else(|| json!("")),
                "text": truncate_chars(str_or(m, "text", ""), 500),
            })
        })
        .collect();

    let excerpts_json =
        serde_json::to_string_pretty(&excerpts).map_err(|e| PipelineError::Storage(e.into()))?;
    let case_json = serde_json::to_string_pretty(&json!({
        "payer": case.payer,
        "state": case.state,
        "cpt_codes": case.cpt_codes,
        "icd10_codes": case.icd10_codes,
        "patient_name": "[PATIENT NAME]",
        "extracted_facts": facts,
    }))
    .map_err(|e| PipelineError::Storage(e.into()))?;

    let user_prompt = format!(
        "\
Draft a first-level appeal letter using:
- the extracted case facts (CASE_JSON)
- the retrieved policy excerpts (POLICY_EXCERPTS)

Requirements:
- Address the denial reasons explicitly.
- Cite payer policy excerpts whenever you reference criteria or coverage rules.
- If the excerpts do not support the appeal, state that and mark \"Not reviewable\".
- Include:
  1) short executive summary
  2) case background (service requested, codes, dates)
  3) point-by-point response to denial reason(s)
  4) attachments checklist
  5) citations section listing each excerpt used

CASE_JSON:
{case_json}

POLICY_EXCERPTS:
{excerpts_json}

Return:
{{
  \"reviewable\": true/false,
  \"appeal_letter\": \"...\",
  \"attachments_checklist\": [\"...\"],
  \"citations_used\": [\"...\"]
}}",
    );

    let response = generator
        .generate(DRAFT_SYSTEM_PROMPT, &user_prompt)
        .await
        .map_err(PipelineError::Provider)?;

    let mut draft = match recover_json_object(&response) {
        Some(value) => value,
        None => {
            warn!(case_id = %case.id, "draft response was not parseable; marking not reviewable");
            json!({
                "reviewable": false,
                "appeal_letter": response,
                "attachments_checklist": [],
                "citations_used": [],
            })
        }
    };
    if let Some(obj) = draft.as_object_mut() {
        obj.insert("generated_at".to_string(), json!(now_iso()));
    }

    let reviewable = draft
        .get("reviewable")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    store::save_generated_draft(pool, &case.id, &draft)
        .await
        .map_err(PipelineError::Storage)?;

    store::record_audit(
        pool,
        audit_action,
        Some(&case.id),
        json!({ "model": generator.model_name(), "reviewable": reviewable }),
    )
    .await;

    info!(case_id = %case.id, reviewable, "generated appeal draft");
    Ok(draft)
}

// ============ Review ============

/// Mark a drafted case as reviewed by a human.
pub async fn review_case(pool: &SqlitePool, case_id: &str) -> Result<(), PipelineError> {
    let case = load_case(pool, case_id).await?;
    require_status(
        &case,
        CaseStatus::Drafted,
        "A draft must be generated before the case can be marked reviewed",
    )?;

    store::mark_reviewed(pool, &case.id)
        .await
        .map_err(PipelineError::Storage)?;

    store::record_audit(pool, "mark_reviewed", Some(&case.id), json!({})).await;

    info!(case_id = %case.id, "case marked reviewed");
    Ok(())
}
