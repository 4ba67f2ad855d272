//! Integration tests for the retrieval index and the staged drafting
//! pipeline.
//!
//! These run against a real temporary SQLite database with deterministic
//! in-memory providers: a vocabulary-count embedder whose cosine rankings
//! can be predicted by hand, and a scripted generator that replays queued
//! responses while recording every prompt it was given.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Mutex;
use tempfile::TempDir;

use appealdesk::config::Config;
use appealdesk::embedding::EmbeddingProvider;
use appealdesk::indexer;
use appealdesk::llm::GenerationProvider;
use appealdesk::models::{Case, CaseStatus, DocumentKind, Policy};
use appealdesk::pipeline::{self, PipelineError};
use appealdesk::search;
use appealdesk::{db, migrate, store};

// ─── Test Providers ─────────────────────────────────────────────────

/// Words the test embedder can see. Each embedding dimension is the number
/// of occurrences of one vocabulary word, so cosine rankings follow word
/// overlap exactly.
const VOCAB: &[&str] = &[
    "imaging",
    "mri",
    "authorization",
    "necessity",
    "conservative",
    "equipment",
    "cpap",
    "prescription",
    "criteria",
    "appeal",
    "documentation",
    "oxygen",
];

struct VocabEmbedder;

#[async_trait]
impl EmbeddingProvider for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab-test"
    }

    fn dims(&self) -> usize {
        VOCAB.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                VOCAB
                    .iter()
                    .map(|w| lower.matches(w).count() as f32)
                    .collect()
            })
            .collect())
    }
}

/// Replays queued responses in order and records every (system, user)
/// prompt pair it receives.
struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    fn new(responses: &[&str]) -> Self {
        ScriptedGenerator {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn last_user_prompt(&self) -> String {
        self.calls
            .lock()
            .unwrap()
            .last()
            .map(|(_, user)| user.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_prompt.to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted response queued"))
    }
}

struct FailingGenerator;

#[async_trait]
impl GenerationProvider for FailingGenerator {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        anyhow::bail!("connection refused")
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

const IMAGING_POLICY_TEXT: &str = "\
Section 1: Imaging Criteria

Advanced imaging such as MRI requires prior authorization and documented \
medical necessity. Conservative treatment must be documented before imaging \
approval.

Section 2: Appeals

Appeals of imaging denials must include clinical documentation supporting \
medical necessity and the authorization history for the imaging service.";

const DME_POLICY_TEXT: &str = "\
Section A: Equipment Coverage

Durable medical equipment coverage criteria require a prescription from the \
treating physician and documentation of need for the equipment.

Section B: CPAP Rules

CPAP equipment coverage requires a documented sleep study and a prescription \
for the cpap equipment issued by the treating physician.";

fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("apd.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

[embedding]
provider = "disabled"
"#,
        db_path.display()
    );
    toml::from_str(&config_content).unwrap()
}

async fn setup_pool(tmp: &TempDir) -> SqlitePool {
    let cfg = test_config(tmp);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

async fn indexed_policy(
    pool: &SqlitePool,
    name: &str,
    payer: &str,
    state: &str,
    content: &str,
) -> Policy {
    let policy = store::upsert_policy(pool, name, payer, state, "2024-01-01")
        .await
        .unwrap();
    indexer::reindex_policy(pool, &VocabEmbedder, 16, &policy, content)
        .await
        .unwrap();
    policy
}

async fn make_case(pool: &SqlitePool, payer: &str, state: &str, cpt_codes: &[&str]) -> Case {
    let codes: Vec<String> = cpt_codes.iter().map(|s| s.to_string()).collect();
    store::create_case(pool, "Pat Doe", payer, state, &codes, &[])
        .await
        .unwrap()
}

async fn add_denial_letter(pool: &SqlitePool, case_id: &str, text: &str) {
    store::insert_document(
        pool,
        case_id,
        DocumentKind::DenialLetter,
        "denial.txt",
        "text/plain",
        text.len() as i64,
        text,
    )
    .await
    .unwrap();
}

async fn reload(pool: &SqlitePool, case_id: &str) -> Case {
    store::get_case(pool, case_id).await.unwrap().unwrap()
}

async fn chunk_count(pool: &SqlitePool, policy_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM policy_chunks WHERE policy_id = ?")
        .bind(policy_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Scripted Stage 1 response wrapped in the prose and fences a chat model
/// tends to produce.
const FACTS_RESPONSE: &str = r#"Here is the extracted data:
```json
{
  "payer_name": "Blue Cross Blue Shield",
  "denial_reasons": ["conservative treatment not documented", "clinical notes missing"],
  "denial_reason_category": "medical_necessity",
  "requested_service": "MRI of the lumbar spine",
  "CPT_HCPCS_codes": ["72148"],
  "ICD10_codes": ["M54.5"]
}
```
Let me know if you need anything else."#;

const CHECKLIST_RESPONSE: &str = r#"[
  {
    "item": "Clinical notes supporting medical necessity",
    "required_by_policy_citation": "[CITATION: Test Imaging Policy | Section 1: Imaging Criteria | Page 1]",
    "status": "Missing",
    "notes": "No clinical notes were uploaded"
  },
  {
    "item": "Conservative therapy documentation",
    "required_by_policy_citation": "[CITATION: Test Imaging Policy | Section 1: Imaging Criteria | Page 1]",
    "status": "Missing",
    "notes": "Policy requires six weeks of conservative treatment"
  }
]"#;

const DRAFT_RESPONSE: &str = r#"{
  "reviewable": true,
  "appeal_letter": "Dear Appeals Committee,\n\nWe are appealing the denial of MRI services. Conservative treatment has been completed as required [CITATION: Test Imaging Policy | 2024-01-01 | Section 1: Imaging Criteria/Page 1 | excerpt].\n\nSincerely",
  "attachments_checklist": ["Clinical notes", "Conservative therapy log"],
  "citations_used": ["[CITATION: Test Imaging Policy | 2024-01-01 | Section 1: Imaging Criteria/Page 1 | excerpt]"]
}"#;

const REDRAFT_RESPONSE: &str = r#"{
  "reviewable": true,
  "appeal_letter": "Dear Appeals Committee,\n\nSecond revision of the appeal.\n\nSincerely",
  "attachments_checklist": ["Clinical notes"],
  "citations_used": []
}"#;

// ─── Retrieval ──────────────────────────────────────────────────────

/// Re-indexing a policy replaces its excerpt set instead of appending, and
/// keeps the policy id stable across upserts of the same (name, payer,
/// state).
#[tokio::test]
async fn test_reindex_replaces_previous_excerpts() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    let policy = indexed_policy(
        &pool,
        "Test Imaging Policy",
        "Blue Cross Blue Shield",
        "CA",
        IMAGING_POLICY_TEXT,
    )
    .await;
    assert_eq!(chunk_count(&pool, &policy.id).await, 2);

    let replacement = "\
First replacement paragraph with enough text to be stored as a chunk of policy content.

Second replacement paragraph with enough text to be stored as a chunk of policy content.

Third replacement paragraph with enough text to be stored as a chunk of policy content.";

    let again = store::upsert_policy(
        &pool,
        "Test Imaging Policy",
        "Blue Cross Blue Shield",
        "CA",
        "2025-06-01",
    )
    .await
    .unwrap();
    assert_eq!(again.id, policy.id);
    assert_eq!(again.effective_date, "2025-06-01");

    let written = indexer::reindex_policy(&pool, &VocabEmbedder, 16, &again, replacement)
        .await
        .unwrap();
    assert_eq!(written, 3);
    assert_eq!(chunk_count(&pool, &policy.id).await, 3);
}

/// The section whose text shares the most query vocabulary ranks first, and
/// its stored text carries the policy's wording verbatim.
#[tokio::test]
async fn test_search_ranks_matching_section_first() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    indexed_policy(
        &pool,
        "Test Imaging Policy",
        "Blue Cross Blue Shield",
        "CA",
        IMAGING_POLICY_TEXT,
    )
    .await;
    indexed_policy(&pool, "Test DME Policy", "Aetna", "NY", DME_POLICY_TEXT).await;

    let hits = search::search_policies(
        &pool,
        &VocabEmbedder,
        "mri conservative treatment",
        None,
        None,
        5,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].policy_name, "Test Imaging Policy");
    assert_eq!(hits[0].section, "Section 1: Imaging Criteria");
    assert!(hits[0]
        .text
        .contains("Conservative treatment must be documented"));
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score, "scores must be descending");
    }
}

/// Payer and state filters are case-insensitive substring matches, and `k`
/// caps the result count.
#[tokio::test]
async fn test_search_filters_and_k() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    indexed_policy(
        &pool,
        "Test Imaging Policy",
        "Blue Cross Blue Shield",
        "CA",
        IMAGING_POLICY_TEXT,
    )
    .await;
    indexed_policy(&pool, "Test DME Policy", "Aetna", "NY", DME_POLICY_TEXT).await;

    let hits = search::search_policies(
        &pool,
        &VocabEmbedder,
        "prescription equipment",
        Some("aetna"),
        None,
        5,
    )
    .await
    .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.policy_name == "Test DME Policy"));

    let hits = search::search_policies(
        &pool,
        &VocabEmbedder,
        "prescription equipment",
        Some("aetna"),
        None,
        1,
    )
    .await
    .unwrap();
    assert_eq!(hits.len(), 1);

    let hits = search::search_policies(
        &pool,
        &VocabEmbedder,
        "imaging authorization",
        Some("Blue Cross"),
        Some("ca"),
        5,
    )
    .await
    .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.policy_name == "Test Imaging Policy"));
}

/// The policy-file upload flow: extract the bytes, store the document on
/// the case, register the policy under the case's payer and state, and
/// index the extracted text. The new excerpts are immediately searchable.
#[tokio::test]
async fn test_policy_file_upload_flow_indexes_chunks() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Blue Cross Blue Shield", "CA", &[]).await;

    let bytes = IMAGING_POLICY_TEXT.as_bytes().to_vec();
    let kind = appealdesk::extract::SourceKind::detect("text/plain", "imaging_policy.txt");
    let text = appealdesk::extract::extract_text_blocking(
        bytes,
        kind,
        appealdesk::config::OcrConfig::default(),
    )
    .await;

    store::insert_document(
        &pool,
        &case.id,
        DocumentKind::PolicyFile,
        "imaging_policy.txt",
        "text/plain",
        text.len() as i64,
        &text,
    )
    .await
    .unwrap();

    let policy = store::upsert_policy(
        &pool,
        "imaging_policy.txt",
        &case.payer,
        &case.state,
        "",
    )
    .await
    .unwrap();
    let written = indexer::reindex_policy(&pool, &VocabEmbedder, 16, &policy, &text)
        .await
        .unwrap();
    assert_eq!(written, 2);

    let hits = search::search_policies(
        &pool,
        &VocabEmbedder,
        "mri authorization",
        Some(&case.payer),
        Some(&case.state),
        5,
    )
    .await
    .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].policy_name, "imaging_policy.txt");
    assert_eq!(hits[0].policy_id, policy.id);
}

/// An empty corpus yields an empty result, not an error.
#[tokio::test]
async fn test_search_empty_corpus_returns_empty() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    let hits = search::search_policies(&pool, &VocabEmbedder, "anything", None, None, 5)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

// ─── Full pipeline flow ─────────────────────────────────────────────

/// Walk one case through every stage: extraction, policy matching, denial
/// analysis, drafting, regeneration, and review. Asserts artifact shapes,
/// status transitions, prompt contents, and the audit trail along the way.
#[tokio::test]
async fn test_full_pipeline_flow() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    indexed_policy(
        &pool,
        "Test Imaging Policy",
        "Blue Cross Blue Shield",
        "CA",
        IMAGING_POLICY_TEXT,
    )
    .await;

    let case = make_case(&pool, "Blue Cross Blue Shield", "CA", &["72148"]).await;
    add_denial_letter(
        &pool,
        &case.id,
        "Your MRI of the lumbar spine has been denied. Conservative treatment was not documented.",
    )
    .await;

    let generator = ScriptedGenerator::new(&[
        FACTS_RESPONSE,
        CHECKLIST_RESPONSE,
        DRAFT_RESPONSE,
        REDRAFT_RESPONSE,
    ]);

    // Stage 1: extraction
    let facts = pipeline::extract_facts(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(facts["requested_service"], "MRI of the lumbar spine");
    assert_eq!(facts["denial_reason_category"], "medical_necessity");
    assert!(facts.get("error").is_none());

    let prompt = generator.last_user_prompt();
    assert!(prompt.contains("Your MRI of the lumbar spine has been denied"));
    assert!(prompt.contains("CLINICAL NOTES:\nNot provided"));

    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::FactsExtracted);
    assert_eq!(case_now.extracted_facts, Some(facts.clone()));

    // Stage 2: policy matching
    let matches = pipeline::match_policies(&pool, &VocabEmbedder, &case.id, 5)
        .await
        .unwrap();
    let match_list = matches.as_array().unwrap();
    assert!(!match_list.is_empty());
    assert_eq!(match_list[0]["policy_name"], "Test Imaging Policy");
    assert_eq!(match_list[0]["section"], "Section 1: Imaging Criteria");
    assert!(match_list[0]["excerpt_id"].as_str().is_some());
    assert!(match_list[0]["score"].as_f64().is_some());

    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::PoliciesMatched);

    // Stage 3: denial analysis
    let analysis = pipeline::analyze_denial(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(analysis["denial_category"], "medical_necessity");
    assert_eq!(
        analysis["denial_reasons"],
        json!(["conservative treatment not documented", "clinical notes missing"])
    );
    assert_eq!(
        analysis["missing_docs_checklist"][0]["item"],
        "Clinical notes supporting medical necessity"
    );
    assert!(analysis["analyzed_at"].as_str().is_some());

    let prompt = generator.last_user_prompt();
    assert!(prompt.contains("[Test Imaging Policy | Section 1: Imaging Criteria | Page 1]:"));

    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::Analyzed);

    // Stage 4: draft generation
    let draft = pipeline::generate_draft(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(draft["reviewable"], true);
    assert!(draft["appeal_letter"]
        .as_str()
        .unwrap()
        .contains("[CITATION: Test Imaging Policy"));
    assert!(draft["generated_at"].as_str().is_some());

    // The drafting prompt redacts the patient's name.
    let prompt = generator.last_user_prompt();
    assert!(prompt.contains("[PATIENT NAME]"));
    assert!(!prompt.contains("Pat Doe"));
    assert!(prompt.contains("POLICY_EXCERPTS:"));

    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::Drafted);

    // Regeneration calls the provider again but performs no new retrieval.
    let calls_before = generator.call_count();
    let matches_before = reload(&pool, &case.id).await.policy_matches;
    let redraft = pipeline::regenerate_draft(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(generator.call_count(), calls_before + 1);
    assert!(redraft["appeal_letter"]
        .as_str()
        .unwrap()
        .contains("Second revision"));
    assert_eq!(reload(&pool, &case.id).await.policy_matches, matches_before);

    // Review
    pipeline::review_case(&pool, &case.id).await.unwrap();
    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::Reviewed);
    assert!(case_now.reviewed);
    assert!(case_now.reviewed_at.is_some());

    // Every stage landed in the audit trail.
    let entries = store::list_audit(&pool, Some(&case.id)).await.unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    for action in [
        "extract_facts",
        "match_policies",
        "analyze_denial",
        "generate_draft",
        "regenerate_draft",
        "mark_reviewed",
    ] {
        assert!(actions.contains(&action), "missing audit action {}", action);
    }

    // The matching audit entry records the query built from facts and codes.
    let match_entry = entries
        .iter()
        .find(|e| e.action == "match_policies")
        .unwrap();
    let query = match_entry.details["query"].as_str().unwrap();
    assert!(query.contains("MRI of the lumbar spine"));
    assert!(query.contains("72148"));
}

// ─── Stage gating ───────────────────────────────────────────────────

/// Each stage refuses to run until the case has reached the prior stage's
/// state.
#[tokio::test]
async fn test_stage_order_is_enforced() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Aetna", "NY", &[]).await;
    let generator = ScriptedGenerator::new(&[]);

    let err = pipeline::match_policies(&pool, &VocabEmbedder, &case.id, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
    assert!(err.to_string().contains("Facts must be extracted"));

    let err = pipeline::analyze_denial(&pool, &generator, &case.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    let err = pipeline::generate_draft(&pool, &generator, &case.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    let err = pipeline::review_case(&pool, &case.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    // Nothing ever reached the generator.
    assert_eq!(generator.call_count(), 0);
}

/// Extraction without a denial letter fails the precondition and leaves the
/// case untouched.
#[tokio::test]
async fn test_extract_requires_denial_letter() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Aetna", "NY", &[]).await;
    let generator = ScriptedGenerator::new(&[FACTS_RESPONSE]);

    let err = pipeline::extract_facts(&pool, &generator, &case.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
    assert!(err.to_string().contains("denial letter"));
    assert_eq!(generator.call_count(), 0);

    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::New);
    assert!(case_now.extracted_facts.is_none());
}

/// Unknown case ids map to the not-found error, not a storage fault.
#[tokio::test]
async fn test_unknown_case_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let generator = ScriptedGenerator::new(&[]);

    let err = pipeline::extract_facts(&pool, &generator, "no-such-case")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CaseNotFound(_)));
}

// ─── Degraded provider output ───────────────────────────────────────

/// A response with no recoverable JSON object still produces a persisted
/// artifact carrying the diagnostic marker and the raw response.
#[tokio::test]
async fn test_extract_degrades_on_unparseable_response() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Aetna", "NY", &[]).await;
    add_denial_letter(&pool, &case.id, "Coverage for CPAP equipment is denied.").await;

    let generator = ScriptedGenerator::new(&["I could not read the documents, sorry."]);
    let facts = pipeline::extract_facts(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(facts["error"], "Could not parse extraction");
    assert_eq!(
        facts["raw_response"],
        "I could not read the documents, sorry."
    );

    // The degraded artifact is persisted and the stage still advances.
    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::FactsExtracted);
    assert_eq!(case_now.extracted_facts.unwrap()["error"], facts["error"]);

    // Braces that balance but hold invalid JSON get the other marker.
    let generator = ScriptedGenerator::new(&["{not valid json}"]);
    let facts = pipeline::extract_facts(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(facts["error"], "Invalid JSON in response");
}

/// An unparseable checklist response degrades to a single Unknown item.
#[tokio::test]
async fn test_analysis_degrades_on_unparseable_checklist() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Aetna", "NY", &[]).await;

    store::save_extracted_facts(&pool, &case.id, &json!({ "denial_reason_category": "other" }))
        .await
        .unwrap();
    store::save_policy_matches(&pool, &case.id, &json!([]))
        .await
        .unwrap();

    let generator = ScriptedGenerator::new(&["There is nothing I can do here."]);
    let analysis = pipeline::analyze_denial(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(
        analysis["missing_docs_checklist"][0]["item"],
        "Unable to generate checklist"
    );
    assert_eq!(analysis["missing_docs_checklist"][0]["status"], "Unknown");
    assert_eq!(analysis["denial_category"], "other");

    // With no cached matches the prompt says so instead of going empty.
    assert!(generator
        .last_user_prompt()
        .contains("No matching policies found"));

    assert_eq!(reload(&pool, &case.id).await.status, CaseStatus::Analyzed);
}

/// A draft response with no recoverable JSON is kept as the letter body but
/// marked not reviewable.
#[tokio::test]
async fn test_unparseable_draft_marked_not_reviewable() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Aetna", "NY", &[]).await;

    store::save_extracted_facts(&pool, &case.id, &json!({}))
        .await
        .unwrap();
    store::save_policy_matches(&pool, &case.id, &json!([]))
        .await
        .unwrap();
    store::save_denial_analysis(&pool, &case.id, &json!({ "denial_category": "other" }))
        .await
        .unwrap();

    let letter = "Dear Appeals Committee, we respectfully disagree with the denial.";
    let generator = ScriptedGenerator::new(&[letter]);
    let draft = pipeline::generate_draft(&pool, &generator, &case.id)
        .await
        .unwrap();

    assert_eq!(draft["reviewable"], false);
    assert_eq!(draft["appeal_letter"], letter);
    assert_eq!(draft["attachments_checklist"], json!([]));
    assert_eq!(draft["citations_used"], json!([]));
    assert!(draft["generated_at"].as_str().is_some());

    assert_eq!(reload(&pool, &case.id).await.status, CaseStatus::Drafted);
}

/// Generator failures surface as provider errors and leave the case's
/// artifacts untouched.
#[tokio::test]
async fn test_provider_failure_leaves_case_untouched() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Aetna", "NY", &[]).await;
    add_denial_letter(&pool, &case.id, "Oxygen equipment request denied.").await;

    let err = pipeline::extract_facts(&pool, &FailingGenerator, &case.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Provider(_)));
    assert!(err.to_string().contains("Provider error"));

    let case_now = reload(&pool, &case.id).await;
    assert_eq!(case_now.status, CaseStatus::New);
    assert!(case_now.extracted_facts.is_none());
}

// ─── Query building ─────────────────────────────────────────────────

/// When extraction produced nothing usable, matching falls back to a payer
/// query instead of an empty one.
#[tokio::test]
async fn test_match_falls_back_to_payer_query() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    indexed_policy(&pool, "Test DME Policy", "Aetna", "NY", DME_POLICY_TEXT).await;

    let case = make_case(&pool, "Aetna", "NY", &[]).await;
    store::save_extracted_facts(&pool, &case.id, &json!({}))
        .await
        .unwrap();

    let matches = pipeline::match_policies(&pool, &VocabEmbedder, &case.id, 5)
        .await
        .unwrap();
    assert_eq!(matches.as_array().unwrap().len(), 2);

    let entries = store::list_audit(&pool, Some(&case.id)).await.unwrap();
    let match_entry = entries
        .iter()
        .find(|e| e.action == "match_policies")
        .unwrap();
    assert_eq!(match_entry.details["query"], "Aetna coverage criteria");
}

/// Retrieval that finds nothing is a valid stage outcome: the case advances
/// with an empty match list.
#[tokio::test]
async fn test_match_with_no_corpus_stores_empty_list() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;

    let case = make_case(&pool, "Blue Cross Blue Shield", "CA", &["72148"]).await;
    store::save_extracted_facts(&pool, &case.id, &json!({ "requested_service": "MRI" }))
        .await
        .unwrap();

    let matches = pipeline::match_policies(&pool, &VocabEmbedder, &case.id, 5)
        .await
        .unwrap();
    assert_eq!(matches, json!([]));
    assert_eq!(
        reload(&pool, &case.id).await.status,
        CaseStatus::PoliciesMatched
    );
}

// ─── Stage re-runs ──────────────────────────────────────────────────

/// Re-running an earlier stage rewinds the status to that stage's result
/// state, so downstream stages must be re-run in order.
#[tokio::test]
async fn test_rerunning_extraction_rewinds_status() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(&tmp).await;
    let case = make_case(&pool, "Blue Cross Blue Shield", "CA", &[]).await;
    add_denial_letter(&pool, &case.id, "MRI imaging request denied for documentation.").await;

    store::save_extracted_facts(&pool, &case.id, &json!({}))
        .await
        .unwrap();
    store::save_policy_matches(&pool, &case.id, &json!([]))
        .await
        .unwrap();
    store::save_denial_analysis(&pool, &case.id, &json!({}))
        .await
        .unwrap();
    assert_eq!(reload(&pool, &case.id).await.status, CaseStatus::Analyzed);

    let generator = ScriptedGenerator::new(&[FACTS_RESPONSE]);
    pipeline::extract_facts(&pool, &generator, &case.id)
        .await
        .unwrap();
    assert_eq!(
        reload(&pool, &case.id).await.status,
        CaseStatus::FactsExtracted
    );

    // Drafting now requires analysis again.
    let err = pipeline::generate_draft(&pool, &generator, &case.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
}
