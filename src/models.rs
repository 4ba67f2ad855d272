//! Core data models used throughout Appealdesk.
//!
//! These types represent the cases, documents, policies, and policy excerpts
//! that flow through the extraction, indexing, and drafting pipeline.

use serde::{Deserialize, Serialize};

/// Lifecycle of a case as it moves through the drafting pipeline.
///
/// Transitions are linear; each generation stage gates on the case having
/// reached the prior stage's state. Re-running an earlier stage moves the
/// case back to that stage's resulting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    New,
    FactsExtracted,
    PoliciesMatched,
    Analyzed,
    Drafted,
    Reviewed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::New => "new",
            CaseStatus::FactsExtracted => "facts_extracted",
            CaseStatus::PoliciesMatched => "policies_matched",
            CaseStatus::Analyzed => "analyzed",
            CaseStatus::Drafted => "drafted",
            CaseStatus::Reviewed => "reviewed",
        }
    }

    pub fn parse(s: &str) -> Option<CaseStatus> {
        match s {
            "new" => Some(CaseStatus::New),
            "facts_extracted" => Some(CaseStatus::FactsExtracted),
            "policies_matched" => Some(CaseStatus::PoliciesMatched),
            "analyzed" => Some(CaseStatus::Analyzed),
            "drafted" => Some(CaseStatus::Drafted),
            "reviewed" => Some(CaseStatus::Reviewed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            CaseStatus::New => 0,
            CaseStatus::FactsExtracted => 1,
            CaseStatus::PoliciesMatched => 2,
            CaseStatus::Analyzed => 3,
            CaseStatus::Drafted => 4,
            CaseStatus::Reviewed => 5,
        }
    }

    /// Whether this status is at or past `other` in the pipeline order.
    pub fn has_reached(&self, other: CaseStatus) -> bool {
        self.rank() >= other.rank()
    }
}

/// Declared kind of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    DenialLetter,
    ClinicalNotes,
    ImagingReport,
    PolicyFile,
    Other,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::DenialLetter => "denial_letter",
            DocumentKind::ClinicalNotes => "clinical_notes",
            DocumentKind::ImagingReport => "imaging_report",
            DocumentKind::PolicyFile => "policy_file",
            DocumentKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentKind> {
        match s {
            "denial_letter" => Some(DocumentKind::DenialLetter),
            "clinical_notes" => Some(DocumentKind::ClinicalNotes),
            "imaging_report" => Some(DocumentKind::ImagingReport),
            "policy_file" => Some(DocumentKind::PolicyFile),
            "other" => Some(DocumentKind::Other),
            _ => None,
        }
    }
}

/// An appeal case and its accumulated pipeline artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct Case {
    pub id: String,
    pub patient_name: String,
    pub payer: String,
    pub state: String,
    pub cpt_codes: Vec<String>,
    pub icd10_codes: Vec<String>,
    pub status: CaseStatus,
    pub reviewed: bool,
    pub reviewed_at: Option<i64>,
    pub extracted_facts: Option<serde_json::Value>,
    pub policy_matches: Option<serde_json::Value>,
    pub denial_analysis: Option<serde_json::Value>,
    pub generated_draft: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An uploaded document after one-time text extraction.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub case_id: String,
    pub kind: DocumentKind,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub text: String,
    pub created_at: i64,
}

/// A payer policy registered for retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub payer: String,
    pub state: String,
    pub effective_date: String,
    pub created_at: i64,
}

/// One retrievable excerpt of a policy, carrying denormalized citation
/// metadata so search results need no join.
#[derive(Debug, Clone)]
pub struct PolicyChunk {
    pub id: String,
    pub policy_id: String,
    pub policy_name: String,
    pub payer: String,
    pub state: String,
    pub effective_date: String,
    pub section: String,
    pub page: i64,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// A ranked retrieval hit. Ephemeral; persisted only when cached onto a
/// case's `policy_matches`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyHit {
    pub policy_id: String,
    pub policy_name: String,
    pub effective_date: String,
    pub section: String,
    pub page: i64,
    pub excerpt_id: String,
    pub text: String,
    pub score: f32,
}

/// One audit trail entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub case_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: i64,
}
