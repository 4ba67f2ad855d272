//! Demo corpus loader.
//!
//! Registers two payer policies (indexed when embeddings are enabled) and
//! three cases with denial letters, so a fresh install can exercise every
//! pipeline stage without real uploads. Safe to re-run.

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::config::Config;
use crate::embedding;
use crate::indexer;
use crate::models::DocumentKind;
use crate::{db, migrate, store};

const BCBS_CA_POLICY: &str = "\
BLUE CROSS BLUE SHIELD - CALIFORNIA
Medical Policy: Prior Authorization for Advanced Imaging

Section 1: Coverage Criteria
MRI and CT scans require prior authorization for the following conditions:
- Musculoskeletal imaging beyond initial X-ray
- Neurological imaging without acute presentation
- Cardiac imaging for non-emergent evaluation

Section 2: Documentation Requirements
All requests must include:
1. Clinical notes supporting medical necessity
2. Previous imaging results if applicable
3. Treatment history and conservative therapy documentation
4. Specific CPT codes and ICD-10 diagnosis codes

Section 3: Medical Necessity Criteria
Coverage is approved when:
- Conservative treatment has failed (minimum 6 weeks)
- Clinical examination supports need for advanced imaging
- Imaging will change treatment plan

Section 4: Appeals Process
First-level appeals must be submitted within 60 days of denial.
Include additional clinical documentation supporting medical necessity.";

const AETNA_NY_POLICY: &str = "\
AETNA - NEW YORK
Clinical Policy Bulletin: Durable Medical Equipment

Section A: Coverage Guidelines
DME is covered when:
- Prescribed by treating physician
- Medically necessary for treatment
- Used in patient's home setting

Section B: Prior Authorization Requirements
The following DME categories require PA:
- Power wheelchairs and scooters
- Hospital beds
- Oxygen equipment
- CPAP/BiPAP devices

Section C: Documentation Standards
Submit with PA request:
1. Physician's prescription
2. Clinical notes demonstrating need
3. Previous equipment usage history
4. Patient mobility assessment (for wheelchairs)

Section D: Denial Appeals
Appeals must include:
- Letter of medical necessity from physician
- Additional clinical evidence
- Peer-reviewed literature supporting coverage";

const SMITH_DENIAL_LETTER: &str = "\
BLUE CROSS BLUE SHIELD OF CALIFORNIA
Claims Review Department

Date: 2024-03-18
Member: John Smith
Member ID: XDP881234567
Claim Number: 2024-078-114532
Date of Service: 2024-03-02
Provider: Valley Spine and Orthopedic Group

RE: DENIAL OF COVERAGE - MRI LUMBAR SPINE WITHOUT CONTRAST (CPT 72148)

Dear Member,

After review of the claim listed above, we are unable to approve coverage
for the requested service. The request does not meet the medical necessity
criteria in our medical policy for advanced imaging.

Reason for denial:
- Documentation does not demonstrate that conservative treatment was
  attempted and failed for a minimum of 6 weeks prior to imaging.
- Clinical notes supporting medical necessity were not included with the
  request.

Diagnosis on file: M54.5 (Low back pain)

You have the right to appeal this decision. First-level appeals must be
submitted within 60 days of the date of this letter and should include
additional clinical documentation supporting medical necessity.

Sincerely,
Medical Review Unit
Blue Cross Blue Shield of California";

const DOE_DENIAL_LETTER: &str = "\
AETNA
Clinical Claims Review

Date: 2024-04-09
Member: Jane Doe
Member ID: W224409187
Reference Number: DME-2024-55102
Date of Service: 2024-03-28
Provider: Hudson Home Medical Supply

RE: DENIAL OF PRIOR AUTHORIZATION - OXYGEN CONCENTRATOR (HCPCS E1390)

Dear Member,

We have completed our review of the prior authorization request for durable
medical equipment and are unable to approve it at this time.

Reason for denial:
- The request did not include a physician's prescription as required by our
  documentation standards.
- Clinical notes demonstrating medical need for home oxygen equipment were
  not submitted.

Diagnosis on file: G47.33 (Obstructive sleep apnea)

To appeal this determination, submit a letter of medical necessity from the
treating physician along with additional clinical evidence supporting
coverage.

Sincerely,
Clinical Review Team
Aetna";

const JOHNSON_DENIAL_LETTER: &str = "\
BLUE CROSS BLUE SHIELD OF CALIFORNIA
Claims Review Department

Date: 2024-05-22
Member: Robert Johnson
Member ID: XDP883310905
Claim Number: 2024-142-009871
Date of Service: 2024-05-06
Provider: Bayside Neurology Associates

RE: DENIAL OF COVERAGE - MRI BRAIN WITH AND WITHOUT CONTRAST (CPT 70553)

Dear Member,

Coverage for the service listed above has been denied following medical
review. Neurological imaging without acute presentation requires prior
authorization and must meet the medical necessity criteria in our policy.

Reason for denial:
- No acute neurological findings were documented at the time of the
  request.
- The record does not show that imaging results would change the treatment
  plan.

Diagnosis on file: G43.909 (Migraine, unspecified)

First-level appeals must be submitted within 60 days of denial and should
include additional clinical documentation supporting medical necessity.

Sincerely,
Medical Review Unit
Blue Cross Blue Shield of California";

struct DemoPolicy {
    name: &'static str,
    payer: &'static str,
    state: &'static str,
    content: &'static str,
}

struct DemoCase {
    patient_name: &'static str,
    payer: &'static str,
    state: &'static str,
    cpt_codes: &'static [&'static str],
    icd10_codes: &'static [&'static str],
    letter_filename: &'static str,
    letter: &'static str,
}

const DEMO_POLICIES: &[DemoPolicy] = &[
    DemoPolicy {
        name: "Blue Cross Blue Shield - CA Policy",
        payer: "Blue Cross Blue Shield",
        state: "CA",
        content: BCBS_CA_POLICY,
    },
    DemoPolicy {
        name: "Aetna - NY Policy",
        payer: "Aetna",
        state: "NY",
        content: AETNA_NY_POLICY,
    },
];

const DEMO_CASES: &[DemoCase] = &[
    DemoCase {
        patient_name: "John Smith",
        payer: "Blue Cross Blue Shield",
        state: "CA",
        cpt_codes: &["72148"],
        icd10_codes: &["M54.5"],
        letter_filename: "denial_letter_smith.txt",
        letter: SMITH_DENIAL_LETTER,
    },
    DemoCase {
        patient_name: "Jane Doe",
        payer: "Aetna",
        state: "NY",
        cpt_codes: &["E1390"],
        icd10_codes: &["G47.33"],
        letter_filename: "denial_letter_doe.txt",
        letter: DOE_DENIAL_LETTER,
    },
    DemoCase {
        patient_name: "Robert Johnson",
        payer: "Blue Cross Blue Shield",
        state: "CA",
        cpt_codes: &["70553"],
        icd10_codes: &["G43.909"],
        letter_filename: "denial_letter_johnson.txt",
        letter: JOHNSON_DENIAL_LETTER,
    },
];

/// CLI entry point: load the demo corpus.
///
/// Policies reindex on every run (replacing their excerpt sets), so repeated
/// seeding never accumulates duplicates. Demo cases are created once; when
/// they already exist the command reports that and leaves them alone.
pub async fn run_seed(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let embedder = if config.embedding.is_enabled() {
        Some(embedding::create_provider(&config.embedding)?)
    } else {
        warn!("embedding provider is disabled; demo policies will not be indexed");
        None
    };

    for demo in DEMO_POLICIES {
        let policy =
            store::upsert_policy(&pool, demo.name, demo.payer, demo.state, "2024-01-01").await?;
        match &embedder {
            Some(provider) => {
                let chunks = indexer::reindex_policy(
                    &pool,
                    provider.as_ref(),
                    config.embedding.batch_size,
                    &policy,
                    demo.content,
                )
                .await?;
                store::record_audit(
                    &pool,
                    "index_policy",
                    None,
                    json!({ "policy_id": policy.id, "chunks": chunks }),
                )
                .await;
                println!("Indexed policy: {} ({} excerpts)", policy.name, chunks);
            }
            None => println!("Registered policy: {} (not indexed)", policy.name),
        }
    }

    let existing = store::list_cases(&pool).await?;
    if existing
        .iter()
        .any(|c| DEMO_CASES.iter().any(|d| d.patient_name == c.patient_name))
    {
        println!("Demo cases already seeded.");
        pool.close().await;
        return Ok(());
    }

    for demo in DEMO_CASES {
        let cpt_codes: Vec<String> = demo.cpt_codes.iter().map(|s| s.to_string()).collect();
        let icd10_codes: Vec<String> = demo.icd10_codes.iter().map(|s| s.to_string()).collect();

        let case = store::create_case(
            &pool,
            demo.patient_name,
            demo.payer,
            demo.state,
            &cpt_codes,
            &icd10_codes,
        )
        .await?;
        store::record_audit(
            &pool,
            "create_case",
            Some(&case.id),
            json!({ "payer": case.payer, "state": case.state }),
        )
        .await;

        store::insert_document(
            &pool,
            &case.id,
            DocumentKind::DenialLetter,
            demo.letter_filename,
            "text/plain",
            demo.letter.len() as i64,
            demo.letter,
        )
        .await?;
        store::record_audit(
            &pool,
            "upload_document",
            Some(&case.id),
            json!({
                "kind": DocumentKind::DenialLetter.as_str(),
                "filename": demo.letter_filename,
                "size_bytes": demo.letter.len(),
            }),
        )
        .await;

        println!("Created case: {} ({})", demo.patient_name, case.id);
    }

    println!(
        "Seeded {} policies and {} demo cases.",
        DEMO_POLICIES.len(),
        DEMO_CASES.len()
    );

    pool.close().await;
    Ok(())
}
