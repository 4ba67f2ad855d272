//! Paragraph-boundary policy chunker.
//!
//! Splits policy text on blank lines. Short paragraphs act as section-header
//! candidates and are folded into the section label of the chunks that follow
//! them; everything else becomes one retrievable chunk tagged with the
//! current section and a coarse page estimate.

/// A paragraph trimming to fewer characters than this is a section-header
/// candidate, never a chunk.
const SECTION_HEADER_THRESHOLD: usize = 50;

/// Section labels are capped at this many characters.
const SECTION_LABEL_CAP: usize = 100;

/// Page estimate advances once per this many paragraphs. The count includes
/// header candidates and empty segments, and the bump is only applied when a
/// chunk-sized paragraph lands on the boundary.
const PARAGRAPHS_PER_PAGE: usize = 10;

/// Stored excerpt text cap.
const CHUNK_TEXT_CAP: usize = 2000;

/// Embeddings are computed over at most this many characters of a paragraph.
const EMBED_INPUT_CAP: usize = 1000;

/// One chunk-to-be: text plus positional metadata, before the indexer
/// attaches policy identity and an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub section: String,
    pub page: i64,
    pub text: String,
    pub embed_input: String,
}

/// Split policy content into ordered chunk drafts.
pub fn chunk_policy_text(content: &str) -> Vec<ChunkDraft> {
    let mut drafts = Vec::new();
    let mut current_section = "General".to_string();
    let mut page_num: i64 = 1;

    for (i, para) in content.split("\n\n").enumerate() {
        let trimmed = para.trim();
        if trimmed.chars().count() < SECTION_HEADER_THRESHOLD {
            if !trimmed.is_empty() {
                current_section = truncate_chars(trimmed, SECTION_LABEL_CAP);
            }
            continue;
        }

        if i > 0 && i % PARAGRAPHS_PER_PAGE == 0 {
            page_num += 1;
        }

        drafts.push(ChunkDraft {
            section: current_section.clone(),
            page: page_num,
            text: truncate_chars(para, CHUNK_TEXT_CAP),
            embed_input: truncate_chars(para, EMBED_INPUT_CAP),
        });
    }

    drafts
}

/// Truncate to at most `max` characters (not bytes), preserving the whole
/// string when it already fits.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
