pub mod document;
pub mod keyphrase;
pub mod ngram;
pub mod readability;
pub mod stopwords;

pub use document::{IncrementalMean, select_document_keywords};
pub use keyphrase::{
  CHUNK_MMR_LAMBDA, fallback_keyphrases, mmr_select, score_candidates, select_keyphrases,
};
pub use ngram::{NgramRange, generate_candidates};
pub use readability::coleman_liau;
pub use stopwords::is_stopword;

/// Default maximum document-level keywords.
pub const MAX_DOCUMENT_KEYWORDS: usize = 30;
/// Minimum score for a document-level keyword.
pub const MIN_DOCUMENT_KEYWORD_SCORE: f32 = 0.3;
/// MMR diversity factor for document keywords.
pub const DOCUMENT_MMR_LAMBDA: f32 = 0.3;
