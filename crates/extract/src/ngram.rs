use crate::stopwords::is_stopword;

/// Inclusive n-gram length range for candidate generation.
#[derive(Debug, Clone, Copy)]
pub struct NgramRange {
  pub min: usize,
  pub max: usize,
}

impl Default for NgramRange {
  fn default() -> Self {
    Self { min: 1, max: 3 }
  }
}

/// Generate candidate keyphrases from chunk text.
///
/// Candidates are word n-grams whose boundary words are not stopwords
/// and which contain at least one alphabetic word. Order of first
/// appearance is preserved; duplicates collapse.
pub fn generate_candidates(text: &str, range: NgramRange) -> Vec<String> {
  let words: Vec<String> = text
    .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
    .filter(|w| !w.is_empty())
    .map(|w| w.to_lowercase())
    .collect();

  let mut seen = std::collections::HashSet::new();
  let mut candidates = Vec::new();

  for n in range.min..=range.max.max(range.min) {
    for window in words.windows(n) {
      if is_stopword(&window[0]) || is_stopword(&window[n - 1]) {
        continue;
      }
      if !window.iter().any(|w| w.chars().any(|c| c.is_alphabetic())) {
        continue;
      }
      // Single-character unigrams are noise
      if n == 1 && window[0].len() < 2 {
        continue;
      }

      let candidate = window.join(" ");
      if seen.insert(candidate.clone()) {
        candidates.push(candidate);
      }
    }
  }

  candidates
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unigram_candidates_skip_stopwords() {
    let candidates = generate_candidates("the revenue grew", NgramRange { min: 1, max: 1 });
    assert!(candidates.contains(&"revenue".to_string()));
    assert!(candidates.contains(&"grew".to_string()));
    assert!(!candidates.contains(&"the".to_string()));
  }

  #[test]
  fn test_ngram_boundaries_not_stopwords() {
    let candidates = generate_candidates("growth of revenue", NgramRange::default());
    // "growth of revenue" is allowed (interior stopword ok)
    assert!(candidates.contains(&"growth of revenue".to_string()));
    // but "of revenue" is not (stopword boundary)
    assert!(!candidates.contains(&"of revenue".to_string()));
  }

  #[test]
  fn test_numeric_only_filtered() {
    let candidates = generate_candidates("2024 2025", NgramRange { min: 1, max: 2 });
    assert!(candidates.is_empty());
  }

  #[test]
  fn test_dedup_preserves_order() {
    let candidates = generate_candidates("alpha beta alpha beta", NgramRange { min: 1, max: 1 });
    assert_eq!(candidates, vec!["alpha".to_string(), "beta".to_string()]);
  }

  #[test]
  fn test_empty_text() {
    assert!(generate_candidates("", NgramRange::default()).is_empty());
  }
}
