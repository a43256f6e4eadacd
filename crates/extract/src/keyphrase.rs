use foldex_core::KeyPhrase;
use std::collections::HashMap;

use crate::stopwords::is_stopword;

/// MMR diversity factor for per-chunk keyphrase selection.
pub const CHUNK_MMR_LAMBDA: f32 = 0.5;

fn cosine(a: &[f32], b: &[f32]) -> f32 {
  if a.is_empty() || a.len() != b.len() {
    return 0.0;
  }
  let mut dot = 0.0f32;
  let mut na = 0.0f32;
  let mut nb = 0.0f32;
  for (x, y) in a.iter().zip(b.iter()) {
    dot += x * y;
    na += x * x;
    nb += y * y;
  }
  let denom = na.sqrt() * nb.sqrt();
  if denom == 0.0 { 0.0 } else { dot / denom }
}

/// Cosine-score candidates against a target embedding, with an optional
/// boost for candidates appearing in structural hints (headings, lead
/// sentences supplied by the parser).
pub fn score_candidates(
  candidates: &[String],
  candidate_vectors: &[Vec<f32>],
  target: &[f32],
  hints: &[String],
) -> Vec<f32> {
  let hint_text = hints.join(" ").to_lowercase();
  candidates
    .iter()
    .zip(candidate_vectors.iter())
    .map(|(candidate, vector)| {
      let mut score = cosine(vector, target);
      if !hint_text.is_empty() && hint_text.contains(candidate.as_str()) {
        score *= 1.1;
      }
      score.clamp(-1.0, 1.0)
    })
    .collect()
}

/// Maximal Marginal Relevance selection.
///
/// Greedily picks `top_k` indices maximizing
/// `λ·relevance − (1−λ)·max-similarity-to-selected`.
pub fn mmr_select(relevance: &[f32], vectors: &[Vec<f32>], lambda: f32, top_k: usize) -> Vec<usize> {
  let n = relevance.len().min(vectors.len());
  if n == 0 || top_k == 0 {
    return Vec::new();
  }

  let mut selected: Vec<usize> = Vec::with_capacity(top_k.min(n));
  let mut remaining: Vec<usize> = (0..n).collect();

  while selected.len() < top_k && !remaining.is_empty() {
    let mut best_pos = 0;
    let mut best_score = f32::NEG_INFINITY;

    for (pos, &i) in remaining.iter().enumerate() {
      let redundancy = selected
        .iter()
        .map(|&j| cosine(&vectors[i], &vectors[j]))
        .fold(0.0f32, f32::max);
      let score = lambda * relevance[i] - (1.0 - lambda) * redundancy;
      if score > best_score {
        best_score = score;
        best_pos = pos;
      }
    }

    selected.push(remaining.swap_remove(best_pos));
  }

  selected
}

/// Score candidates and pick a diverse top-K for one chunk.
pub fn select_keyphrases(
  candidates: &[String],
  candidate_vectors: &[Vec<f32>],
  chunk_embedding: &[f32],
  hints: &[String],
  lambda: f32,
  top_k: usize,
) -> Vec<KeyPhrase> {
  let scores = score_candidates(candidates, candidate_vectors, chunk_embedding, hints);
  let picked = mmr_select(&scores, candidate_vectors, lambda, top_k);

  let mut phrases: Vec<KeyPhrase> = picked
    .into_iter()
    .map(|i| KeyPhrase {
      text: candidates[i].clone(),
      score: scores[i],
    })
    .collect();
  phrases.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
  phrases
}

/// Frequency-weighted fallback keyphrase generator.
///
/// Stop-worded bigrams and unigrams ranked by occurrence count; fills in
/// whenever the primary strategy returns nothing, so storage never holds
/// a chunk with zero phrases.
pub fn fallback_keyphrases(text: &str, top_k: usize) -> Vec<KeyPhrase> {
  let words: Vec<String> = text
    .split(|c: char| !(c.is_alphanumeric() || c == '-'))
    .filter(|w| w.len() >= 2)
    .map(|w| w.to_lowercase())
    .collect();

  let mut counts: HashMap<String, f32> = HashMap::new();

  for window in words.windows(2) {
    if is_stopword(&window[0]) || is_stopword(&window[1]) {
      continue;
    }
    // Bigrams carry more signal than either word alone
    *counts.entry(window.join(" ")).or_insert(0.0) += 1.5;
  }

  for word in &words {
    if is_stopword(word) || !word.chars().any(|c| c.is_alphabetic()) {
      continue;
    }
    *counts.entry(word.clone()).or_insert(0.0) += 1.0;
  }

  if counts.is_empty() {
    return Vec::new();
  }

  let max_count = counts.values().fold(0.0f32, |a, &b| a.max(b));
  let mut phrases: Vec<KeyPhrase> = counts
    .into_iter()
    .map(|(text, count)| KeyPhrase {
      text,
      score: count / max_count,
    })
    .collect();

  phrases.sort_by(|a, b| {
    b.score
      .partial_cmp(&a.score)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| a.text.cmp(&b.text))
  });
  phrases.truncate(top_k);
  phrases
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mmr_prefers_relevance_then_diversity() {
    // Two near-identical vectors and one orthogonal
    let vectors = vec![vec![1.0, 0.0], vec![0.99, 0.01], vec![0.0, 1.0]];
    let relevance = vec![0.9, 0.89, 0.5];

    let picked = mmr_select(&relevance, &vectors, 0.5, 2);
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0], 0);
    // Second pick should be the diverse one, not the near-duplicate
    assert_eq!(picked[1], 2);
  }

  #[test]
  fn test_mmr_handles_small_input() {
    assert!(mmr_select(&[], &[], 0.5, 3).is_empty());
    let picked = mmr_select(&[0.5], &[vec![1.0]], 0.5, 3);
    assert_eq!(picked, vec![0]);
  }

  #[test]
  fn test_select_keyphrases_sorted_by_score() {
    let candidates = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
    let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]];
    let target = vec![1.0, 0.0];

    let phrases = select_keyphrases(&candidates, &vectors, &target, &[], 0.5, 3);
    assert!(!phrases.is_empty());
    for pair in phrases.windows(2) {
      assert!(pair[0].score >= pair[1].score);
    }
    assert_eq!(phrases[0].text, "alpha");
  }

  #[test]
  fn test_hint_boost() {
    let candidates = vec!["budget".to_string()];
    let vectors = vec![vec![1.0, 0.0]];
    let target = vec![0.8, 0.2];

    let plain = score_candidates(&candidates, &vectors, &target, &[]);
    let boosted = score_candidates(&candidates, &vectors, &target, &["Annual budget".to_string()]);
    assert!(boosted[0] > plain[0]);
  }

  #[test]
  fn test_fallback_never_empty_for_real_text() {
    let phrases = fallback_keyphrases("revenue growth drove revenue growth expectations", 5);
    assert!(!phrases.is_empty());
    assert_eq!(phrases[0].text, "revenue growth");
    assert!((phrases[0].score - 1.0).abs() < 1e-6);
  }

  #[test]
  fn test_fallback_stopwords_only() {
    assert!(fallback_keyphrases("the and of to", 5).is_empty());
  }

  #[test]
  fn test_fallback_truncates() {
    let text = "alpha beta gamma delta epsilon zeta eta theta";
    let phrases = fallback_keyphrases(text, 3);
    assert_eq!(phrases.len(), 3);
  }
}
