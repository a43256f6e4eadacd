//! Document-level aggregation: the running mean of chunk embeddings and
//! the cross-chunk keyword pool.

use foldex_core::KeyPhrase;

use crate::keyphrase::mmr_select;

/// Incremental mean of chunk embeddings. Dimension is fixed by the first
/// vector added; mismatched vectors are ignored.
#[derive(Debug, Default, Clone)]
pub struct IncrementalMean {
  sum: Vec<f32>,
  count: usize,
}

impl IncrementalMean {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, vector: &[f32]) {
    if self.sum.is_empty() {
      self.sum = vector.to_vec();
      self.count = 1;
      return;
    }
    if vector.len() != self.sum.len() {
      return;
    }
    for (s, v) in self.sum.iter_mut().zip(vector.iter()) {
      *s += v;
    }
    self.count += 1;
  }

  pub fn count(&self) -> usize {
    self.count
  }

  pub fn mean(&self) -> Option<Vec<f32>> {
    if self.count == 0 {
      return None;
    }
    let n = self.count as f32;
    Some(self.sum.iter().map(|s| s / n).collect())
  }
}

/// Select document keywords from the pooled candidates.
///
/// Candidates are scored by cosine against the document embedding,
/// filtered by `min_score`, and diversified with MMR. `vectors` aligns
/// positionally with `candidates`.
pub fn select_document_keywords(
  candidates: &[String],
  vectors: &[Vec<f32>],
  document_embedding: &[f32],
  max_keywords: usize,
  min_score: f32,
  lambda: f32,
) -> Vec<KeyPhrase> {
  let n = candidates.len().min(vectors.len());
  if n == 0 {
    return Vec::new();
  }

  let mut kept_texts: Vec<String> = Vec::new();
  let mut kept_vectors: Vec<Vec<f32>> = Vec::new();
  let mut kept_scores: Vec<f32> = Vec::new();

  for i in 0..n {
    let score = cosine(&vectors[i], document_embedding);
    if score >= min_score {
      kept_texts.push(candidates[i].clone());
      kept_vectors.push(vectors[i].clone());
      kept_scores.push(score);
    }
  }

  let picked = mmr_select(&kept_scores, &kept_vectors, lambda, max_keywords);
  let mut keywords: Vec<KeyPhrase> = picked
    .into_iter()
    .map(|i| KeyPhrase {
      text: kept_texts[i].clone(),
      score: kept_scores[i],
    })
    .collect();
  keywords.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
  keywords
}

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

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_incremental_mean() {
    let mut mean = IncrementalMean::new();
    assert!(mean.mean().is_none());

    mean.add(&[1.0, 0.0]);
    mean.add(&[0.0, 1.0]);
    let m = mean.mean().unwrap();
    assert_eq!(m, vec![0.5, 0.5]);
    assert_eq!(mean.count(), 2);
  }

  #[test]
  fn test_incremental_mean_ignores_mismatched_dims() {
    let mut mean = IncrementalMean::new();
    mean.add(&[1.0, 0.0]);
    mean.add(&[1.0, 0.0, 0.0]); // ignored
    assert_eq!(mean.count(), 1);
    assert_eq!(mean.mean().unwrap(), vec![1.0, 0.0]);
  }

  #[test]
  fn test_document_keywords_min_score_filter() {
    let candidates = vec!["close".to_string(), "far".to_string()];
    let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
    let doc = vec![1.0, 0.0];

    let keywords = select_document_keywords(&candidates, &vectors, &doc, 30, 0.3, 0.3);
    assert_eq!(keywords.len(), 1);
    assert_eq!(keywords[0].text, "close");
    assert!(keywords[0].score >= 0.99);
  }

  #[test]
  fn test_document_keywords_respects_max() {
    let candidates: Vec<String> = (0..50).map(|i| format!("kw{i}")).collect();
    let vectors: Vec<Vec<f32>> = (0..50).map(|i| vec![1.0, i as f32 * 0.001]).collect();
    let doc = vec![1.0, 0.0];

    let keywords = select_document_keywords(&candidates, &vectors, &doc, 30, 0.3, 0.3);
    assert!(keywords.len() <= 30);
    assert!(!keywords.is_empty());
  }

  #[test]
  fn test_document_keywords_empty_input() {
    assert!(select_document_keywords(&[], &[], &[1.0], 30, 0.3, 0.3).is_empty());
  }
}
