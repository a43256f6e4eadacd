/// Coleman–Liau readability index, clamped to [0, 20].
///
/// Grade-level estimate from letters-per-word and sentences-per-word;
/// needs no syllable counting, which keeps it cheap per chunk.
pub fn coleman_liau(text: &str) -> f32 {
  let words: Vec<&str> = text.split_whitespace().collect();
  if words.is_empty() {
    return 0.0;
  }

  let letters: usize = words
    .iter()
    .map(|w| w.chars().filter(|c| c.is_alphabetic()).count())
    .sum();
  let sentences = text
    .chars()
    .filter(|c| matches!(c, '.' | '!' | '?'))
    .count()
    .max(1);

  let word_count = words.len() as f32;
  let l = letters as f32 / word_count * 100.0;
  let s = sentences as f32 / word_count * 100.0;

  let score = 0.0588 * l - 0.296 * s - 15.8;
  score.clamp(0.0, 20.0)
}
