//! Character n-gram F-score (chrF) with sacreBLEU defaults.

use std::collections::HashMap;

use super::{check_inputs, CorpusMetric, MetricScores, MetricValue};
use crate::error::Result;

/// Corpus chrF.
#[derive(Debug, Clone)]
pub struct Chrf {
    /// Highest character n-gram order.
    pub char_order: usize,
    /// Recall weight.
    pub beta: u32,
}

impl Default for Chrf {
    fn default() -> Self {
        Self {
            char_order: 6,
            beta: 2,
        }
    }
}

/// Per-order `(hyp, ref, match)` counts.
type ChrfStats = Vec<[u64; 3]>;

fn char_ngrams(chars: &[char], n: usize) -> HashMap<&[char], u64> {
    let mut counts = HashMap::new();
    if chars.len() >= n {
        for window in chars.windows(n) {
            *counts.entry(window).or_insert(0) += 1;
        }
    }
    counts
}

fn strip_whitespace(text: &str) -> Vec<char> {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

impl Chrf {
    fn sentence_stats(&self, hyp: &[char], reference: &[char]) -> ChrfStats {
        (1..=self.char_order)
            .map(|n| {
                let hyp_grams = char_ngrams(hyp, n);
                let ref_grams = char_ngrams(reference, n);
                let matches = hyp_grams
                    .iter()
                    .map(|(gram, &count)| count.min(ref_grams.get(gram).copied().unwrap_or(0)))
                    .sum();
                [
                    hyp_grams.values().sum(),
                    ref_grams.values().sum(),
                    matches,
                ]
            })
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn f_score(&self, stats: &ChrfStats) -> f64 {
        const EPS: f64 = 1e-16;
        let factor = f64::from(self.beta * self.beta);

        let mut avg_prec = 0.0;
        let mut avg_rec = 0.0;
        let mut effective_order = 0u32;
        for &[n_hyp, n_ref, n_match] in stats {
            let prec = if n_hyp > 0 {
                n_match as f64 / n_hyp as f64
            } else {
                EPS
            };
            let rec = if n_ref > 0 {
                n_match as f64 / n_ref as f64
            } else {
                EPS
            };
            if n_hyp > 0 && n_ref > 0 {
                avg_prec += prec;
                avg_rec += rec;
                effective_order += 1;
            }
        }

        if effective_order == 0 {
            return 0.0;
        }
        avg_prec /= f64::from(effective_order);
        avg_rec /= f64::from(effective_order);

        if avg_prec + avg_rec == 0.0 {
            0.0
        } else {
            100.0 * (1.0 + factor) * avg_prec * avg_rec / (factor * avg_prec + avg_rec)
        }
    }
}

impl CorpusMetric for Chrf {
    fn name(&self) -> &'static str {
        "chrf"
    }

    fn compute(&self, predictions: &[String], references: &[Vec<String>]) -> Result<MetricScores> {
        check_inputs(self.name(), predictions, references)?;

        let mut corpus: ChrfStats = vec![[0; 3]; self.char_order];
        for (hyp, refs) in predictions.iter().zip(references) {
            let hyp = strip_whitespace(hyp);

            // best reference by sentence-level score; first one wins ties
            let mut best: Option<(f64, ChrfStats)> = None;
            for reference in refs {
                let stats = self.sentence_stats(&hyp, &strip_whitespace(reference));
                let f = self.f_score(&stats);
                if best.as_ref().map_or(true, |(best_f, _)| f > *best_f) {
                    best = Some((f, stats));
                }
            }

            if let Some((_, stats)) = best {
                for (total, sentence) in corpus.iter_mut().zip(stats) {
                    for k in 0..3 {
                        total[k] += sentence[k];
                    }
                }
            }
        }

        Ok(MetricScores::new()
            .with("score", MetricValue::Float(self.f_score(&corpus)))
            .with("char_order", MetricValue::Int(self.char_order as u64))
            .with("word_order", MetricValue::Int(0))
            .with("beta", MetricValue::Int(u64::from(self.beta))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(preds: &[&str], refs: &[&[&str]]) -> f64 {
        let predictions: Vec<String> = preds.iter().map(|s| (*s).to_string()).collect();
        let references: Vec<Vec<String>> = refs
            .iter()
            .map(|r| r.iter().map(|s| (*s).to_string()).collect())
            .collect();
        Chrf::default()
            .compute(&predictions, &references)
            .unwrap()
            .scalar("score")
            .unwrap()
    }

    #[test]
    fn test_perfect_match() {
        let s = score(&["the cat sat on the mat"], &[&["the cat sat on the mat"]]);
        assert!((s - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let s = score(&["thecat  sat"], &[&["the cat sat"]]);
        assert!((s - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_disjoint_is_zero() {
        assert_eq!(score(&["xyz"], &[&["abc"]]), 0.0);
    }

    #[test]
    fn test_partial_match_between_bounds() {
        let s = score(&["the cat"], &[&["the cat sat on the mat"]]);
        assert!(s > 0.0 && s < 100.0);
    }

    #[test]
    fn test_recall_weighted_more_than_precision() {
        // short hypothesis: full precision, low recall
        let short = score(&["the cat"], &[&["the cat sat"]]);
        // long hypothesis: full recall, lower precision
        let long = score(&["the cat sat on it"], &[&["the cat"]]);
        assert!(long > short);
    }

    #[test]
    fn test_best_reference_is_chosen() {
        let single = score(&["the cat sat"], &[&["the cat sat"]]);
        let multi = score(&["the cat sat"], &[&["a dog ran", "the cat sat"]]);
        assert!((single - multi).abs() < 1e-9);
    }

    #[test]
    fn test_reported_parameters() {
        let scores = Chrf::default()
            .compute(&["a".to_string()], &[vec!["a".to_string()]])
            .unwrap();
        assert_eq!(scores.scalar("char_order"), Some(6.0));
        assert_eq!(scores.scalar("word_order"), Some(0.0));
        assert_eq!(scores.scalar("beta"), Some(2.0));
    }
}
