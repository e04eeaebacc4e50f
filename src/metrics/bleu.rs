//! Corpus BLEU with sacreBLEU defaults: 13a tokenization, 4-grams,
//! exponential smoothing, case-sensitive.

use std::collections::HashMap;

use super::{check_inputs, CorpusMetric, MetricScores, MetricValue};
use crate::error::Result;

/// sacreBLEU-compatible corpus BLEU.
#[derive(Debug, Clone)]
pub struct SacreBleu {
    /// Highest n-gram order.
    pub max_ngram_order: usize,
    /// Lower-case before tokenizing.
    pub lowercase: bool,
}

impl Default for SacreBleu {
    fn default() -> Self {
        Self {
            max_ngram_order: 4,
            lowercase: false,
        }
    }
}

/// Sufficient statistics accumulated over the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BleuStats {
    correct: Vec<u64>,
    total: Vec<u64>,
    sys_len: u64,
    ref_len: u64,
}

impl SacreBleu {
    fn tokens(&self, line: &str) -> Vec<String> {
        let tokenized = if self.lowercase {
            tokenize_13a(&line.to_lowercase())
        } else {
            tokenize_13a(line)
        };
        tokenized.split_whitespace().map(str::to_string).collect()
    }

    fn corpus_stats(&self, predictions: &[String], references: &[Vec<String>]) -> BleuStats {
        let order = self.max_ngram_order;
        let mut stats = BleuStats {
            correct: vec![0; order],
            total: vec![0; order],
            sys_len: 0,
            ref_len: 0,
        };

        for (hyp, refs) in predictions.iter().zip(references) {
            let hyp_tokens = self.tokens(hyp);
            let ref_tokens: Vec<Vec<String>> = refs.iter().map(|r| self.tokens(r)).collect();

            stats.sys_len += hyp_tokens.len() as u64;
            stats.ref_len += closest_ref_len(hyp_tokens.len(), &ref_tokens) as u64;

            for n in 1..=order {
                let hyp_ngrams = ngram_counts(&hyp_tokens, n);
                let mut max_ref: HashMap<&[String], u64> = HashMap::new();
                for tokens in &ref_tokens {
                    for (gram, count) in ngram_counts(tokens, n) {
                        let slot = max_ref.entry(gram).or_insert(0);
                        *slot = (*slot).max(count);
                    }
                }
                for (gram, count) in &hyp_ngrams {
                    stats.total[n - 1] += count;
                    stats.correct[n - 1] += (*count).min(max_ref.get(gram).copied().unwrap_or(0));
                }
            }
        }
        stats
    }
}

/// Closest reference length, ties resolved towards the shorter reference.
fn closest_ref_len(hyp_len: usize, refs: &[Vec<String>]) -> usize {
    let mut best = (usize::MAX, 0);
    for len in refs.iter().map(Vec::len) {
        let diff = len.abs_diff(hyp_len);
        if diff < best.0 || (diff == best.0 && len < best.1) {
            best = (diff, len);
        }
    }
    best.1
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], u64> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for window in tokens.windows(n) {
            *counts.entry(window).or_insert(0) += 1;
        }
    }
    counts
}

fn brevity_penalty(sys_len: u64, ref_len: u64) -> f64 {
    if sys_len >= ref_len {
        1.0
    } else if sys_len == 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let ratio = ref_len as f64 / sys_len as f64;
        (1.0 - ratio).exp()
    }
}

#[allow(clippy::cast_precision_loss)]
fn score(stats: &BleuStats) -> (f64, Vec<f64>, f64) {
    let order = stats.correct.len();
    let mut precisions = vec![0.0; order];
    let bp = brevity_penalty(stats.sys_len, stats.ref_len);

    if stats.correct.iter().all(|&c| c == 0) {
        return (0.0, precisions, bp);
    }

    let mut smooth = 1.0;
    for n in 0..order {
        if stats.total[n] == 0 {
            break;
        }
        precisions[n] = if stats.correct[n] == 0 {
            smooth *= 2.0;
            100.0 / (smooth * stats.total[n] as f64)
        } else {
            100.0 * stats.correct[n] as f64 / stats.total[n] as f64
        };
    }

    let log_sum: f64 = precisions
        .iter()
        .map(|&p| if p == 0.0 { -9_999_999_999.0 } else { p.ln() })
        .sum();
    (bp * (log_sum / order as f64).exp(), precisions, bp)
}

impl CorpusMetric for SacreBleu {
    fn name(&self) -> &'static str {
        "sacrebleu"
    }

    fn compute(&self, predictions: &[String], references: &[Vec<String>]) -> Result<MetricScores> {
        check_inputs(self.name(), predictions, references)?;
        let stats = self.corpus_stats(predictions, references);
        let (bleu, precisions, bp) = score(&stats);

        Ok(MetricScores::new()
            .with("score", MetricValue::Float(bleu))
            .with("counts", MetricValue::Ints(stats.correct))
            .with("totals", MetricValue::Ints(stats.total))
            .with("precisions", MetricValue::Floats(precisions))
            .with("bp", MetricValue::Float(bp))
            .with("sys_len", MetricValue::Int(stats.sys_len))
            .with("ref_len", MetricValue::Int(stats.ref_len)))
    }
}

fn is_13a_symbol(c: char) -> bool {
    matches!(c, '{'..='~' | '['..='`' | ' '..='&' | '('..='+' | ':'..='@' | '/')
}

fn is_period_or_comma(c: char) -> bool {
    c == '.' || c == ','
}

/// Tokenize with the `mteval-v13a` rules and collapse whitespace.
#[must_use]
pub fn tokenize_13a(line: &str) -> String {
    let mut line = line
        .replace("<skipped>", "")
        .replace("-\n", "")
        .replace('\n', " ");
    if line.contains('&') {
        line = line
            .replace("&quot;", "\"")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">");
    }

    let padded: Vec<char> = format!(" {line} ").chars().collect();

    let mut symbols = Vec::with_capacity(padded.len() * 2);
    for c in padded {
        if is_13a_symbol(c) {
            symbols.extend([' ', c, ' ']);
        } else {
            symbols.push(c);
        }
    }

    // period and comma unless preceded by a digit
    let split_after = rewrite_pairs(&symbols, |a, b| {
        (!a.is_ascii_digit() && is_period_or_comma(b)).then(|| vec![a, ' ', b, ' '])
    });
    // period and comma unless followed by a digit
    let split_before = rewrite_pairs(&split_after, |a, b| {
        (is_period_or_comma(a) && !b.is_ascii_digit()).then(|| vec![' ', a, ' ', b])
    });
    // dash preceded by a digit
    let split_dash = rewrite_pairs(&split_before, |a, b| {
        (a.is_ascii_digit() && b == '-').then(|| vec![a, ' ', b, ' '])
    });

    split_dash
        .into_iter()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Left-to-right, non-overlapping rewrite of adjacent character pairs.
fn rewrite_pairs(chars: &[char], rule: impl Fn(char, char) -> Option<Vec<char>>) -> Vec<char> {
    let mut out = Vec::with_capacity(chars.len() + chars.len() / 2);
    let mut i = 0;
    while i < chars.len() {
        if i + 1 < chars.len() {
            if let Some(replacement) = rule(chars[i], chars[i + 1]) {
                out.extend(replacement);
                i += 2;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
