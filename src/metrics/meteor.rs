//! METEOR with exact and Porter-stem unigram matching.
//!
//! Alignment, chunk counting and the fragmentation penalty follow the NLTK
//! scorer that `evaluate` wraps. Words left unmatched by the exact stage are
//! matched again on their English Snowball stems; the WordNet synonym stage
//! is not applied.

use rust_stemmers::{Algorithm, Stemmer};

use super::{check_inputs, CorpusMetric, MetricScores, MetricValue};
use crate::error::Result;

const CLITICS: &[&str] = &["n't", "'s", "'re", "'ve", "'ll", "'d", "'m"];

/// Mean sentence-level METEOR.
#[derive(Debug, Clone)]
pub struct Meteor {
    /// Precision/recall balance.
    pub alpha: f64,
    /// Fragmentation exponent.
    pub beta: f64,
    /// Fragmentation weight.
    pub gamma: f64,
}

impl Default for Meteor {
    fn default() -> Self {
        Self {
            alpha: 0.9,
            beta: 3.0,
            gamma: 0.5,
        }
    }
}

/// Lower-case and split into words, detaching punctuation from word edges.
#[must_use]
pub fn word_tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.to_lowercase().split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        let start = chars
            .iter()
            .position(|c| c.is_alphanumeric())
            .unwrap_or(chars.len());
        let end = chars
            .iter()
            .rposition(|c| c.is_alphanumeric())
            .map_or(start, |i| i + 1);

        tokens.extend(chars[..start].iter().map(char::to_string));
        if start < end {
            let core: String = chars[start..end].iter().collect();
            match CLITICS
                .iter()
                .find(|c| core.len() > c.len() && core.ends_with(*c))
            {
                Some(clitic) => {
                    tokens.push(core[..core.len() - clitic.len()].to_string());
                    tokens.push((*clitic).to_string());
                }
                None => tokens.push(core),
            }
        }
        tokens.extend(chars[end.max(start)..].iter().map(char::to_string));
    }
    tokens
}

type Indexed = Vec<(usize, String)>;

// repeated words align right to left; matched words leave both lists
fn match_stage(hyp: &mut Indexed, reference: &mut Indexed) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();
    for i in (0..hyp.len()).rev() {
        for j in (0..reference.len()).rev() {
            if hyp[i].1 == reference[j].1 {
                matches.push((hyp[i].0, reference[j].0));
                hyp.remove(i);
                reference.remove(j);
                break;
            }
        }
    }
    matches
}

fn stem_all(words: Indexed, stemmer: &Stemmer) -> Indexed {
    words
        .into_iter()
        .map(|(i, w)| (i, stemmer.stem(&w).into_owned()))
        .collect()
}

/// Exact then stem alignment as `(hyp_index, ref_index)` pairs sorted by hypothesis position.
fn align(hyp: &[String], reference: &[String], stemmer: &Stemmer) -> Vec<(usize, usize)> {
    let mut hyp: Indexed = hyp.iter().cloned().enumerate().collect();
    let mut reference: Indexed = reference.iter().cloned().enumerate().collect();

    let mut matches = match_stage(&mut hyp, &mut reference);
    let mut hyp = stem_all(hyp, stemmer);
    let mut reference = stem_all(reference, stemmer);
    matches.extend(match_stage(&mut hyp, &mut reference));

    matches.sort_by_key(|&(h, _)| h);
    matches
}

fn count_chunks(matches: &[(usize, usize)]) -> usize {
    1 + matches
        .windows(2)
        .filter(|w| !(w[1].0 == w[0].0 + 1 && w[1].1 == w[0].1 + 1))
        .count()
}

impl Meteor {
    /// METEOR of one hypothesis against one reference.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn single(&self, hyp: &[String], reference: &[String]) -> f64 {
        let matches = align(hyp, reference, &Stemmer::create(Algorithm::English));
        let m = matches.len();
        if m == 0 || hyp.is_empty() || reference.is_empty() {
            return 0.0;
        }

        let precision = m as f64 / hyp.len() as f64;
        let recall = m as f64 / reference.len() as f64;
        let fmean = precision * recall / (self.alpha * precision + (1.0 - self.alpha) * recall);
        let frag = count_chunks(&matches) as f64 / m as f64;
        let penalty = self.gamma * frag.powf(self.beta);
        (1.0 - penalty) * fmean
    }

    /// Best score over several references.
    #[must_use]
    pub fn sentence(&self, hyp: &str, references: &[String]) -> f64 {
        let hyp = word_tokenize(hyp);
        references
            .iter()
            .map(|r| self.single(&hyp, &word_tokenize(r)))
            .fold(0.0, f64::max)
    }
}

impl CorpusMetric for Meteor {
    fn name(&self) -> &'static str {
        "meteor"
    }

    #[allow(clippy::cast_precision_loss)]
    fn compute(&self, predictions: &[String], references: &[Vec<String>]) -> Result<MetricScores> {
        check_inputs(self.name(), predictions, references)?;
        let mean = if predictions.is_empty() {
            0.0
        } else {
            predictions
                .iter()
                .zip(references)
                .map(|(hyp, refs)| self.sentence(hyp, refs))
                .sum::<f64>()
                / predictions.len() as f64
        };
        Ok(MetricScores::new().with("meteor", MetricValue::Float(mean)))
    }
}
