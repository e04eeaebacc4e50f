//! Corpus-level translation metrics.
//!
//! Each metric scores the whole prediction list against one or more
//! references per item and returns its own [`MetricScores`]. The field
//! names follow the `evaluate` library so reports stay comparable.

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Result, TuneError};

mod bleu;
mod chrf;
mod meteor;

pub use bleu::{tokenize_13a, SacreBleu};
pub use chrf::Chrf;
pub use meteor::{word_tokenize, Meteor};

/// One reported number or list of numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Real-valued score.
    Float(f64),
    /// Count.
    Int(u64),
    /// Real-valued series, e.g. n-gram precisions.
    Floats(Vec<f64>),
    /// Count series, e.g. n-gram matches.
    Ints(Vec<u64>),
}

impl MetricValue {
    /// Scalar view, if this is a single number.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Floats(_) | Self::Ints(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, "]")
        }

        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Floats(v) => list(f, v),
            Self::Ints(v) => list(f, v),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::Int(v) => serializer.serialize_u64(*v),
            Self::Floats(v) => v.serialize(serializer),
            Self::Ints(v) => v.serialize(serializer),
        }
    }
}

/// Named fields of one metric result, in report order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricScores {
    fields: Vec<(&'static str, MetricValue)>,
}

impl MetricScores {
    /// Empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field.
    #[must_use]
    pub fn with(mut self, name: &'static str, value: MetricValue) -> Self {
        self.fields.push((name, value));
        self
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    /// Look up a scalar field.
    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(MetricValue::as_f64)
    }

    /// Fields in report order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &MetricValue)> {
        self.fields.iter().map(|(name, value)| (*name, value))
    }
}

/// Renders like a Python dict literal: `{'score': 41.2, 'counts': [3, 2]}`.
impl fmt::Display for MetricScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{name}': {value}")?;
        }
        write!(f, "}}")
    }
}

impl Serialize for MetricScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A metric computed over a whole corpus.
pub trait CorpusMetric {
    /// Report name, e.g. `sacrebleu`.
    fn name(&self) -> &'static str;

    /// Score `predictions[i]` against every string in `references[i]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lists differ in length or an item has no reference.
    fn compute(&self, predictions: &[String], references: &[Vec<String>]) -> Result<MetricScores>;
}

/// The three metrics reported by an evaluation run, in report order.
#[must_use]
pub fn default_metrics() -> Vec<Box<dyn CorpusMetric>> {
    vec![
        Box::new(SacreBleu::default()),
        Box::new(Meteor::default()),
        Box::new(Chrf::default()),
    ]
}

pub(crate) fn check_inputs(
    metric: &str,
    predictions: &[String],
    references: &[Vec<String>],
) -> Result<()> {
    if predictions.len() != references.len() {
        return Err(TuneError::Metric(format!(
            "{metric}: {} predictions but {} references",
            predictions.len(),
            references.len()
        )));
    }
    if let Some(idx) = references.iter().position(Vec::is_empty) {
        return Err(TuneError::Metric(format!(
            "{metric}: item {idx} has no reference"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(items: &[&str]) -> Vec<Vec<String>> {
        items.iter().map(|r| vec![(*r).to_string()]).collect()
    }

    #[test]
    fn test_single_reference_lists_accepted_by_all_metrics() {
        let predictions = vec!["the cat sat".to_string()];
        let references = refs(&["the cat sat"]);
        for metric in default_metrics() {
            let scores = metric.compute(&predictions, &references).unwrap();
            assert!(scores.iter().next().is_some(), "{} returned no fields", metric.name());
        }
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let predictions = vec!["a".to_string(), "b".to_string()];
        let references = refs(&["a"]);
        for metric in default_metrics() {
            let err = metric.compute(&predictions, &references).unwrap_err();
            assert!(matches!(err, TuneError::Metric(_)));
        }
    }

    #[test]
    fn test_empty_reference_list_is_an_error() {
        let predictions = vec!["a".to_string()];
        let references = vec![Vec::new()];
        assert!(check_inputs("x", &predictions, &references).is_err());
    }

    #[test]
    fn test_scores_display_and_json() {
        let scores = MetricScores::new()
            .with("score", MetricValue::Float(12.5))
            .with("counts", MetricValue::Ints(vec![3, 1]));
        assert_eq!(scores.to_string(), "{'score': 12.5, 'counts': [3, 1]}");
        assert_eq!(
            serde_json::to_string(&scores).unwrap(),
            r#"{"score":12.5,"counts":[3,1]}"#
        );
        assert_eq!(scores.scalar("score"), Some(12.5));
        assert_eq!(scores.scalar("counts"), None);
    }

    #[test]
    fn test_metric_names_in_report_order() {
        let names: Vec<_> = default_metrics().iter().map(|m| m.name()).collect();
        assert_eq!(names, ["sacrebleu", "meteor", "chrf"]);
    }
}
