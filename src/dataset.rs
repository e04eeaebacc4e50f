//! Translation dataset loading.
//!
//! A dataset lives at `<dataset_path>/<dataset_config>/` and holds a `train`
//! and a `test` split, each either JSON Lines (`train.jsonl`) or a JSON array
//! (`train.json`). Every record carries `classical` and `english`, plus an
//! optional `modern` gloss and an optional preformatted `text`.
//!
//! A `dataset_path` that is not on disk but reads as a repository id
//! (`owner/name`) is fetched from the Hugging Face Hub with the same layout.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// One parallel sentence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRow {
    /// Classical Chinese source.
    pub classical: String,
    /// Modern Chinese gloss, used by chain-of-thought prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modern: Option<String>,
    /// English reference.
    pub english: String,
    /// Preformatted training text; overrides the template when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TranslationRow {
    /// Row without a modern gloss.
    pub fn new(classical: impl Into<String>, english: impl Into<String>) -> Self {
        Self {
            classical: classical.into(),
            modern: None,
            english: english.into(),
            text: None,
        }
    }

    /// Attach a modern gloss.
    #[must_use]
    pub fn with_modern(mut self, modern: impl Into<String>) -> Self {
        self.modern = Some(modern.into());
        self
    }
}

/// Train and test splits of one dataset subset.
#[derive(Debug, Clone, Default)]
pub struct DatasetSplits {
    /// Training rows.
    pub train: Vec<TranslationRow>,
    /// Test rows, examples first.
    pub test: Vec<TranslationRow>,
}

/// Where a dataset is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// Subset directory on disk.
    Local(PathBuf),
    /// Dataset repository on the Hub.
    Hub {
        /// Repository id.
        repo_id: String,
        /// Subset directory inside the repository, empty for the root.
        subset: String,
    },
}

impl DatasetSource {
    /// Existing paths and anything that is not a repository id stay local.
    #[must_use]
    pub fn resolve(dataset_path: &str, dataset_config: &str) -> Self {
        if Path::new(dataset_path).exists() || !is_repo_id(dataset_path) {
            Self::Local(subset_dir(dataset_path, dataset_config))
        } else {
            Self::Hub {
                repo_id: dataset_path.to_string(),
                subset: dataset_config.to_string(),
            }
        }
    }
}

fn is_repo_id(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(['.', '/', '~'])
        && s.matches('/').count() <= 1
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn subset_dir(dataset_path: &str, dataset_config: &str) -> PathBuf {
    let root = Path::new(dataset_path);
    if dataset_config.is_empty() {
        root.to_path_buf()
    } else {
        root.join(dataset_config)
    }
}

/// Split files of `subset` present among a repository's `files`.
fn hub_split_files(files: &[String], subset: &str) -> Vec<String> {
    let prefix = if subset.is_empty() {
        String::new()
    } else {
        format!("{subset}/")
    };
    let mut wanted = Vec::new();
    for split in ["train", "test"] {
        for ext in ["jsonl", "json"] {
            let name = format!("{prefix}{split}.{ext}");
            if files.contains(&name) {
                wanted.push(name);
            }
        }
    }
    wanted
}

// downloads keep the repository layout, so the split files share a directory
fn fetch_hub(repo_id: &str, subset: &str, token: Option<String>) -> Result<PathBuf> {
    tracing::info!("Fetching dataset {repo_id} from the Hugging Face Hub");
    let api = ApiBuilder::new().with_token(token).build()?;
    let repo = api.dataset(repo_id.to_string());
    let files: Vec<String> = repo
        .info()?
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .collect();

    let mut dir = None;
    for name in hub_split_files(&files, subset) {
        let local = repo.get(&name)?;
        dir = local.parent().map(Path::to_path_buf);
    }
    dir.ok_or_else(|| {
        TuneError::Dataset(format!(
            "Dataset not found: {repo_id} has no train or test split under '{subset}'"
        ))
    })
}

impl DatasetSplits {
    /// Load both splits from a local directory or the Hub, without a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a split file is missing or malformed.
    pub fn load(dataset_path: &str, dataset_config: &str) -> Result<Self> {
        Self::from_source(&DatasetSource::resolve(dataset_path, dataset_config), None)
    }

    /// Load both splits from `source`, authenticating Hub requests with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails or a split is missing or malformed.
    pub fn from_source(source: &DatasetSource, token: Option<String>) -> Result<Self> {
        let dir = match source {
            DatasetSource::Local(dir) => {
                if !dir.is_dir() {
                    return Err(TuneError::Dataset(format!(
                        "Dataset not found: {}",
                        dir.display()
                    )));
                }
                dir.clone()
            }
            DatasetSource::Hub { repo_id, subset } => fetch_hub(repo_id, subset, token)?,
        };

        let train = load_split(&dir, "train")?;
        let test = load_split(&dir, "test")?;
        tracing::debug!(
            train = train.len(),
            test = test.len(),
            "Loaded dataset from {}",
            dir.display()
        );
        Ok(Self { train, test })
    }
}

/// Load one split by name, preferring `<name>.jsonl` over `<name>.json`.
///
/// # Errors
///
/// Returns an error if neither file exists or a record fails to parse.
pub fn load_split(dir: &Path, name: &str) -> Result<Vec<TranslationRow>> {
    let jsonl = dir.join(format!("{name}.jsonl"));
    if jsonl.is_file() {
        return parse_jsonl(&std::fs::read_to_string(&jsonl)?)
            .map_err(|e| TuneError::Dataset(format!("{}: {e}", jsonl.display())));
    }

    let json = dir.join(format!("{name}.json"));
    if json.is_file() {
        let content = std::fs::read_to_string(&json)?;
        return serde_json::from_str(&content)
            .map_err(|e| TuneError::Dataset(format!("{}: {e}", json.display())));
    }

    Err(TuneError::Dataset(format!(
        "Split '{name}' not found in {}",
        dir.display()
    )))
}

fn parse_jsonl(content: &str) -> std::result::Result<Vec<TranslationRow>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| format!("line {}: {e}", i + 1))
        })
        .collect()
}

/// Partition a test split into the first `num_shots` example rows and the rows to predict.
///
/// # Errors
///
/// Returns an error if the split has fewer than `num_shots` rows.
pub fn split_examples(
    rows: &[TranslationRow],
    num_shots: usize,
) -> Result<(&[TranslationRow], &[TranslationRow])> {
    if num_shots > rows.len() {
        return Err(TuneError::Dataset(format!(
            "num_shots ({num_shots}) exceeds the {} rows in the test split",
            rows.len()
        )));
    }
    Ok(rows.split_at(num_shots))
}

/// Check that every row carries a modern gloss.
///
/// # Errors
///
/// Returns an error naming the first row without one.
pub fn require_modern(rows: &[TranslationRow]) -> Result<()> {
    match rows.iter().position(|row| row.modern.is_none()) {
        Some(idx) => Err(TuneError::Dataset(format!(
            "row {idx} has no 'modern' field, required for chain-of-thought prompts"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_split(dir: &Path, file: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn test_load_jsonl_subset() {
        let tmp = TempDir::new().unwrap();
        let subset = tmp.path().join("default");
        write_split(
            &subset,
            "train.jsonl",
            "{\"classical\":\"學而時習之\",\"modern\":\"學習並時常溫習\",\"english\":\"To learn and practice\"}\n\n",
        );
        write_split(
            &subset,
            "test.jsonl",
            "{\"classical\":\"有朋自遠方來\",\"english\":\"A friend comes from afar\"}\n",
        );

        let splits = DatasetSplits::load(tmp.path().to_str().unwrap(), "default").unwrap();
        assert_eq!(splits.train.len(), 1);
        assert_eq!(splits.train[0].modern.as_deref(), Some("學習並時常溫習"));
        assert_eq!(splits.test[0].english, "A friend comes from afar");
        assert!(splits.test[0].modern.is_none());
    }

    #[test]
    fn test_load_json_array_without_subset() {
        let tmp = TempDir::new().unwrap();
        let rows = vec![TranslationRow::new("a", "b"), TranslationRow::new("c", "d")];
        let json = serde_json::to_string(&rows).unwrap();
        write_split(tmp.path(), "train.json", &json);
        write_split(tmp.path(), "test.json", &json);

        let splits = DatasetSplits::load(tmp.path().to_str().unwrap(), "").unwrap();
        assert_eq!(splits.test, rows);
    }

    #[test]
    fn test_missing_dataset_and_split() {
        assert!(matches!(
            DatasetSplits::load("/nonexistent/dataset", "default"),
            Err(TuneError::Dataset(_))
        ));

        let tmp = TempDir::new().unwrap();
        write_split(tmp.path(), "train.jsonl", "");
        let err = DatasetSplits::load(tmp.path().to_str().unwrap(), "").unwrap_err();
        assert!(err.to_string().contains("'test'"));
    }

    #[test]
    fn test_source_local_or_hub() {
        let tmp = TempDir::new().unwrap();
        let existing = tmp.path().to_str().unwrap();
        assert_eq!(
            DatasetSource::resolve(existing, "default"),
            DatasetSource::Local(tmp.path().join("default"))
        );
        assert_eq!(
            DatasetSource::resolve("./data/wenyan", ""),
            DatasetSource::Local(PathBuf::from("./data/wenyan"))
        );
        assert!(matches!(
            DatasetSource::resolve("/srv/data/wenyan", "default"),
            DatasetSource::Local(_)
        ));
        assert!(matches!(
            DatasetSource::resolve("a/b/c", "default"),
            DatasetSource::Local(_)
        ));
        assert_eq!(
            DatasetSource::resolve("wenyan-org/classical-english", "default"),
            DatasetSource::Hub {
                repo_id: "wenyan-org/classical-english".into(),
                subset: "default".into(),
            }
        );
    }

    #[test]
    fn test_hub_split_files() {
        let files: Vec<String> = [
            "README.md",
            "default/train.jsonl",
            "default/test.json",
            "other/test.jsonl",
            "train.jsonl",
        ]
        .map(String::from)
        .to_vec();
        assert_eq!(
            hub_split_files(&files, "default"),
            ["default/train.jsonl", "default/test.json"]
        );
        assert_eq!(hub_split_files(&files, ""), ["train.jsonl"]);
        assert!(hub_split_files(&files, "missing").is_empty());
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let tmp = TempDir::new().unwrap();
        write_split(
            tmp.path(),
            "test.jsonl",
            "{\"classical\":\"a\",\"english\":\"b\"}\n{\"classical\":\"c\"}\n",
        );
        let err = load_split(tmp.path(), "test").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_split_examples() {
        let rows: Vec<_> = (0..5)
            .map(|i| TranslationRow::new(format!("c{i}"), format!("e{i}")))
            .collect();

        let (examples, predict) = split_examples(&rows, 2).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(predict.len(), 3);
        assert_eq!(predict[0].classical, "c2");

        let (examples, predict) = split_examples(&rows, 0).unwrap();
        assert!(examples.is_empty());
        assert_eq!(predict.len(), 5);

        assert!(split_examples(&rows, 6).is_err());
    }

    #[test]
    fn test_require_modern() {
        let rows = vec![
            TranslationRow::new("a", "b").with_modern("m"),
            TranslationRow::new("c", "d"),
        ];
        let err = require_modern(&rows).unwrap_err();
        assert!(err.to_string().contains("row 1"));
        assert!(require_modern(&rows[..1]).is_ok());
    }
}
