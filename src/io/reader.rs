//! Line-delimited JSON reader that maps raw labels onto the normal/anomalous split.

use crate::error::{CvddError, Result};
use crate::labels::LabelSets;
use log::{info, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Reader settings: which JSON keys to read and how to normalize text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_text_key")]
    pub text_key: String,
    #[serde(default = "default_label_key")]
    pub label_key: String,
    #[serde(default)]
    pub lowercase: bool,
    /// Tokens dropped before indexing. Empty keeps everything.
    #[serde(default)]
    pub stopwords: Vec<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            text_key: default_text_key(),
            label_key: default_label_key(),
            lowercase: false,
            stopwords: Vec::new(),
        }
    }
}

fn default_text_key() -> String {
    "text".to_string()
}

fn default_label_key() -> String {
    "label".to_string()
}

/// Removes listed words from whitespace-separated text.
#[derive(Debug, Clone, Default)]
pub struct Stopwords {
    words: HashSet<String>,
}

impl Stopwords {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Stopwords {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Whitespace-tokenizes `text`, drops stopwords and rejoins with single spaces.
    pub fn apply(&self, text: &str) -> String {
        text.split_whitespace()
            .filter(|token| !self.contains(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Whitespace tokenizer with optional lowercasing and stopword removal.
#[derive(Debug, Clone, Default)]
pub struct WhitespaceTokenizer {
    lowercase: bool,
    stopwords: Stopwords,
}

impl WhitespaceTokenizer {
    pub fn new(lowercase: bool, stopwords: Stopwords) -> Self {
        WhitespaceTokenizer { lowercase, stopwords }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|token| {
                if self.lowercase {
                    token.to_lowercase()
                } else {
                    token.to_string()
                }
            })
            .filter(|token| !self.stopwords.contains(token))
            .collect()
    }
}

/// One retained record: its tokens, the original text and the mapped label.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub text: String,
    pub tokens: Vec<String>,
    /// `"normal"`, `"anomalous"`, or `None` for unlabeled records.
    pub label: Option<String>,
}

/// Reads one-class classification corpora.
pub struct OneClassReader {
    label_sets: LabelSets,
    config: ReaderConfig,
    tokenizer: WhitespaceTokenizer,
}

impl OneClassReader {
    pub fn new(label_sets: LabelSets, config: ReaderConfig) -> Self {
        let stopwords = Stopwords::new(config.stopwords.iter().cloned());
        let tokenizer = WhitespaceTokenizer::new(config.lowercase, stopwords);
        OneClassReader {
            label_sets,
            config,
            tokenizer,
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<Instance>> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let instances = self.read_from(BufReader::new(file))?;
        info!(
            "OneClassReader read: path={} instances={}",
            path.display(),
            instances.len()
        );
        Ok(instances)
    }

    pub fn read_from<R: BufRead>(&self, reader: R) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut skipped = 0usize;
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_line(i + 1, &line)? {
                Some(instance) => instances.push(instance),
                None => skipped += 1,
            }
        }
        info!("OneClassReader: retained={} skipped={}", instances.len(), skipped);
        Ok(instances)
    }

    /// Parses one record. `Ok(None)` means the label belongs to neither set.
    pub fn parse_line(&self, line_num: usize, line: &str) -> Result<Option<Instance>> {
        let parse_error = |reason: &str| CvddError::Parse {
            line: line_num,
            content: line.to_string(),
            reason: reason.to_string(),
        };
        let row: Value = serde_json::from_str(line).map_err(|e| parse_error(&e.to_string()))?;
        let text = row
            .get(&self.config.text_key)
            .and_then(Value::as_str)
            .ok_or_else(|| parse_error(&format!("missing \"{}\"", self.config.text_key)))?;

        let label = match row.get(&self.config.label_key) {
            None | Some(Value::Null) => None,
            Some(raw) => {
                let raw = match raw {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match self.label_sets.classify(&raw) {
                    Some(mapped) => Some(mapped),
                    None => {
                        trace!("skipping line {} with label {:?}", line_num, raw);
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(self.text_to_instance(text, label)))
    }

    pub fn text_to_instance(&self, text: &str, label: Option<&str>) -> Instance {
        Instance {
            text: text.to_string(),
            tokens: self.tokenizer.tokenize(text),
            label: label.map(str::to_string),
        }
    }
}
