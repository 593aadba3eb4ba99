use crate::error::{CvddError, Result};
use ndarray::{Array1, ArrayD, Ix1};
use std::collections::BTreeSet;

pub const NORMAL: &str = "normal";
pub const ANOMALOUS: &str = "anomalous";

/// Wrapper for integer label arrays (class indices into a [`LabelVocabulary`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Labels(pub ArrayD<i64>);

impl Labels {
    pub fn new(arr: ArrayD<i64>) -> Self {
        Labels(arr)
    }

    pub fn from_vec(indices: Vec<i64>) -> Self {
        Labels(Array1::from(indices).into_dyn())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The labels as a 1-D view; higher-rank label arrays are rejected.
    pub fn as_1d(&self) -> Result<Array1<i64>> {
        self.0
            .clone()
            .into_dimensionality::<Ix1>()
            .map_err(|_| CvddError::shape(format!("labels must be 1-D, got {:?}", self.0.shape())))
    }

    /// `true` where the label equals `index`.
    pub fn matches(&self, index: usize) -> Vec<bool> {
        self.0.iter().map(|&l| l == index as i64).collect()
    }
}

/// The fixed two-entry label namespace: `normal = 0`, `anomalous = 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVocabulary {
    tokens: Vec<String>,
}

impl Default for LabelVocabulary {
    fn default() -> Self {
        LabelVocabulary {
            tokens: vec![NORMAL.to_string(), ANOMALOUS.to_string()],
        }
    }
}

impl LabelVocabulary {
    pub fn index(&self, label: &str) -> Option<usize> {
        self.tokens.iter().position(|t| t == label)
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Raw dataset labels grouped into the normal class and the anomalous class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSets {
    normal: BTreeSet<String>,
    anomalous: BTreeSet<String>,
}

impl LabelSets {
    pub fn new<N, A, S>(normal: N, anomalous: A) -> Result<Self>
    where
        N: IntoIterator<Item = S>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let normal: BTreeSet<String> = normal.into_iter().map(Into::into).collect();
        let anomalous: BTreeSet<String> = anomalous.into_iter().map(Into::into).collect();
        if normal.is_empty() {
            return Err(CvddError::config("normal label set is empty"));
        }
        if let Some(shared) = normal.intersection(&anomalous).next() {
            return Err(CvddError::config(format!(
                "label {:?} is both normal and anomalous",
                shared
            )));
        }
        Ok(LabelSets { normal, anomalous })
    }

    /// Maps a raw label to `"normal"` / `"anomalous"`; the normal set is checked first.
    pub fn classify(&self, raw: &str) -> Option<&'static str> {
        if self.normal.contains(raw) {
            Some(NORMAL)
        } else if self.anomalous.contains(raw) {
            Some(ANOMALOUS)
        } else {
            None
        }
    }

    pub fn normal(&self) -> &BTreeSet<String> {
        &self.normal
    }

    pub fn anomalous(&self) -> &BTreeSet<String> {
        &self.anomalous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_fixed() {
        let vocab = LabelVocabulary::default();
        assert_eq!(vocab.index(NORMAL), Some(0));
        assert_eq!(vocab.index(ANOMALOUS), Some(1));
        assert_eq!(vocab.token(1), Some(ANOMALOUS));
        assert_eq!(vocab.index("spam"), None);
    }

    #[test]
    fn classify_respects_both_sets() {
        let sets = LabelSets::new(["pos"], ["neg", "spam"]).unwrap();
        assert_eq!(sets.classify("pos"), Some(NORMAL));
        assert_eq!(sets.classify("spam"), Some(ANOMALOUS));
        assert_eq!(sets.classify("neutral"), None);
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        assert!(LabelSets::new(["a", "b"], ["b"]).is_err());
        assert!(LabelSets::new(Vec::<String>::new(), vec!["b".to_string()]).is_err());
    }

    #[test]
    fn matches_marks_index() {
        let labels = Labels::from_vec(vec![0, 1, 1, 0]);
        assert_eq!(labels.matches(1), vec![false, true, true, false]);
        assert_eq!(labels.as_1d().unwrap().len(), 4);
    }
}
