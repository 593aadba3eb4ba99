//! Streaming evaluation metrics.

use std::cmp::Ordering;

/// Accumulates `(score, is_positive)` pairs across batches and reports the
/// area under the ROC curve.
///
/// Higher scores are expected for the positive (anomalous) class. Tied scores
/// share their average rank, so a constant scorer gets exactly 0.5.
#[derive(Debug, Clone, Default)]
pub struct Auc {
    scores: Vec<f32>,
    positives: Vec<bool>,
}

impl Auc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, scores: &[f32], positives: &[bool]) {
        debug_assert_eq!(scores.len(), positives.len());
        self.scores.extend_from_slice(scores);
        self.positives.extend_from_slice(positives);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn reset(&mut self) {
        self.scores.clear();
        self.positives.clear();
    }

    /// AUC of everything seen since the last reset; 0.5 when either class is missing.
    pub fn value(&self) -> f32 {
        compute_auc_roc(&self.scores, &self.positives)
    }

    /// Returns the current value and optionally clears the accumulator.
    pub fn get_metric(&mut self, reset: bool) -> f32 {
        let value = self.value();
        if reset {
            self.reset();
        }
        value
    }
}

/// Mann-Whitney form of the ROC AUC with average ranks for ties.
pub fn compute_auc_roc(scores: &[f32], positives: &[bool]) -> f32 {
    if scores.len() != positives.len() || scores.is_empty() {
        return 0.5;
    }
    let n_pos = positives.iter().filter(|&&p| p).count();
    let n_neg = positives.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(Ordering::Equal));

    let mut rank_sum_pos = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based: positions start..end share (start + 1 + end) / 2
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        for &i in &order[start..end] {
            if positives[i] {
                rank_sum_pos += avg_rank;
            }
        }
        start = end;
    }

    let (n_pos, n_neg) = (n_pos as f64, n_neg as f64);
    let u = rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0;
    (u / (n_pos * n_neg)) as f32
}
