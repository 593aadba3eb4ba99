//! The CVDD model: attention pooling against a learned context bank.
//!
//! For every example the model builds one context vector per attention head,
//! measures its distance to the matching row of the bank and reports the mean
//! distance as the anomaly score. Training pulls the context vectors of normal
//! examples towards the bank while the orthogonality penalty keeps bank rows
//! apart.

use crate::config::CvddConfig;
use crate::error::{CvddError, Result};
use crate::io::{Batch, Vocabulary, PADDING_INDEX};
use crate::labels::{LabelVocabulary, ANOMALOUS};
use crate::metrics::Auc;
use crate::nn::context::{mask_tensor, ContextAggregator, ContextVectorBank};
use crate::nn::distance::{Distance, DistanceKind};
use crate::nn::embedding::{Embedding, TextEmbedder};
use crate::nn::encoder::SequenceEncoder;
use crate::tensor::Tensor;
use log::debug;
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scalar settings of the scoring and loss computation.
#[derive(Debug, Clone, PartialEq)]
pub struct CvddOptions {
    pub distance: DistanceKind,
    /// Alpha in `softmax(-alpha * D)` over heads. 0 weighs heads uniformly.
    pub distance_weight: f32,
    /// Lambda on the orthogonality penalty. 0 disables the penalty.
    pub context_regularization: f32,
    /// Leave anomalous examples out of the distance term when labels are given.
    pub train_without_anomaly: bool,
    pub anomaly_label: String,
}

impl Default for CvddOptions {
    fn default() -> Self {
        CvddOptions {
            distance: DistanceKind::Cosine,
            distance_weight: 0.0,
            context_regularization: 1.0,
            train_without_anomaly: true,
            anomaly_label: ANOMALOUS.to_string(),
        }
    }
}

impl From<&CvddConfig> for CvddOptions {
    fn from(config: &CvddConfig) -> Self {
        CvddOptions {
            distance: config.distance,
            distance_weight: config.distance_weight,
            context_regularization: config.context_regularization,
            train_without_anomaly: config.train_without_anomaly,
            anomaly_label: config.anomaly_label.clone(),
        }
    }
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct CvddOutput {
    /// Scalar, differentiable training loss.
    pub loss: Tensor,
    /// `(B,)` mean per-head distance; higher is more anomalous.
    pub anomaly_scores: Array1<f32>,
    /// `(B, H)` per-head distances.
    pub distances: Array2<f32>,
    /// `(B, T)` token ids when the batch carried them.
    pub token_ids: Option<Array2<usize>>,
}

pub struct Cvdd {
    embedder: Arc<dyn TextEmbedder>,
    context_encoder: Box<dyn SequenceEncoder>,
    aggregator: ContextAggregator,
    bank: ContextVectorBank,
    distance: Box<dyn Distance>,
    alpha: f32,
    lambda: f32,
    train_without_anomaly: bool,
    anomaly_label_index: usize,
    label_vocab: LabelVocabulary,
    auc: Auc,
}

impl Cvdd {
    /// Assembles a model, checking that the component widths line up.
    ///
    /// The bank gets one row per attention head and is as wide as the context
    /// encoder input, so the context encoder must preserve its width.
    pub fn new(
        embedder: Box<dyn TextEmbedder>,
        context_encoder: Box<dyn SequenceEncoder>,
        attention_encoder: Box<dyn SequenceEncoder>,
        options: CvddOptions,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        CvddError::check_dimensions_match(
            embedder.output_dim(),
            context_encoder.input_dim(),
            "text_field_embedder output dim",
            "context_encoder input dim",
        )?;
        CvddError::check_dimensions_match(
            context_encoder.output_dim(),
            attention_encoder.input_dim(),
            "context_encoder output dim",
            "attention_encoder input dim",
        )?;
        CvddError::check_dimensions_match(
            context_encoder.output_dim(),
            context_encoder.input_dim(),
            "context_encoder output dim",
            "context vector dim",
        )?;

        let label_vocab = LabelVocabulary::default();
        let anomaly_label_index = label_vocab.index(&options.anomaly_label).ok_or_else(|| {
            CvddError::config(format!(
                "anomaly label {:?} is not in the label vocabulary",
                options.anomaly_label
            ))
        })?;

        let num_heads = attention_encoder.output_dim();
        let bank = ContextVectorBank::new(num_heads, context_encoder.input_dim(), rng);
        debug!(
            "Cvdd created: heads={} context_dim={} alpha={} lambda={}",
            num_heads,
            bank.context_dim(),
            options.distance_weight,
            options.context_regularization
        );

        Ok(Cvdd {
            embedder: Arc::from(embedder),
            context_encoder,
            aggregator: ContextAggregator::new(attention_encoder),
            bank,
            distance: options.distance.build(),
            alpha: options.distance_weight,
            lambda: options.context_regularization,
            train_without_anomaly: options.train_without_anomaly,
            anomaly_label_index,
            label_vocab,
            auc: Auc::new(),
        })
    }

    /// Builds a model with a trainable embedding table sized to `vocab`.
    pub fn from_config(config: &CvddConfig, vocab: &Vocabulary, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let embedder = Embedding::new(vocab.len(), config.embedding_dim, true, rng);
        let context_encoder = config.context_encoder.build(rng)?;
        let attention_encoder = config.attention_encoder.build(rng)?;
        Self::new(
            Box::new(embedder),
            context_encoder,
            attention_encoder,
            CvddOptions::from(config),
            rng,
        )
    }

    /// Replaces the randomly initialized bank, e.g. with fixed vectors in tests.
    pub fn with_bank(mut self, bank: ContextVectorBank) -> Result<Self> {
        CvddError::check_dimensions_match(
            bank.num_heads(),
            self.bank.num_heads(),
            "context bank rows",
            "attention heads",
        )?;
        CvddError::check_dimensions_match(
            bank.context_dim(),
            self.bank.context_dim(),
            "context bank width",
            "context vector dim",
        )?;
        self.bank = bank;
        Ok(self)
    }

    /// Shared handle to the embedder; batches are embedded outside the model.
    pub fn embedder(&self) -> Arc<dyn TextEmbedder> {
        Arc::clone(&self.embedder)
    }

    pub fn bank(&self) -> &ContextVectorBank {
        &self.bank
    }

    pub fn num_heads(&self) -> usize {
        self.bank.num_heads()
    }

    pub fn label_vocab(&self) -> &LabelVocabulary {
        &self.label_vocab
    }

    /// Every trainable tensor: embedder, both encoders and the bank.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.embedder.parameters();
        params.extend(self.context_encoder.parameters());
        params.extend(self.aggregator.parameters());
        params.push(self.bank.vectors().clone());
        params
    }

    pub fn forward(&mut self, batch: &Batch) -> Result<CvddOutput> {
        batch.validate()?;
        let expected = self.context_encoder.input_dim();
        if batch.embedding_dim() != expected {
            return Err(CvddError::shape(format!(
                "token embeddings have width {}, context encoder expects {}",
                batch.embedding_dim(),
                expected
            )));
        }

        let mask = mask_tensor(&batch.mask);
        // (B, T, C)
        let encodings = self.context_encoder.encode(&batch.token_embeddings, &mask)?;
        // (B, H, C)
        let matrix = self.aggregator.aggregate(&encodings, &mask)?.matrix;
        // (B, H)
        let distances = self.distance.distance(&matrix, self.bank.vectors());
        let sigmas = distances.scale(-self.alpha).softmax(1);
        // (B,)
        let batched_loss = sigmas.mul(&distances).sum_axis(1);

        let labels = match &batch.label {
            Some(label) => Some(label.as_1d()?),
            None => None,
        };

        let mut loss = match &labels {
            Some(labels) if self.train_without_anomaly => {
                let keep: ArrayD<f32> = labels
                    .mapv(|l| if l == self.anomaly_label_index as i64 { 0.0 } else { 1.0 })
                    .into_dyn();
                let count = keep.sum();
                if count == 0.0 {
                    debug!("every example in the batch is anomalous; distance term is 0");
                }
                batched_loss
                    .mul(&Tensor::new(keep, false))
                    .sum()
                    .scale(1.0 / count.max(1.0))
            }
            _ => batched_loss.mean(),
        };

        if self.lambda != 0.0 {
            loss = loss.add(&self.bank.orthogonality_penalty()?.scale(self.lambda));
        }

        let distances = distances
            .data()
            .into_dimensionality::<Ix2>()
            .map_err(|e| CvddError::shape(format!("distances: {}", e)))?;
        let anomaly_scores = distances
            .mean_axis(Axis(1))
            .ok_or_else(|| CvddError::shape("model has no attention heads"))?
            .into_dimensionality::<Ix1>()
            .map_err(|e| CvddError::shape(format!("anomaly scores: {}", e)))?;

        if let Some(labels) = &labels {
            let positives: Vec<bool> = labels
                .iter()
                .map(|&l| l == self.anomaly_label_index as i64)
                .collect();
            self.auc.update(&anomaly_scores.to_vec(), &positives);
        }

        Ok(CvddOutput {
            loss,
            anomaly_scores,
            distances,
            token_ids: batch.token_ids.clone(),
        })
    }

    /// Decodes `output.token_ids` through `vocab`, dropping padding.
    pub fn make_output_human_readable(&self, output: &CvddOutput, vocab: &Vocabulary) -> Vec<Vec<String>> {
        let Some(ids) = &output.token_ids else {
            return Vec::new();
        };
        ids.rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .filter(|&&id| id != PADDING_INDEX)
                    .filter_map(|&id| vocab.token(id).map(str::to_string))
                    .collect()
            })
            .collect()
    }

    /// `{"auc": ...}` over everything seen since the last reset.
    pub fn metrics(&mut self, reset: bool) -> BTreeMap<String, f32> {
        let mut metrics = BTreeMap::new();
        metrics.insert("auc".to_string(), self.auc.get_metric(reset));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::nn::{Activation, FeedForwardEncoder, PassThroughEncoder};
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const DIM: usize = 3;

    fn model(options: CvddOptions) -> Cvdd {
        let mut rng = StdRng::seed_from_u64(11);
        let embedder = Embedding::new(6, DIM, false, &mut rng);
        let attention =
            FeedForwardEncoder::new(DIM, &[2], &[Activation::Linear], &mut rng).unwrap();
        Cvdd::new(
            Box::new(embedder),
            Box::new(PassThroughEncoder::new(DIM)),
            Box::new(attention),
            options,
            &mut rng,
        )
        .unwrap()
    }

    fn batch(label: Option<Vec<i64>>) -> Batch {
        let emb = Array3::from_shape_fn((3, 4, DIM), |(b, t, c)| ((b * 7 + t * 3 + c) % 5) as f32 - 2.0);
        let mask = array![
            [true, true, true, true],
            [true, true, false, false],
            [true, false, false, false]
        ];
        Batch::new(Tensor::new(emb.into_dyn(), false), mask, label.map(Labels::from_vec)).unwrap()
    }

    #[test]
    fn scores_do_not_depend_on_labels() {
        let mut m = model(CvddOptions::default());
        let with = m.forward(&batch(Some(vec![0, 1, 0]))).unwrap();
        let without = m.forward(&batch(None)).unwrap();
        assert_eq!(with.anomaly_scores, without.anomaly_scores);
        assert_eq!(with.anomaly_scores.len(), 3);
    }

    #[test]
    fn all_anomalous_batch_has_finite_loss() {
        let options = CvddOptions {
            context_regularization: 0.0,
            ..CvddOptions::default()
        };
        let mut m = model(options);
        let out = m.forward(&batch(Some(vec![1, 1, 1]))).unwrap();
        assert_eq!(out.loss.item(), 0.0);
        assert!(out.anomaly_scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn anomalous_examples_are_left_out_of_the_loss() {
        let options = CvddOptions {
            context_regularization: 0.0,
            ..CvddOptions::default()
        };
        let mut m = model(options);
        let out = m.forward(&batch(Some(vec![0, 1, 1]))).unwrap();
        // alpha = 0 gives uniform head weights, so the loss is the first score
        assert!((out.loss.item() - out.anomaly_scores[0]).abs() < 1e-6);

        let mut keep_all = model(CvddOptions {
            context_regularization: 0.0,
            train_without_anomaly: false,
            ..CvddOptions::default()
        });
        let out = keep_all.forward(&batch(Some(vec![0, 1, 1]))).unwrap();
        let mean = out.anomaly_scores.mean().unwrap();
        assert!((out.loss.item() - mean).abs() < 1e-6);
    }

    #[test]
    fn identical_tokens_give_identical_scores() {
        let mut m = model(CvddOptions::default());
        let emb = Array3::from_elem((2, 3, DIM), 0.7f32);
        let mask = Array2::from_elem((2, 3), true);
        let out = m
            .forward(&Batch::new(Tensor::new(emb.into_dyn(), false), mask, None).unwrap())
            .unwrap();
        assert_eq!(out.distances.row(0), out.distances.row(1));
    }

    #[test]
    fn auc_is_accumulated_only_with_labels() {
        let mut m = model(CvddOptions::default());
        m.forward(&batch(None)).unwrap();
        assert_eq!(m.metrics(false)["auc"], 0.5);
        m.forward(&batch(Some(vec![0, 1, 0]))).unwrap();
        let auc = m.metrics(true)["auc"];
        assert!((0.0..=1.0).contains(&auc));
        assert!(m.auc.is_empty());
    }

    #[test]
    fn mismatched_widths_fail_construction() {
        let mut rng = StdRng::seed_from_u64(0);
        let embedder = Embedding::new(4, 5, false, &mut rng);
        let err = Cvdd::new(
            Box::new(embedder),
            Box::new(PassThroughEncoder::new(3)),
            Box::new(PassThroughEncoder::new(3)),
            CvddOptions::default(),
            &mut rng,
        );
        match err {
            Err(CvddError::DimensionMismatch { first_dim, second_dim, .. }) => {
                assert_eq!((first_dim, second_dim), (5, 3));
            }
            _ => panic!("expected a dimension mismatch"),
        }
    }

    #[test]
    fn unknown_anomaly_label_is_a_config_error() {
        let options = CvddOptions {
            anomaly_label: "spam".into(),
            ..CvddOptions::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = Cvdd::new(
            Box::new(Embedding::new(4, 2, false, &mut rng)),
            Box::new(PassThroughEncoder::new(2)),
            Box::new(PassThroughEncoder::new(2)),
            options,
            &mut rng,
        );
        assert!(matches!(err, Err(CvddError::Config(_))));
    }

    #[test]
    fn bank_gradient_matches_finite_differences() {
        let options = CvddOptions {
            distance_weight: 0.5,
            context_regularization: 0.3,
            ..CvddOptions::default()
        };
        let mut m = model(options);
        let b = batch(None);
        let out = m.forward(&b).unwrap();
        out.loss.backward();
        let grad = m.bank.vectors().grad().unwrap();

        let eps = 1e-2f32;
        for (h, c) in [(0, 0), (1, 2), (0, 1)] {
            let bank = m.bank.vectors().clone();
            bank.lock().data[[h, c]] += eps;
            let plus = m.forward(&b).unwrap().loss.item();
            bank.lock().data[[h, c]] -= 2.0 * eps;
            let minus = m.forward(&b).unwrap().loss.item();
            bank.lock().data[[h, c]] += eps;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (numeric - grad[[h, c]]).abs() < 1e-2,
                "bank[{}, {}]: numeric {} vs analytic {}",
                h,
                c,
                numeric,
                grad[[h, c]]
            );
        }
    }

    #[test]
    fn human_readable_drops_padding() {
        let m = model(CvddOptions::default());
        let mut vocab = Vocabulary::default();
        vocab.add_token("hello");
        vocab.add_token("world");
        let output = CvddOutput {
            loss: Tensor::scalar(0.0),
            anomaly_scores: array![0.1],
            distances: array![[0.1, 0.1]],
            token_ids: Some(array![[2, 3, 1, 0]]),
        };
        assert_eq!(
            m.make_output_human_readable(&output, &vocab),
            vec![vec!["hello", "world", "@@UNKNOWN@@"]]
        );
    }
}
