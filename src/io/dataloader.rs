use crate::error::{CvddError, Result};
use crate::io::reader::Instance;
use crate::io::vocab::{Vocabulary, PADDING_INDEX};
use crate::labels::{LabelVocabulary, Labels};
use crate::nn::TextEmbedder;
use crate::tensor::Tensor;
use log::{debug, info};
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;

/// A padded batch ready for the model.
pub struct Batch {
    /// `(B, T, E)` token embeddings.
    pub token_embeddings: Tensor,
    /// `(B, T)`; `true` marks real tokens.
    pub mask: Array2<bool>,
    /// `(B,)` indices into the label vocabulary.
    pub label: Option<Labels>,
    /// `(B, T)` vocabulary ids, kept for human-readable output.
    pub token_ids: Option<Array2<usize>>,
}

impl Batch {
    pub fn new(token_embeddings: Tensor, mask: Array2<bool>, label: Option<Labels>) -> Result<Self> {
        let batch = Batch {
            token_embeddings,
            mask,
            label,
            token_ids: None,
        };
        batch.validate()?;
        Ok(batch)
    }

    pub fn with_token_ids(mut self, token_ids: Array2<usize>) -> Result<Self> {
        if token_ids.dim() != self.mask.dim() {
            return Err(CvddError::shape(format!(
                "token ids {:?} do not match mask {:?}",
                token_ids.dim(),
                self.mask.dim()
            )));
        }
        self.token_ids = Some(token_ids);
        Ok(self)
    }

    /// Checks that mask, embeddings and labels agree on `(B, T)`, that the
    /// batch is non-empty and that every label indexes the label vocabulary.
    pub fn validate(&self) -> Result<()> {
        let shape = self.token_embeddings.shape();
        let (b, t) = self.mask.dim();
        if b == 0 {
            return Err(CvddError::shape("batch has no rows"));
        }
        if shape.len() != 3 || shape[0] != b || shape[1] != t {
            return Err(CvddError::shape(format!(
                "token embeddings {:?} do not match mask ({}, {})",
                shape, b, t
            )));
        }
        if let Some(label) = &self.label {
            if label.0.ndim() != 1 || label.len() != b {
                return Err(CvddError::shape(format!(
                    "labels {:?} do not match batch size {}",
                    label.0.shape(),
                    b
                )));
            }
            let num_labels = LabelVocabulary::default().len() as i64;
            if let Some(bad) = label.0.iter().find(|&&l| l < 0 || l >= num_labels) {
                return Err(CvddError::shape(format!(
                    "label index {} outside the label vocabulary of size {}",
                    bad, num_labels
                )));
            }
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.mask.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.mask.ncols()
    }

    pub fn embedding_dim(&self) -> usize {
        self.token_embeddings.shape().get(2).copied().unwrap_or(0)
    }

    /// Pads, indexes and embeds `instances`.
    ///
    /// Labels are attached only when every instance carries one.
    pub fn from_instances(
        instances: &[&Instance],
        vocab: &Vocabulary,
        label_vocab: &LabelVocabulary,
        embedder: &dyn TextEmbedder,
    ) -> Result<Self> {
        if instances.is_empty() {
            return Err(CvddError::invalid_input("cannot build an empty batch"));
        }
        let seq_len = instances.iter().map(|i| i.tokens.len()).max().unwrap_or(0).max(1);
        let mut token_ids = Array2::from_elem((instances.len(), seq_len), PADDING_INDEX);
        let mut mask = Array2::from_elem((instances.len(), seq_len), false);
        for (row, instance) in instances.iter().enumerate() {
            for (col, token) in instance.tokens.iter().enumerate() {
                token_ids[[row, col]] = vocab.index(token);
                mask[[row, col]] = true;
            }
        }

        let labelled = instances.iter().filter(|i| i.label.is_some()).count();
        let label = if labelled == instances.len() {
            let indices = instances
                .iter()
                .map(|i| {
                    let raw = i.label.as_deref().unwrap_or_default();
                    label_vocab
                        .index(raw)
                        .map(|idx| idx as i64)
                        .ok_or_else(|| CvddError::invalid_input(format!("unknown label {:?}", raw)))
                })
                .collect::<Result<Vec<_>>>()?;
            Some(Labels::from_vec(indices))
        } else {
            if labelled > 0 {
                debug!(
                    "dropping labels for batch with {} of {} instances labelled",
                    labelled,
                    instances.len()
                );
            }
            None
        };

        let token_embeddings = embedder.embed(&token_ids)?;
        Batch::new(token_embeddings, mask, label)?.with_token_ids(token_ids)
    }
}

/// Yields padded, embedded batches over a slice of instances.
pub struct BatchIterator<'a> {
    instances: &'a [Instance],
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    vocab: &'a Vocabulary,
    label_vocab: &'a LabelVocabulary,
    embedder: &'a dyn TextEmbedder,
}

impl<'a> BatchIterator<'a> {
    pub fn new(
        instances: &'a [Instance],
        batch_size: usize,
        vocab: &'a Vocabulary,
        label_vocab: &'a LabelVocabulary,
        embedder: &'a dyn TextEmbedder,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(CvddError::config("batch_size must be positive"));
        }
        info!(
            "BatchIterator created: instances={} batch_size={}",
            instances.len(),
            batch_size
        );
        Ok(BatchIterator {
            instances,
            order: (0..instances.len()).collect(),
            cursor: 0,
            batch_size,
            vocab,
            label_vocab,
            embedder,
        })
    }

    /// Visits instances in a random order drawn from `rng`.
    pub fn shuffled(mut self, rng: &mut impl Rng) -> Self {
        self.order.shuffle(rng);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.instances.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchIterator<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let chunk: Vec<&Instance> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.instances[i])
            .collect();
        self.cursor = end;
        Some(Batch::from_instances(&chunk, self.vocab, self.label_vocab, self.embedder))
    }
}
