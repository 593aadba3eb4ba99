//! Epoch loop: forward, backward, optional clipping, optimizer step.

use crate::config::TrainerConfig;
use crate::error::{CvddError, Result};
use crate::io::{Batch, BatchIterator, Instance, Vocabulary};
use crate::nn::{Adam, Cvdd, Optimizer};
use crate::tensor::Tensor;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Summary of one pass over the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean batch loss.
    pub loss: f32,
    pub auc: f32,
}

pub struct Trainer {
    optimizer: Box<dyn Optimizer>,
    num_epochs: usize,
    batch_size: usize,
    grad_clip: Option<f32>,
    rng: Option<StdRng>,
}

impl Trainer {
    pub fn new(optimizer: Box<dyn Optimizer>, num_epochs: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(CvddError::config("batch_size must be positive"));
        }
        Ok(Trainer {
            optimizer,
            num_epochs,
            batch_size,
            grad_clip: None,
            rng: None,
        })
    }

    /// Adam at the configured learning rate, with clipping and shuffling as configured.
    pub fn from_config(config: &TrainerConfig) -> Result<Self> {
        let mut trainer = Trainer::new(
            Box::new(Adam::with_lr(config.learning_rate)),
            config.num_epochs,
            config.batch_size,
        )?;
        trainer.grad_clip = config.grad_clip;
        if config.shuffle {
            trainer.rng = Some(StdRng::seed_from_u64(config.seed));
        }
        Ok(trainer)
    }

    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.grad_clip = Some(max_norm);
        self
    }

    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// One optimization step on `batch`; returns the batch loss.
    pub fn train_batch(&mut self, model: &mut Cvdd, batch: &Batch, parameters: &[Tensor]) -> Result<f32> {
        self.optimizer.zero_grad(parameters);
        let output = model.forward(batch)?;
        output.loss.backward();
        if let Some(max_norm) = self.grad_clip {
            let norm = self.optimizer.clip_gradients(parameters, max_norm);
            debug!("gradient norm before clipping: {}", norm);
        }
        self.optimizer.step(parameters);
        self.optimizer.zero_grad(parameters);
        Ok(output.loss.item())
    }

    /// Trains for the configured number of epochs, re-embedding every batch so
    /// embedding updates are picked up.
    pub fn train(
        &mut self,
        model: &mut Cvdd,
        instances: &[Instance],
        vocab: &Vocabulary,
    ) -> Result<Vec<EpochMetrics>> {
        let parameters = model.parameters();
        let embedder = model.embedder();
        let label_vocab = model.label_vocab().clone();
        info!(
            "Trainer starting: epochs={} batch_size={} instances={} parameters={} lr={}",
            self.num_epochs,
            self.batch_size,
            instances.len(),
            parameters.len(),
            self.optimizer.learning_rate()
        );

        let mut history = Vec::with_capacity(self.num_epochs);
        for epoch in 0..self.num_epochs {
            let mut batches = BatchIterator::new(
                instances,
                self.batch_size,
                vocab,
                &label_vocab,
                embedder.as_ref(),
            )?;
            if let Some(rng) = self.rng.as_mut() {
                batches = batches.shuffled(rng);
            }

            let mut total = 0.0f32;
            let mut count = 0usize;
            for batch in batches {
                total += self.train_batch(model, &batch?, &parameters)?;
                count += 1;
            }
            let metrics = EpochMetrics {
                epoch,
                loss: total / count.max(1) as f32,
                auc: model.metrics(true).get("auc").copied().unwrap_or(0.5),
            };
            info!(
                "epoch {}: loss={:.6} auc={:.4}",
                metrics.epoch, metrics.loss, metrics.auc
            );
            history.push(metrics);
        }
        Ok(history)
    }
}

/// Loss and AUC of `model` over `batches` without updating anything.
pub fn evaluate<I>(model: &mut Cvdd, batches: I) -> Result<EpochMetrics>
where
    I: IntoIterator<Item = Result<Batch>>,
{
    model.metrics(true);
    let mut total = 0.0f32;
    let mut count = 0usize;
    for batch in batches {
        total += model.forward(&batch?)?.loss.item();
        count += 1;
    }
    Ok(EpochMetrics {
        epoch: 0,
        loss: total / count.max(1) as f32,
        auc: model.metrics(true).get("auc").copied().unwrap_or(0.5),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::SGD;

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(Trainer::new(Box::new(SGD::new(0.1, 0.0)), 1, 0).is_err());
    }

    #[test]
    fn from_config_copies_settings() {
        let config = TrainerConfig {
            grad_clip: Some(1.0),
            shuffle: false,
            ..TrainerConfig::default()
        };
        let trainer = Trainer::from_config(&config).unwrap();
        assert_eq!(trainer.grad_clip, Some(1.0));
        assert!(trainer.rng.is_none());
        assert_eq!(trainer.num_epochs, config.num_epochs);
    }
}
