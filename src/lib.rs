//! Context Vector Data Description (CVDD) for one-class text anomaly detection.
//!
//! A document is embedded, encoded and pooled by several attention heads into
//! one context vector per head. Each context vector is compared with a learned
//! reference vector for that head; the mean distance is the anomaly score.
//!
//! The crate carries its own small reverse-mode autograd engine on top of
//! `ndarray` ([`tensor`], [`autograd`], [`ops`]) so the model can be trained
//! end to end.

pub mod autograd;
pub mod config;
pub mod error;
pub mod io;
pub mod labels;
pub mod metrics;
pub mod nn;
pub mod ops;
pub mod predictor;
pub mod tensor;
pub mod training;

pub use config::{CvddConfig, TrainerConfig};
pub use error::{CvddError, Result};
pub use io::{Batch, BatchIterator, Instance, OneClassReader, ReaderConfig, Vocabulary};
pub use labels::{LabelSets, LabelVocabulary, Labels};
pub use metrics::Auc;
pub use nn::cvdd::CvddOptions;
pub use nn::{Cvdd, CvddOutput};
pub use predictor::AnomalyDetector;
pub use tensor::Tensor;
pub use training::{evaluate, EpochMetrics, Trainer};
