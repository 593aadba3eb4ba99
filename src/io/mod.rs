//! Corpus reading, token vocabulary and batching.

pub mod dataloader;
pub mod reader;
pub mod vocab;

pub use dataloader::{Batch, BatchIterator};
pub use reader::{Instance, OneClassReader, ReaderConfig, Stopwords, WhitespaceTokenizer};
pub use vocab::{Vocabulary, PADDING_INDEX, PADDING_TOKEN, UNKNOWN_INDEX, UNKNOWN_TOKEN};
