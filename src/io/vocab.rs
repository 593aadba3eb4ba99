use crate::io::reader::Instance;
use std::collections::HashMap;

pub const PADDING_TOKEN: &str = "@@PADDING@@";
pub const UNKNOWN_TOKEN: &str = "@@UNKNOWN@@";
pub const PADDING_INDEX: usize = 0;
pub const UNKNOWN_INDEX: usize = 1;

/// Token namespace: padding is always 0, unknown is always 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    token_to_index: HashMap<String, usize>,
    index_to_token: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        let index_to_token = vec![PADDING_TOKEN.to_string(), UNKNOWN_TOKEN.to_string()];
        let token_to_index = index_to_token
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Vocabulary {
            token_to_index,
            index_to_token,
        }
    }
}

impl Vocabulary {
    /// Builds a vocabulary from every token seen at least `min_count` times.
    ///
    /// Tokens are added in order of first appearance, so the result is deterministic.
    pub fn from_instances<'a, I>(instances: I, min_count: usize) -> Self
    where
        I: IntoIterator<Item = &'a Instance>,
    {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for instance in instances {
            for token in &instance.tokens {
                let count = counts.entry(token.as_str()).or_insert(0);
                if *count == 0 {
                    order.push(token.as_str());
                }
                *count += 1;
            }
        }
        let mut vocab = Vocabulary::default();
        for token in order {
            if counts[token] >= min_count {
                vocab.add_token(token);
            }
        }
        log::info!(
            "Vocabulary built: tokens={} min_count={}",
            vocab.len(),
            min_count
        );
        vocab
    }

    pub fn add_token(&mut self, token: &str) -> usize {
        if let Some(&index) = self.token_to_index.get(token) {
            return index;
        }
        let index = self.index_to_token.len();
        self.index_to_token.push(token.to_string());
        self.token_to_index.insert(token.to_string(), index);
        index
    }

    /// Index of `token`, falling back to the unknown index.
    pub fn index(&self, token: &str) -> usize {
        self.token_to_index.get(token).copied().unwrap_or(UNKNOWN_INDEX)
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.index_to_token.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.index_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_token.is_empty()
    }
}
