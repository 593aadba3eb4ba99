use crate::error::{CvddError, Result};
use crate::io::{Batch, Instance, OneClassReader, Vocabulary};
use crate::nn::Cvdd;
use log::warn;
use serde_json::{json, Map, Value};

/// Runs raw text through a trained model and optionally flags anomalies.
pub struct AnomalyDetector {
    model: Cvdd,
    reader: OneClassReader,
    vocab: Vocabulary,
    threshold: Option<f32>,
}

impl AnomalyDetector {
    pub fn new(model: Cvdd, reader: OneClassReader, vocab: Vocabulary, threshold: Option<f32>) -> Self {
        AnomalyDetector {
            model,
            reader,
            vocab,
            threshold,
        }
    }

    pub fn threshold(&self) -> Option<f32> {
        self.threshold
    }

    pub fn model(&self) -> &Cvdd {
        &self.model
    }

    /// Adds `"anomaly": score > threshold` when a threshold is configured.
    ///
    /// Without a threshold, or without a numeric `anomaly_score`, the record is
    /// returned unchanged.
    pub fn detect_anomaly(&self, mut record: Map<String, Value>) -> Map<String, Value> {
        let Some(threshold) = self.threshold else {
            return record;
        };
        match record.get("anomaly_score").and_then(Value::as_f64) {
            Some(score) => {
                record.insert("anomaly".to_string(), Value::Bool(score > threshold as f64));
            }
            None => warn!("record has no numeric anomaly_score; leaving it unflagged"),
        }
        record
    }

    /// Scores one `{"text": ...}` record.
    pub fn predict_json(&mut self, input: &Value) -> Result<Value> {
        let mut outputs = self.predict_batch_json(std::slice::from_ref(input))?;
        outputs
            .pop()
            .ok_or_else(|| CvddError::invalid_input("no prediction produced"))
    }

    pub fn predict_batch_json(&mut self, inputs: &[Value]) -> Result<Vec<Value>> {
        let text_key = self.reader.config().text_key.clone();
        let instances = inputs
            .iter()
            .map(|input| {
                let text = input.get(&text_key).and_then(Value::as_str).ok_or_else(|| {
                    CvddError::invalid_input(format!("record has no string \"{}\" field: {}", text_key, input))
                })?;
                Ok(self.reader.text_to_instance(text, None))
            })
            .collect::<Result<Vec<_>>>()?;
        self.predict_instances(&instances)
    }

    pub fn predict_instances(&mut self, instances: &[Instance]) -> Result<Vec<Value>> {
        if instances.is_empty() {
            return Ok(Vec::new());
        }
        let refs: Vec<&Instance> = instances.iter().collect();
        let embedder = self.model.embedder();
        let batch = Batch::from_instances(
            &refs,
            &self.vocab,
            self.model.label_vocab(),
            embedder.as_ref(),
        )?;
        let output = self.model.forward(&batch)?;
        let tokens = self.model.make_output_human_readable(&output, &self.vocab);

        Ok(output
            .anomaly_scores
            .iter()
            .zip(tokens)
            .map(|(&score, tokens)| {
                let mut record = Map::new();
                record.insert("anomaly_score".to_string(), json!(score));
                record.insert("tokens".to_string(), json!(tokens));
                Value::Object(self.detect_anomaly(record))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReaderConfig;
    use crate::labels::LabelSets;
    use crate::nn::cvdd::CvddOptions;
    use crate::nn::{Embedding, PassThroughEncoder};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn detector(threshold: Option<f32>) -> AnomalyDetector {
        let mut rng = StdRng::seed_from_u64(2);
        let mut vocab = Vocabulary::default();
        for token in ["this", "is", "a", "test"] {
            vocab.add_token(token);
        }
        let model = Cvdd::new(
            Box::new(Embedding::new(vocab.len(), 4, true, &mut rng)),
            Box::new(PassThroughEncoder::new(4)),
            Box::new(PassThroughEncoder::new(4)),
            CvddOptions::default(),
            &mut rng,
        )
        .unwrap();
        let reader = OneClassReader::new(LabelSets::new(["pos"], ["neg"]).unwrap(), ReaderConfig::default());
        AnomalyDetector::new(model, reader, vocab, threshold)
    }

    fn scored(score: f64) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("anomaly_score".to_string(), json!(score));
        record
    }

    #[test]
    fn threshold_flags_high_scores() {
        let d = detector(Some(0.3));
        assert_eq!(d.detect_anomaly(scored(0.5))["anomaly"], Value::Bool(true));
        assert_eq!(d.detect_anomaly(scored(0.1))["anomaly"], Value::Bool(false));
    }

    #[test]
    fn no_threshold_means_no_anomaly_key() {
        let d = detector(None);
        assert!(!d.detect_anomaly(scored(0.99)).contains_key("anomaly"));
    }

    #[test]
    fn predict_json_emits_boolean_flag() {
        let mut d = detector(Some(0.3));
        let out = d.predict_json(&json!({"text": "this is a test sentence"})).unwrap();
        assert!(out["anomaly"].is_boolean());
        assert!(out["anomaly_score"].is_number());
        assert_eq!(out["tokens"], json!(["this", "is", "a", "test", "@@UNKNOWN@@"]));
    }

    #[test]
    fn missing_text_is_invalid_input() {
        let mut d = detector(None);
        assert!(matches!(
            d.predict_json(&json!({"body": "x"})),
            Err(CvddError::InvalidInput(_))
        ));
    }
}
