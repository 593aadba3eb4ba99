use cvdd::io::{BatchIterator, OneClassReader, Vocabulary};
use cvdd::nn::Cvdd;
use cvdd::training::{evaluate, Trainer};
use cvdd::CvddConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

const CONFIG: &str = r#"{
    "normal_labels": ["pos"],
    "anomalous_labels": ["neg"],
    "embedding_dim": 6,
    "distance_weight": 1.0,
    "context_regularization": 0.1,
    "context_encoder": {"type": "pass_through", "dim": 6},
    "attention_encoder": {"type": "feedforward", "input_dim": 6, "hidden_dims": [4, 2], "activations": ["tanh", "linear"]},
    "trainer": {"batch_size": 4, "num_epochs": 30, "learning_rate": 0.05, "grad_clip": 5.0, "seed": 7}
}"#;

#[test]
fn tiny_cvdd_convergence() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = CvddConfig::from_json_str(CONFIG).unwrap();
    let reader = OneClassReader::new(config.label_sets().unwrap(), config.reader.clone());
    let instances: Vec<_> = reader
        .read("tests/fixtures/corpus.jsonl")
        .unwrap()
        .into_iter()
        .filter(|i| i.label.is_some())
        .collect();
    let vocab = Vocabulary::from_instances(&instances, config.min_token_count);

    let mut rng = StdRng::seed_from_u64(config.trainer.seed);
    let mut model = Cvdd::from_config(&config, &vocab, &mut rng).unwrap();
    let mut trainer = Trainer::from_config(&config.trainer).unwrap();
    let history = trainer.train(&mut model, &instances, &vocab).unwrap();

    assert_eq!(history.len(), 30);
    let first = history.first().unwrap().loss;
    let last = history.last().unwrap().loss;
    assert!(last.is_finite());
    assert!(last < first, "loss must decrease during training: {} -> {}", first, last);
    assert!(history.iter().all(|m| (0.0..=1.0).contains(&m.auc)));

    let embedder = model.embedder();
    let label_vocab = model.label_vocab().clone();
    let batches = BatchIterator::new(&instances, 8, &vocab, &label_vocab, embedder.as_ref()).unwrap();
    let eval = evaluate(&mut model, batches).unwrap();
    assert!(eval.loss.is_finite());
    assert!((0.0..=1.0).contains(&eval.auc));
}
