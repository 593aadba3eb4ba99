use cvdd::io::{OneClassReader, ReaderConfig};
use cvdd::labels::LabelSets;
use cvdd::CvddError;
use std::io::Write;

fn reader(config: ReaderConfig) -> OneClassReader {
    OneClassReader::new(LabelSets::new(["pos"], ["neg"]).unwrap(), config)
}

#[test]
fn test_reads_fixture_corpus() {
    let _ = env_logger::builder().is_test(true).try_init();
    let instances = reader(ReaderConfig::default())
        .read("tests/fixtures/corpus.jsonl")
        .unwrap();
    assert_eq!(instances.len(), 8);
    let normal = instances.iter().filter(|i| i.label.as_deref() == Some("normal")).count();
    let anomalous = instances.iter().filter(|i| i.label.as_deref() == Some("anomalous")).count();
    assert_eq!((normal, anomalous), (5, 2));
    assert!(instances.iter().all(|i| !i.text.contains("stock")));
    assert_eq!(instances.last().unwrap().label, None);
}

#[test]
fn test_three_line_scenario() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"text": "x", "label": "pos"}}"#).unwrap();
    writeln!(file, r#"{{"text": "y", "label": "neg"}}"#).unwrap();
    writeln!(file, r#"{{"text": "z", "label": "irrelevant"}}"#).unwrap();
    let instances = reader(ReaderConfig::default()).read(file.path()).unwrap();
    let labels: Vec<_> = instances.iter().map(|i| i.label.clone().unwrap()).collect();
    assert_eq!(labels, vec!["normal", "anomalous"]);
}

#[test]
fn test_missing_text_aborts_with_line_number() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"text": "fine", "label": "pos"}}"#).unwrap();
    writeln!(file, r#"{{"body": "oops", "label": "pos"}}"#).unwrap();
    let err = reader(ReaderConfig::default()).read(file.path()).unwrap_err();
    match &err {
        CvddError::Parse { line, content, .. } => {
            assert_eq!(*line, 2);
            assert!(content.contains("oops"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().contains("line number 2"));
}

#[test]
fn test_custom_keys_and_preprocessing() {
    let config = ReaderConfig {
        text_key: "body".into(),
        label_key: "tag".into(),
        lowercase: true,
        stopwords: vec!["the".into()],
    };
    let instances = reader(config)
        .read_from(r#"{"body": "The Film The End", "tag": "pos"}"#.as_bytes())
        .unwrap();
    assert_eq!(instances[0].tokens, vec!["film", "end"]);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = reader(ReaderConfig::default()).read("tests/fixtures/nope.jsonl").unwrap_err();
    assert!(matches!(err, CvddError::Io(_)));
}
