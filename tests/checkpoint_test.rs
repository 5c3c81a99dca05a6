use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use seq2seq_chatbot::checkpoint::{load_checkpoint, load_config, save_checkpoint};
use seq2seq_chatbot::config::{ModelConfig, TrainingConfig};
use seq2seq_chatbot::data::{Batch, Corpus};
use seq2seq_chatbot::metrics::{save_metrics, MetricsFile, TrainingMetrics};
use seq2seq_chatbot::seq2seq::Seq2SeqModel;
use seq2seq_chatbot::session::{Fetched, Session};
use seq2seq_chatbot::training::train;
use seq2seq_chatbot::vocabulary::Vocabulary;
use std::fs;
use std::path::PathBuf;

type TrainingBackend = Autodiff<NdArray>;

/// テスト用の一時ディレクトリを作成（テストごとに別名）
fn create_test_dir(name: &str) -> PathBuf {
    let test_dir = std::env::temp_dir().join(format!(
        "seq2seq_chatbot_{}_{}",
        name,
        std::process::id()
    ));
    if test_dir.exists() {
        fs::remove_dir_all(&test_dir).ok();
    }
    fs::create_dir_all(&test_dir).unwrap();
    test_dir
}

/// テスト用の一時ディレクトリを削除
fn cleanup_test_dir(test_dir: &PathBuf) {
    if test_dir.exists() {
        fs::remove_dir_all(test_dir).ok();
    }
}

/// テンソル間の近似一致を検証
fn assert_tensors_close<B: Backend>(a: &Tensor<B, 2>, b: &Tensor<B, 2>, tolerance: f32) -> bool {
    let diff = (a.clone() - b.clone()).abs();
    let diff_data: Vec<f32> = diff.to_data().to_vec().unwrap();
    let max_diff = diff_data.iter().copied().fold(0.0_f32, f32::max);
    max_diff < tolerance
}

fn toy_corpus() -> Corpus {
    let pairs = [
        ("hi", "hello"),
        ("how are you", "i am fine"),
        ("bye", "see you"),
    ];
    let vocabulary = Vocabulary::from_sentences(pairs.iter().flat_map(|(q, a)| [*q, *a]));
    Corpus::from_pairs(&pairs, vocabulary, 4, 6)
}

fn small_config() -> ModelConfig {
    ModelConfig::new()
        .with_hidden_size(16)
        .with_num_layers(2)
        .with_max_length_enco(4)
        .with_max_length_deco(6)
        .with_embedding_size(8)
        .with_softmax_samples(5)
}

fn infer(session: &mut Session<TrainingBackend>, batch: &Batch) -> Vec<Tensor<NdArray, 2>> {
    let (ops, feed) = session.model().step(batch).expect("step失敗");
    match session.run(&ops, &feed).expect("推論失敗") {
        Fetched::Outputs(outputs) => outputs,
        Fetched::Training { .. } => panic!("推論モードで損失が返った"),
    }
}

#[test]
fn test_checkpoint_roundtrip_ndarray() {
    println!("=== テスト: モデル保存/読み込み（NdArray） ===");

    let device = Default::default();
    let test_dir = create_test_dir("roundtrip");
    let corpus = toy_corpus();

    // 推論モードのモデルを作成して保存
    let config = small_config().with_test(true);
    let model = Seq2SeqModel::<TrainingBackend>::new(&config, &corpus.vocabulary, &device)
        .expect("モデル作成失敗");
    save_checkpoint(&model, &corpus.vocabulary, &test_dir).expect("モデル保存失敗");

    assert!(test_dir.join("model.bin").exists(), "model.binが存在しません");
    assert!(test_dir.join("config.json").exists(), "config.jsonが存在しません");
    assert!(test_dir.join("vocabulary.json").exists(), "vocabulary.jsonが存在しません");

    let batch = corpus
        .vocabulary
        .sentence_to_batch("how are you", config.max_length_enco)
        .expect("エンコード失敗");

    let mut before = Session::new(model);
    let output_before = infer(&mut before, &batch);

    // 読み込み後の出力
    let (loaded, vocabulary) =
        load_checkpoint::<TrainingBackend>(&test_dir, true, &device).expect("モデル読み込み失敗");
    assert_eq!(vocabulary, corpus.vocabulary);
    assert_eq!(loaded.config().hidden_size, config.hidden_size);
    assert_eq!(loaded.config().softmax_samples, config.softmax_samples);
    assert!(loaded.projection().is_some());

    let mut after = Session::new(loaded);
    let output_after = infer(&mut after, &batch);

    assert_eq!(output_before.len(), output_after.len());
    for (a, b) in output_before.iter().zip(&output_after) {
        assert!(assert_tensors_close(a, b, 1e-5), "保存前後で出力が異なります");
    }

    println!("✓ 保存前後で出力が一致");
    cleanup_test_dir(&test_dir);
}

#[test]
fn test_training_checkpoint_loads_in_inference_mode() {
    println!("=== テスト: 訓練→保存→推論モードで読み込み ===");

    let device = Default::default();
    let test_dir = create_test_dir("train_then_infer");
    let corpus = toy_corpus();

    let model = Seq2SeqModel::<TrainingBackend>::new(&small_config(), &corpus.vocabulary, &device)
        .expect("モデル作成失敗");
    let mut session = Session::new(model);

    let training_config = TrainingConfig::new()
        .with_batch_size(2)
        .with_num_epochs(2)
        .with_save_every(0);
    let metrics = train(&mut session, &corpus, &training_config, Some(test_dir.as_path())).expect("訓練失敗");

    // 3サンプル・バッチ2 → 1エポック2ステップ
    assert_eq!(metrics.loss_history.len(), 2);
    assert_eq!(metrics.global_steps, 4);
    assert!(metrics.final_loss.is_finite());

    save_metrics(&test_dir, session.model().config(), &metrics).expect("メトリクス保存失敗");
    let metrics_json = fs::read_to_string(test_dir.join("metrics.json")).expect("metrics.jsonがない");
    let metrics_file: MetricsFile = serde_json::from_str(&metrics_json).expect("metrics.jsonの解析失敗");
    assert_eq!(metrics_file.training, metrics);

    // 保存済み設定は訓練モードのまま
    let saved_config = load_config(&test_dir).expect("設定読み込み失敗");
    assert!(!saved_config.test);

    let (loaded, vocabulary) =
        load_checkpoint::<TrainingBackend>(&test_dir, true, &device).expect("モデル読み込み失敗");
    assert!(loaded.config().test);
    assert!(loaded
        .network()
        .decoder_cells()
        .layers()
        .iter()
        .all(|layer| !layer.has_dropout()));

    let mut inference = Session::new(loaded);
    let batch = vocabulary
        .sentence_to_batch("hi", saved_config.max_length_enco)
        .expect("エンコード失敗");
    let outputs = infer(&mut inference, &batch);
    assert_eq!(outputs.len(), saved_config.max_length_deco);
    assert_eq!(outputs[0].dims(), [1, vocabulary.len()]);

    println!("✓ 訓練チェックポイントを推論モードで利用");
    cleanup_test_dir(&test_dir);
}

#[test]
fn test_load_missing_checkpoint_fails() {
    let test_dir = create_test_dir("missing");
    let result = load_checkpoint::<TrainingBackend>(&test_dir, true, &Default::default());
    assert!(result.is_err());
    cleanup_test_dir(&test_dir);
}

#[test]
fn test_metrics_roundtrip_preserves_loss_history() {
    let test_dir = create_test_dir("metrics");
    let metrics = TrainingMetrics {
        loss_history: vec![3.2, 2.5, 1.9],
        final_loss: 1.9,
        epochs: 3,
        global_steps: 12,
        learning_rate: 0.002,
        batch_size: 4,
    };

    save_metrics(&test_dir, &small_config(), &metrics).expect("メトリクス保存失敗");
    let json = fs::read_to_string(test_dir.join("metrics.json")).expect("metrics.jsonがない");
    let metrics_file: MetricsFile = serde_json::from_str(&json).expect("解析失敗");

    assert_eq!(metrics_file.training, metrics);
    assert_eq!(metrics_file.model_config.hidden_size, 16);
    assert!(!metrics_file.metadata.trained_at.is_empty());

    cleanup_test_dir(&test_dir);
}
