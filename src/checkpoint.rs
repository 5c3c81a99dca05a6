use crate::config::ModelConfig;
use crate::seq2seq::Seq2SeqModel;
use crate::vocabulary::Vocabulary;
use anyhow::{anyhow, Context, Result};
use burn::config::Config;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use std::fs;
use std::path::Path;

const MODEL_FILE: &str = "model";
const CONFIG_FILE: &str = "config.json";
const VOCABULARY_FILE: &str = "vocabulary.json";

/// 重み・設定・語彙を保存
pub fn save_checkpoint<B: Backend>(
    model: &Seq2SeqModel<B>,
    vocabulary: &Vocabulary,
    save_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(save_dir)
        .with_context(|| format!("failed to create {}", save_dir.display()))?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .network()
        .clone()
        .save_file(save_dir.join(MODEL_FILE), &recorder)
        .map_err(|e| anyhow!("モデル保存エラー: {:?}", e))?;

    model
        .config()
        .save(save_dir.join(CONFIG_FILE))
        .with_context(|| format!("failed to write {}", CONFIG_FILE))?;
    vocabulary.save(&save_dir.join(VOCABULARY_FILE))?;

    tracing::info!("モデルを保存: {}", save_dir.display());
    Ok(())
}

/// 保存済みの設定を読み込み、モードだけ差し替えてモデルを再構築
pub fn load_checkpoint<B: Backend>(
    load_dir: &Path,
    test: bool,
    device: &B::Device,
) -> Result<(Seq2SeqModel<B>, Vocabulary)> {
    let config = load_config(load_dir)?.with_test(test);
    let vocabulary = Vocabulary::load(&load_dir.join(VOCABULARY_FILE))?;
    let mut model = Seq2SeqModel::<B>::new(&config, &vocabulary, device)?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let network = model
        .network()
        .clone()
        .load_file(load_dir.join(MODEL_FILE), &recorder, device)
        .map_err(|e| anyhow!("モデル読み込みエラー: {:?}", e))?;
    model.set_network(network);

    tracing::info!(
        "モデルを読み込み（{}バックエンド）: {}",
        std::any::type_name::<B>(),
        load_dir.display()
    );
    Ok((model, vocabulary))
}

pub fn load_config(load_dir: &Path) -> Result<ModelConfig> {
    ModelConfig::load(load_dir.join(CONFIG_FILE))
        .map_err(|e| anyhow!("設定読み込みエラー: {:?}", e))
}
