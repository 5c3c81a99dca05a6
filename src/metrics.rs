use crate::config::ModelConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 訓練メトリクス
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainingMetrics {
    /// エポックごとの平均損失
    pub loss_history: Vec<f32>,
    pub final_loss: f32,
    pub epochs: usize,
    pub global_steps: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
}

/// メタデータ
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
    pub crate_version: String,
    pub trained_at: String,
}

/// 統合メトリクスファイル
#[derive(Serialize, Deserialize, Debug)]
pub struct MetricsFile {
    pub model_config: ModelConfig,
    pub training: TrainingMetrics,
    pub metadata: Metadata,
}

/// metrics.jsonを保存
pub fn save_metrics(
    save_dir: &Path,
    model_config: &ModelConfig,
    training_metrics: &TrainingMetrics,
) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    let metrics_file = MetricsFile {
        model_config: model_config.clone(),
        training: training_metrics.clone(),
        metadata: Metadata {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            trained_at: chrono::Local::now().to_rfc3339(),
        },
    };

    let path = save_dir.join("metrics.json");
    fs::write(&path, serde_json::to_string_pretty(&metrics_file)?)?;
    tracing::info!("メトリクスを保存: {}", path.display());

    Ok(())
}
