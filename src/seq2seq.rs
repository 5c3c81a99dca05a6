use crate::config::{Mode, ModelConfig};
use crate::data::{Batch, TextData};
use crate::graph::{FeedDict, FeedValue, Ops, Placeholder, Placeholders};
use crate::loss::{FullSoftmaxLoss, SampledSoftmaxLoss, SoftmaxLoss, SoftmaxLossFn};
use crate::model::Seq2SeqNetwork;
use crate::projection::ProjectionOp;
use anyhow::{bail, ensure, Result};
use burn::optim::AdamConfig;
use burn::prelude::*;

/// Adamの設定（学習率以外は固定）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
}

impl OptimizerSettings {
    pub fn adam(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn config(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon)
    }
}

/// 構築時に確定するグラフの形
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Graph {
    /// 損失と最小化オペレーター
    Training {
        loss: SoftmaxLoss,
        optimizer: OptimizerSettings,
    },
    /// 位置ごとの出力ロジット（射影ユニットがあれば射影後）
    Inference { output_projection: bool },
}

/// Seq2Seqチャットボットモデル
///
/// エンコーダー・デコーダー、プレースホルダー、損失または出力を持ち、
/// `step` でバッチを1パス分のオペレーター束と入力束縛に変換する。
#[derive(Debug)]
pub struct Seq2SeqModel<B: Backend> {
    config: ModelConfig,
    vocabulary_size: usize,
    go_token: i32,
    placeholders: Placeholders,
    network: Seq2SeqNetwork<B>,
    graph: Graph,
}

impl<B: Backend> Seq2SeqModel<B> {
    pub fn new(config: &ModelConfig, text_data: &impl TextData, device: &B::Device) -> Result<Self> {
        tracing::info!("モデル作成中...");

        config.validate()?;
        config.precision.check_backend::<B>()?;
        let vocabulary_size = text_data.vocabulary_size();
        let go_token = text_data.go_token();
        ensure!(vocabulary_size > 0, "vocabulary size must be positive");
        ensure!(
            go_token >= 0 && (go_token as usize) < vocabulary_size,
            "go token {} is outside the vocabulary (size {})",
            go_token,
            vocabulary_size
        );

        // 語彙サイズより少なくサンプルする場合のみsampled softmaxを使う
        let projection = config.use_sampled_softmax(vocabulary_size).then(|| {
            ProjectionOp::new(
                [vocabulary_size, config.hidden_size],
                "softmax_projection",
                config.precision,
                device,
            )
        });
        let output_projection = projection.is_some();

        let placeholders = Placeholders::new(config.max_length_enco, config.max_length_deco);
        let network = Seq2SeqNetwork::new(device, config, vocabulary_size, projection);

        let graph = match config.mode() {
            Mode::Inference => Graph::Inference { output_projection },
            Mode::Training => {
                let loss = if output_projection {
                    SoftmaxLoss::Sampled {
                        num_sampled: config.softmax_samples,
                        num_classes: vocabulary_size,
                    }
                } else {
                    SoftmaxLoss::Full
                };
                Graph::Training {
                    loss,
                    optimizer: OptimizerSettings::adam(config.learning_rate),
                }
            }
        };

        tracing::debug!(
            "グラフ: {:?}, プレースホルダー数 {}",
            graph,
            placeholders.len()
        );

        Ok(Self {
            config: config.clone(),
            vocabulary_size,
            go_token,
            placeholders,
            network,
            graph,
        })
    }

    /// 1パス分のオペレーター束と入力束縛を返す（実行はしない）
    pub fn step(&self, batch: &Batch) -> Result<(Ops, FeedDict)> {
        let mut feed = FeedDict::new();
        let max_enco = self.config.max_length_enco;
        let max_deco = self.config.max_length_deco;

        let batch_size = check_positions("encoder", &batch.encoder_seqs, max_enco, None)?;
        check_token_ids("encoder", &batch.encoder_seqs, self.vocabulary_size)?;
        bind_all(&mut feed, &self.placeholders.encoder_inputs, &batch.encoder_seqs, FeedValue::Int)?;

        match self.graph {
            Graph::Training { .. } => {
                check_positions("decoder", &batch.decoder_seqs, max_deco, Some(batch_size))?;
                check_positions("target", &batch.target_seqs, max_deco, Some(batch_size))?;
                check_positions("weight", &batch.weights, max_deco, Some(batch_size))?;
                check_token_ids("decoder", &batch.decoder_seqs, self.vocabulary_size)?;
                check_token_ids("target", &batch.target_seqs, self.vocabulary_size)?;

                let placeholders = &self.placeholders;
                bind_all(&mut feed, &placeholders.decoder_inputs, &batch.decoder_seqs, FeedValue::Int)?;
                bind_all(&mut feed, &placeholders.decoder_targets, &batch.target_seqs, FeedValue::Int)?;
                bind_all(&mut feed, &placeholders.decoder_weights, &batch.weights, FeedValue::Float)?;

                Ok((Ops::training(), feed))
            }
            Graph::Inference { .. } => {
                ensure!(
                    batch_size == 1,
                    "inference expects a batch of one sentence, got {}",
                    batch_size
                );
                // 2番目以降のデコーダー入力はネットワーク内部で前の出力から作られる
                feed.bind(self.placeholders.decoder_inputs[0], FeedValue::Int(vec![self.go_token]))?;

                Ok((Ops::inference(), feed))
            }
        }
    }

    /// 訓練時の損失関数（構築時に選ばれた種類を現在の重みで具体化）
    pub fn softmax_loss(&self) -> Result<Box<dyn SoftmaxLossFn<B> + '_>> {
        match self.graph {
            Graph::Training {
                loss: SoftmaxLoss::Full,
                ..
            } => Ok(Box::new(FullSoftmaxLoss)),
            Graph::Training {
                loss:
                    SoftmaxLoss::Sampled {
                        num_sampled,
                        num_classes,
                    },
                ..
            } => match self.network.projection() {
                Some(projection) => Ok(Box::new(SampledSoftmaxLoss::new(
                    projection,
                    num_sampled,
                    num_classes,
                ))),
                None => bail!("sampled softmax requires the softmax projection"),
            },
            Graph::Inference { .. } => bail!("inference graph has no loss"),
        }
    }

    pub fn mode(&self) -> Mode {
        self.config.mode()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    pub fn network(&self) -> &Seq2SeqNetwork<B> {
        &self.network
    }

    pub fn projection(&self) -> Option<&ProjectionOp<B>> {
        self.network.projection()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary_size
    }

    pub fn go_token(&self) -> i32 {
        self.go_token
    }

    /// オプティマイザー更新後の重みに差し替える
    pub fn set_network(&mut self, network: Seq2SeqNetwork<B>) {
        self.network = network;
    }
}

/// 位置数とバッチサイズの検査（バッチサイズを返す）
fn check_positions<T>(
    name: &str,
    positions: &[Vec<T>],
    expected_len: usize,
    expected_batch: Option<usize>,
) -> Result<usize> {
    ensure!(
        positions.len() == expected_len,
        "{} sequence has {} positions, expected {}",
        name,
        positions.len(),
        expected_len
    );

    let batch_size = expected_batch.unwrap_or_else(|| positions[0].len());
    ensure!(batch_size > 0, "{} batch is empty", name);

    if let Some(position) = positions.iter().position(|values| values.len() != batch_size) {
        bail!(
            "{} position {} has {} entries, expected batch size {}",
            name,
            position,
            positions[position].len(),
            batch_size
        );
    }

    Ok(batch_size)
}

/// すべてのIDが `[0, vocabulary_size)` に収まっているか
fn check_token_ids(name: &str, positions: &[Vec<i32>], vocabulary_size: usize) -> Result<()> {
    for (position, ids) in positions.iter().enumerate() {
        if let Some(&id) = ids
            .iter()
            .find(|&&id| id < 0 || id as usize >= vocabulary_size)
        {
            bail!(
                "{} position {} has token id {} outside the vocabulary (size {})",
                name,
                position,
                id,
                vocabulary_size
            );
        }
    }
    Ok(())
}

/// プレースホルダーiにバッチ要素iを束縛
fn bind_all<T: Clone>(
    feed: &mut FeedDict,
    placeholders: &[Placeholder],
    positions: &[Vec<T>],
    wrap: fn(Vec<T>) -> FeedValue,
) -> Result<()> {
    for (placeholder, values) in placeholders.iter().zip(positions) {
        feed.bind(*placeholder, wrap(values.clone()))?;
    }
    Ok(())
}
