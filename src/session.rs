use crate::graph::{FeedDict, FeedValue, Ops, Placeholder};
use crate::model::Seq2SeqNetwork;
use crate::seq2seq::{Graph, Seq2SeqModel};
use crate::loss::sequence_loss;
use anyhow::{bail, ensure, Context, Result};
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

pub type AdamOptimizer<B> = OptimizerAdaptor<Adam, Seq2SeqNetwork<B>, B>;

/// 実行結果
#[derive(Debug)]
pub enum Fetched<B: Backend> {
    /// 更新前の重みで計算した損失
    Training { loss: f32 },
    /// デコーダー位置ごとの語彙ロジット `[batch, vocab]`
    Outputs(Vec<Tensor<B, 2>>),
}

/// オペレーター束を実行するランタイム
///
/// 訓練モードのモデルではAdamを持ち、`run` のたびに重みを更新する。
pub struct Session<B: AutodiffBackend> {
    model: Seq2SeqModel<B>,
    optimizer: Option<AdamOptimizer<B>>,
    global_step: usize,
}

impl<B: AutodiffBackend> Session<B> {
    pub fn new(model: Seq2SeqModel<B>) -> Self {
        let optimizer = match model.graph() {
            Graph::Training { optimizer, .. } => Some(optimizer.config().init()),
            Graph::Inference { .. } => None,
        };

        Self {
            model,
            optimizer,
            global_step: 0,
        }
    }

    /// 推論の出力は自動微分を外したバックエンドで返す
    pub fn run(&mut self, ops: &Ops, feed: &FeedDict) -> Result<Fetched<B::InnerBackend>> {
        match (ops, *self.model.graph()) {
            (Ops::Training { .. }, Graph::Training { optimizer, .. }) => {
                let loss = self.train_step(feed, optimizer.learning_rate)?;
                Ok(Fetched::Training { loss })
            }
            (Ops::Inference { .. }, Graph::Inference { .. }) => Ok(Fetched::Outputs(self.infer(feed)?)),
            _ => bail!("operator bundle {:?} does not belong to this graph", ops),
        }
    }

    fn train_step(&mut self, feed: &FeedDict, learning_rate: f64) -> Result<f32> {
        let device = self.device();
        let placeholders = self.model.placeholders().clone();
        let steps = placeholders.decoder_inputs.len();

        let encoder_inputs = int_inputs::<B>(feed, &placeholders.encoder_inputs, &device)?;
        let decoder_inputs = int_inputs::<B>(feed, &placeholders.decoder_inputs, &device)?;
        let targets = int_inputs::<B>(feed, &placeholders.decoder_targets, &device)?;
        let weights = float_inputs::<B>(feed, &placeholders.decoder_weights, &device)?;

        // 正解系列をそのままデコーダー入力に使う
        let loss = {
            let softmax_loss = self.model.softmax_loss()?;
            let outputs = self
                .model
                .network()
                .forward(&encoder_inputs, &decoder_inputs, steps, false);
            sequence_loss(&outputs, &targets, &weights, softmax_loss.as_ref())
        };
        let loss_value: f32 = loss.clone().into_scalar().elem();

        let optimizer = self
            .optimizer
            .as_mut()
            .context("training graph has no optimizer")?;

        let network = self.model.network().clone();
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &network);
        let network = optimizer.step(learning_rate, network, grads);
        self.model.set_network(network);
        self.global_step += 1;

        Ok(loss_value)
    }

    fn infer(&self, feed: &FeedDict) -> Result<Vec<Tensor<B::InnerBackend, 2>>> {
        let device = self.device();
        let placeholders = self.model.placeholders();
        let steps = placeholders.decoder_inputs.len();

        let encoder_inputs = int_inputs::<B::InnerBackend>(feed, &placeholders.encoder_inputs, &device)?;
        // 自己回帰生成なので先頭のデコーダー入力だけ使う
        let go = int_inputs::<B::InnerBackend>(feed, &placeholders.decoder_inputs[..1], &device)?;

        let network = self.model.network().valid();
        let outputs = network.forward(&encoder_inputs, &go, steps, true);

        Ok(network.output_logits(outputs))
    }

    fn device(&self) -> B::Device {
        self.model
            .network()
            .devices()
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    pub fn model(&self) -> &Seq2SeqModel<B> {
        &self.model
    }

    pub fn into_model(self) -> Seq2SeqModel<B> {
        self.model
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

/// 位置ごとのargmax（バッチ先頭の例）
pub fn predicted_ids<B: Backend>(outputs: &[Tensor<B, 2>]) -> Result<Vec<i32>> {
    outputs
        .iter()
        .map(|logits| {
            let ids: Vec<i64> = logits
                .clone()
                .argmax(1)
                .into_data()
                .convert::<i64>()
                .to_vec()
                .map_err(|e| anyhow::anyhow!("failed to read predicted ids: {:?}", e))?;
            ids.first()
                .map(|&id| id as i32)
                .context("empty output batch")
        })
        .collect()
}

fn lookup<'a>(feed: &'a FeedDict, placeholder: &Placeholder) -> Result<&'a FeedValue> {
    feed.get(placeholder)
        .with_context(|| format!("placeholder {} is not bound", placeholder))
}

fn int_inputs<B: Backend>(
    feed: &FeedDict,
    placeholders: &[Placeholder],
    device: &B::Device,
) -> Result<Vec<Tensor<B, 1, Int>>> {
    let mut batch_size = None;
    placeholders
        .iter()
        .map(|placeholder| match lookup(feed, placeholder)? {
            FeedValue::Int(values) => {
                check_batch_size(&mut batch_size, values.len(), placeholder)?;
                Ok(Tensor::<B, 1, Int>::from_data(values.as_slice(), device))
            }
            FeedValue::Float(_) => bail!("placeholder {} expects integer values", placeholder),
        })
        .collect()
}

fn float_inputs<B: Backend>(
    feed: &FeedDict,
    placeholders: &[Placeholder],
    device: &B::Device,
) -> Result<Vec<Tensor<B, 1>>> {
    let mut batch_size = None;
    placeholders
        .iter()
        .map(|placeholder| match lookup(feed, placeholder)? {
            FeedValue::Float(values) => {
                check_batch_size(&mut batch_size, values.len(), placeholder)?;
                Ok(Tensor::<B, 1>::from_floats(values.as_slice(), device))
            }
            FeedValue::Int(_) => bail!("placeholder {} expects float values", placeholder),
        })
        .collect()
}

fn check_batch_size(expected: &mut Option<usize>, actual: usize, placeholder: &Placeholder) -> Result<()> {
    ensure!(actual > 0, "placeholder {} is bound to an empty batch", placeholder);
    match *expected {
        Some(size) => ensure!(
            size == actual,
            "placeholder {} has batch size {}, expected {}",
            placeholder,
            actual,
            size
        ),
        None => *expected = Some(actual),
    }
    Ok(())
}
