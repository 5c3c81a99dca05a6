use crate::config::{Mode, ModelConfig};
use crate::projection::ProjectionOp;
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

// ===== 共通ヘルパー関数 =====

/// 位置ごとのトークンID `[batch]` を埋め込み `[batch, embedding]` に変換
fn embed_position<B: Backend>(embedding: &Embedding<B>, tokens: Tensor<B, 1, Int>) -> Tensor<B, 2> {
    let [batch_size] = tokens.dims();
    let embedded = embedding.forward(tokens.reshape([batch_size, 1]));
    let [_, _, embedding_size] = embedded.dims();

    embedded.reshape([batch_size, embedding_size])
}

// ===== LSTM Cell =====

/// LSTMの状態（隠れ状態とセル状態）
#[derive(Debug, Clone)]
pub struct LstmState<B: Backend> {
    pub hidden: Tensor<B, 2>,
    pub cell: Tensor<B, 2>,
}

impl<B: Backend> LstmState<B> {
    pub fn zeros(batch_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            hidden: Tensor::zeros([batch_size, hidden_size], device),
            cell: Tensor::zeros([batch_size, hidden_size], device),
        }
    }
}

#[derive(Module, Debug)]
pub struct LstmCell<B: Backend> {
    input_gates: Linear<B>,
    hidden_gates: Linear<B>,
    hidden_size: usize,
}

impl<B: Backend> LstmCell<B> {
    pub fn new(device: &B::Device, input_size: usize, hidden_size: usize) -> Self {
        // ゲート順: 入力, 忘却, 候補, 出力
        let input_gates = LinearConfig::new(input_size, 4 * hidden_size).init(device);
        let hidden_gates = LinearConfig::new(hidden_size, 4 * hidden_size)
            .with_bias(false)
            .init(device);

        Self {
            input_gates,
            hidden_gates,
            hidden_size,
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>, state: LstmState<B>) -> LstmState<B> {
        let h = self.hidden_size;
        let gates = self.input_gates.forward(x) + self.hidden_gates.forward(state.hidden);

        let input_gate = sigmoid(gates.clone().narrow(1, 0, h));
        let forget_gate = sigmoid(gates.clone().narrow(1, h, h));
        let candidate = gates.clone().narrow(1, 2 * h, h).tanh();
        let output_gate = sigmoid(gates.narrow(1, 3 * h, h));

        let cell = forget_gate * state.cell + input_gate * candidate;
        let hidden = output_gate * cell.clone().tanh();

        LstmState { hidden, cell }
    }
}

// ===== Dropout付きセル =====

const INPUT_KEEP_PROB: f64 = 1.0;

/// 出力側にだけドロップアウトを掛けるセル（入力keep確率は常に1.0）
#[derive(Module, Debug)]
pub struct DropoutCell<B: Backend> {
    cell: LstmCell<B>,
    output_dropout: Option<Dropout>,
}

impl<B: Backend> DropoutCell<B> {
    pub fn new(device: &B::Device, input_size: usize, hidden_size: usize, keep_prob: Option<f64>) -> Self {
        let cell = LstmCell::new(device, input_size, hidden_size);
        let output_dropout = keep_prob.map(|keep| DropoutConfig::new(1.0 - keep).init());

        Self {
            cell,
            output_dropout,
        }
    }

    /// (出力, 次の状態)
    pub fn forward(&self, x: Tensor<B, 2>, state: LstmState<B>) -> (Tensor<B, 2>, LstmState<B>) {
        let next = self.cell.forward(x, state);
        let output = match &self.output_dropout {
            Some(dropout) => dropout.forward(next.hidden.clone()),
            None => next.hidden.clone(),
        };

        (output, next)
    }

    pub fn has_dropout(&self) -> bool {
        self.output_dropout.is_some()
    }

    /// 入力側は常に落とさない
    pub fn input_keep_prob(&self) -> f64 {
        INPUT_KEEP_PROB
    }

    /// ドロップアウトが無ければ1.0
    pub fn output_keep_prob(&self) -> f64 {
        self.output_dropout
            .as_ref()
            .map(|dropout| 1.0 - dropout.prob)
            .unwrap_or(1.0)
    }
}

// ===== 多層セル =====

#[derive(Module, Debug)]
pub struct StackedCells<B: Backend> {
    layers: Vec<DropoutCell<B>>,
    hidden_size: usize,
}

impl<B: Backend> StackedCells<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Self {
        // 推論モードではドロップアウトを付けない
        let keep_prob = match config.mode() {
            Mode::Training => Some(config.dropout),
            Mode::Inference => None,
        };

        let mut layers = Vec::new();
        for layer in 0..config.num_layers {
            let input_size = if layer == 0 {
                config.embedding_size
            } else {
                config.hidden_size
            };
            layers.push(DropoutCell::new(device, input_size, config.hidden_size, keep_prob));
        }

        Self {
            layers,
            hidden_size: config.hidden_size,
        }
    }

    pub fn zero_state(&self, batch_size: usize, device: &B::Device) -> Vec<LstmState<B>> {
        self.layers
            .iter()
            .map(|_| LstmState::zeros(batch_size, self.hidden_size, device))
            .collect()
    }

    pub fn forward(&self, x: Tensor<B, 2>, states: Vec<LstmState<B>>) -> (Tensor<B, 2>, Vec<LstmState<B>>) {
        let mut x = x;
        let mut next_states = Vec::with_capacity(states.len());

        for (layer, state) in self.layers.iter().zip(states) {
            let (output, next) = layer.forward(x, state);
            x = output;
            next_states.push(next);
        }

        (x, next_states)
    }

    pub fn layers(&self) -> &[DropoutCell<B>] {
        &self.layers
    }
}

// ===== Encoder =====

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    embedding: Embedding<B>,
    cells: StackedCells<B>,
}

impl<B: Backend> Encoder<B> {
    pub fn new(device: &B::Device, config: &ModelConfig, vocab_size: usize) -> Self {
        let embedding = EmbeddingConfig::new(vocab_size, config.embedding_size).init(device);
        let cells = StackedCells::new(device, config);

        Self { embedding, cells }
    }

    /// 位置ごとの入力を順に読み込み、最終状態を返す
    pub fn forward(&self, encoder_inputs: &[Tensor<B, 1, Int>]) -> Vec<LstmState<B>> {
        let first = &encoder_inputs[0];
        let [batch_size] = first.dims();
        let mut states = self.cells.zero_state(batch_size, &first.device());

        for tokens in encoder_inputs {
            let embedded = embed_position(&self.embedding, tokens.clone());
            let (_, next) = self.cells.forward(embedded, states);
            states = next;
        }

        states
    }
}

// ===== Decoder =====

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    embedding: Embedding<B>,
    cells: StackedCells<B>,
    /// 射影ユニットが無い場合のみ、セル出力を語彙サイズに変換する
    output_projection: Option<Linear<B>>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(device: &B::Device, config: &ModelConfig, vocab_size: usize, wrap_output: bool) -> Self {
        let embedding = EmbeddingConfig::new(vocab_size, config.embedding_size).init(device);
        let cells = StackedCells::new(device, config);
        let output_projection =
            wrap_output.then(|| LinearConfig::new(config.hidden_size, vocab_size).init(device));

        Self {
            embedding,
            cells,
            output_projection,
        }
    }

    /// feed_previous=true のとき、2ステップ目以降は直前の出力のargmaxを入力にする
    pub fn forward(
        &self,
        decoder_inputs: &[Tensor<B, 1, Int>],
        initial_state: Vec<LstmState<B>>,
        steps: usize,
        feed_previous: bool,
        projection: Option<&ProjectionOp<B>>,
    ) -> Vec<Tensor<B, 2>> {
        let mut states = initial_state;
        let mut outputs: Vec<Tensor<B, 2>> = Vec::with_capacity(steps);
        let mut input = embed_position(&self.embedding, decoder_inputs[0].clone());

        for step in 0..steps {
            if step > 0 {
                input = match (feed_previous, outputs.last()) {
                    (true, Some(previous)) => self.embed_previous(previous.clone(), projection),
                    _ => embed_position(&self.embedding, decoder_inputs[step].clone()),
                };
            }

            let (output, next) = self.cells.forward(input.clone(), states);
            states = next;

            let output = match &self.output_projection {
                Some(linear) => linear.forward(output),
                None => output,
            };
            outputs.push(output);
        }

        outputs
    }

    /// 直前の出力を射影 → argmax → 埋め込み
    fn embed_previous(&self, previous: Tensor<B, 2>, projection: Option<&ProjectionOp<B>>) -> Tensor<B, 2> {
        let logits = match projection {
            Some(projection) => projection.forward(previous),
            None => previous,
        };
        let [batch_size, _] = logits.dims();
        let predicted = logits.argmax(1).reshape([batch_size]);

        embed_position(&self.embedding, predicted)
    }
}

// ===== Seq2SeqNetwork =====

/// 埋め込み付きRNNエンコーダー・デコーダー
#[derive(Module, Debug)]
pub struct Seq2SeqNetwork<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    projection: Option<ProjectionOp<B>>,
}

impl<B: Backend> Seq2SeqNetwork<B> {
    pub fn new(
        device: &B::Device,
        config: &ModelConfig,
        vocab_size: usize,
        projection: Option<ProjectionOp<B>>,
    ) -> Self {
        let encoder = Encoder::new(device, config, vocab_size);
        let decoder = Decoder::new(device, config, vocab_size, projection.is_none());

        Self {
            encoder,
            decoder,
            projection,
        }
    }

    /// デコーダーの生出力（射影ユニットがあれば隠れ層サイズ、なければ語彙サイズ）
    pub fn forward(
        &self,
        encoder_inputs: &[Tensor<B, 1, Int>],
        decoder_inputs: &[Tensor<B, 1, Int>],
        steps: usize,
        feed_previous: bool,
    ) -> Vec<Tensor<B, 2>> {
        let encoder_state = self.encoder.forward(encoder_inputs);

        self.decoder.forward(
            decoder_inputs,
            encoder_state,
            steps,
            feed_previous,
            self.projection.as_ref(),
        )
    }

    /// 推論用の語彙ロジット
    pub fn output_logits(&self, decoder_outputs: Vec<Tensor<B, 2>>) -> Vec<Tensor<B, 2>> {
        match &self.projection {
            Some(projection) => decoder_outputs
                .into_iter()
                .map(|output| projection.forward(output))
                .collect(),
            None => decoder_outputs,
        }
    }

    pub fn projection(&self) -> Option<&ProjectionOp<B>> {
        self.projection.as_ref()
    }

    pub fn encoder_cells(&self) -> &StackedCells<B> {
        &self.encoder.cells
    }

    pub fn decoder_cells(&self) -> &StackedCells<B> {
        &self.decoder.cells
    }
}
