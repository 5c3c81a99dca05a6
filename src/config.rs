use burn::config::Config;
use burn::prelude::*;
use burn::tensor::{DType, Element, FloatDType};
use serde::{Deserialize, Serialize};

/// 演算精度（モデルの作業精度、バックエンドの浮動小数点型と一致させる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Precision {
    F16,
    BF16,
    #[default]
    F32,
}

impl Precision {
    pub fn dtype(self) -> FloatDType {
        match self {
            Precision::F16 => FloatDType::F16,
            Precision::BF16 => FloatDType::BF16,
            Precision::F32 => FloatDType::F32,
        }
    }

    pub fn element_dtype(self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::BF16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }

    /// バックエンドの浮動小数点型と作業精度が一致するか検査
    ///
    /// パラメーターと活性はバックエンドの型で作られるので、ここが一致しないと
    /// sampled softmaxのキャストで型が食い違う。
    pub fn check_backend<B: Backend>(self) -> anyhow::Result<()> {
        let backend_dtype = <B::FloatElem as Element>::dtype();
        anyhow::ensure!(
            backend_dtype == self.element_dtype(),
            "precision {:?} is not supported by this backend (float type {:?})",
            self,
            backend_dtype
        );
        Ok(())
    }

    /// 32bit浮動小数点へキャスト（F32なら何もしない）
    pub fn to_full<B: Backend, const D: usize>(self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Precision::F32 => tensor,
            _ => tensor.cast(FloatDType::F32),
        }
    }

    /// 32bitから作業精度へ戻す
    pub fn from_full<B: Backend, const D: usize>(self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Precision::F32 => tensor,
            _ => tensor.cast(self.dtype()),
        }
    }
}

/// 実行モード（構築時に一度だけ決まる）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// モデルハイパーパラメーター
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// LSTMの隠れ層サイズ
    #[config(default = 512)]
    pub hidden_size: usize,
    /// 積み重ねるLSTMレイヤー数
    #[config(default = 2)]
    pub num_layers: usize,
    /// エンコーダー入力長
    #[config(default = 10)]
    pub max_length_enco: usize,
    /// デコーダー入力長（<go>と<eos>の分だけ長い）
    #[config(default = 12)]
    pub max_length_deco: usize,
    /// 単語埋め込み次元
    #[config(default = 64)]
    pub embedding_size: usize,
    /// Sampled softmaxのサンプル数（0で無効）
    #[config(default = 0)]
    pub softmax_samples: usize,
    /// ドロップアウトの出力keep確率
    #[config(default = 0.9)]
    pub dropout: f64,
    #[config(default = 0.002)]
    pub learning_rate: f64,
    /// trueで推論モード（feed previous）
    #[config(default = false)]
    pub test: bool,
    #[config(default = "Precision::F32")]
    pub precision: Precision,
}

impl ModelConfig {
    pub fn mode(&self) -> Mode {
        if self.test {
            Mode::Inference
        } else {
            Mode::Training
        }
    }

    /// Sampled softmaxを使うかどうか（0 < samples < vocab_size）
    pub fn use_sampled_softmax(&self, vocabulary_size: usize) -> bool {
        self.softmax_samples > 0 && self.softmax_samples < vocabulary_size
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.hidden_size > 0, "hidden_size must be positive");
        anyhow::ensure!(self.num_layers > 0, "num_layers must be positive");
        anyhow::ensure!(self.max_length_enco > 0, "max_length_enco must be positive");
        anyhow::ensure!(self.max_length_deco > 0, "max_length_deco must be positive");
        anyhow::ensure!(self.embedding_size > 0, "embedding_size must be positive");
        anyhow::ensure!(
            self.dropout > 0.0 && self.dropout <= 1.0,
            "dropout keep probability must be in (0, 1], got {}",
            self.dropout
        );
        anyhow::ensure!(
            self.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        Ok(())
    }
}

/// 訓練設定
#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 256)]
    pub batch_size: usize,
    #[config(default = 30)]
    pub num_epochs: usize,
    /// チェックポイント保存間隔（グローバルステップ）
    #[config(default = 2000)]
    pub save_every: usize,
    #[config(default = 42)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    #[test]
    fn precision_must_match_backend_float_type() {
        assert!(Precision::F32.check_backend::<NdArray>().is_ok());

        let error = Precision::F16.check_backend::<NdArray>().unwrap_err();
        assert!(error.to_string().contains("F16"), "{}", error);
        assert!(Precision::BF16.check_backend::<NdArray>().is_err());
    }

    #[test]
    fn sampled_softmax_needs_fewer_samples_than_vocabulary() {
        let config = ModelConfig::new().with_softmax_samples(10);

        assert!(config.use_sampled_softmax(11));
        assert!(!config.use_sampled_softmax(10));
        assert!(!config.clone().with_softmax_samples(0).use_sampled_softmax(11));
    }
}
