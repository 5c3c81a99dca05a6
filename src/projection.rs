use crate::config::Precision;
use burn::module::{Ignored, Param};
use burn::nn::Initializer;
use burn::prelude::*;

/// 単層パーセプトロン
///
/// デコーダーの隠れ状態を語彙空間へ射影する。重みは `(出力次元, 入力次元)`
/// の形で保持し、順伝播では転置してから掛ける。
#[derive(Module, Debug)]
pub struct ProjectionOp<B: Backend> {
    weight_t: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
    scope: Ignored<String>,
    precision: Ignored<Precision>,
}

impl<B: Backend> ProjectionOp<B> {
    /// `shape` は `[出力次元, 入力次元]`
    pub fn new(shape: [usize; 2], scope: &str, precision: Precision, device: &B::Device) -> Self {
        let [output_dim, input_dim] = shape;

        let weight_t = Initializer::XavierUniform { gain: 1.0 }.init_with(
            [output_dim, input_dim],
            Some(input_dim),
            Some(output_dim),
            device,
        );
        let bias = Initializer::Zeros.init([output_dim], device);

        Self {
            weight_t,
            bias,
            scope: Ignored(format!("weights_{}", scope)),
            precision: Ignored(precision),
        }
    }

    /// 転置済みの重み `[入力次元, 出力次元]` とバイアス
    pub fn weights(&self) -> (Tensor<B, 2>, Tensor<B, 1>) {
        (self.weight_t.val().transpose(), self.bias.val())
    }

    /// 保持している形のままの重み `[出力次元, 入力次元]` とバイアス（sampled softmax用）
    pub fn weights_t(&self) -> (Tensor<B, 2>, Tensor<B, 1>) {
        (self.weight_t.val(), self.bias.val())
    }

    /// `x · W + b`
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let (weight, bias) = self.weights();
        x.matmul(weight) + bias.unsqueeze::<2>()
    }

    pub fn shape(&self) -> [usize; 2] {
        self.weight_t.val().dims()
    }

    pub fn bias_shape(&self) -> [usize; 1] {
        self.bias.val().dims()
    }

    pub fn scope(&self) -> &str {
        &self.scope.0
    }

    pub fn precision(&self) -> Precision {
        self.precision.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn forward_matches_transposed_matmul() {
        let device = Default::default();
        let projection = ProjectionOp::<TestBackend>::new([7, 3], "test", Precision::F32, &device);

        assert_eq!(projection.shape(), [7, 3]);
        assert_eq!(projection.bias_shape(), [7]);

        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0, 0.0], [0.0, 2.0, -1.0]], &device);
        let logits = projection.forward(x.clone());
        assert_eq!(logits.dims(), [2, 7]);

        // バイアスは0初期化なので x · W_t^T と一致する
        let (weight_t, bias) = projection.weights_t();
        let bias_sum: f32 = bias.abs().sum().into_scalar().elem();
        assert_eq!(bias_sum, 0.0);

        let expected = x.matmul(weight_t.transpose());
        let diff: f32 = (logits - expected).abs().max().into_scalar().elem();
        assert!(diff < 1e-6);
    }
}
