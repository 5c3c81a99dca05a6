use crate::config::Precision;
use crate::projection::ProjectionOp;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use rand::Rng;
use std::collections::HashSet;

/// 偶然ヒットしたサンプルに与えるロジット
const ACCIDENTAL_HIT_LOGIT: f32 = -1e9;

/// 1位置分のソフトマックス損失（例ごとの損失 `[batch]` を返す）
pub trait SoftmaxLossFn<B: Backend> {
    fn forward(&self, labels: Tensor<B, 1, Int>, inputs: Tensor<B, 2>) -> Tensor<B, 1>;
}

/// 構築時に選ばれる損失の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftmaxLoss {
    Full,
    Sampled { num_sampled: usize, num_classes: usize },
}

// ===== 通常のソフトマックス交差エントロピー =====

pub struct FullSoftmaxLoss;

impl<B: Backend> SoftmaxLossFn<B> for FullSoftmaxLoss {
    fn forward(&self, labels: Tensor<B, 1, Int>, logits: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch_size, _] = logits.dims();
        let log_probs = log_softmax(logits, 1);

        log_probs
            .gather(1, labels.reshape([batch_size, 1]))
            .reshape([batch_size])
            .neg()
    }
}

// ===== Sampled softmax =====

/// 射影ユニットの重みを使って、正解クラスとサンプルした負例だけでソフトマックスを取る
pub struct SampledSoftmaxLoss<'a, B: Backend> {
    projection: &'a ProjectionOp<B>,
    num_sampled: usize,
    num_classes: usize,
    precision: Precision,
}

impl<'a, B: Backend> SampledSoftmaxLoss<'a, B> {
    pub fn new(projection: &'a ProjectionOp<B>, num_sampled: usize, num_classes: usize) -> Self {
        Self {
            projection,
            num_sampled,
            num_classes,
            precision: projection.precision(),
        }
    }

    fn forward_with_sample(
        &self,
        labels: Tensor<B, 1, Int>,
        inputs: Tensor<B, 2>,
        sample: &CandidateSample,
    ) -> Tensor<B, 1> {
        let [batch_size, _] = inputs.dims();
        let num_sampled = sample.ids.len();
        let device = inputs.device();
        let sampler = LogUniformSampler::new(self.num_classes);

        // 数値安定性のため32bitで計算する
        let (weight_t, bias) = self.projection.weights_t();
        let weight_t = self.precision.to_full(weight_t);
        let bias = self.precision.to_full(bias);
        let inputs = self.precision.to_full(inputs);

        // 正解クラス（1例につき1ラベル）
        let true_weight = weight_t.clone().select(0, labels.clone());
        let true_bias = bias.clone().select(0, labels.clone()).reshape([batch_size, 1]);
        let true_expected = sampler.expected_count_tensor(labels.clone(), sample.num_tries);
        let true_logits = (inputs.clone() * true_weight).sum_dim(1) + true_bias
            - true_expected.log().reshape([batch_size, 1]);

        // 負例
        let sampled_ids = Tensor::<B, 1, Int>::from_data(sample.ids.as_slice(), &device);
        let sampled_weight = weight_t.select(0, sampled_ids.clone());
        let sampled_bias = bias.select(0, sampled_ids.clone()).reshape([1, num_sampled]);
        let sampled_expected = Tensor::<B, 1>::from_floats(sample.expected_counts.as_slice(), &device)
            .reshape([1, num_sampled]);
        let sampled_logits =
            inputs.matmul(sampled_weight.transpose()) + sampled_bias - sampled_expected.log();

        // 正解と同じIDを引いた負例は除外
        let hits = labels
            .reshape([batch_size, 1])
            .repeat_dim(1, num_sampled)
            .equal(sampled_ids.reshape([1, num_sampled]).repeat_dim(0, batch_size));
        let sampled_logits = sampled_logits.mask_fill(hits, ACCIDENTAL_HIT_LOGIT);

        let logits = Tensor::cat(vec![true_logits, sampled_logits], 1);
        let loss = log_softmax(logits, 1)
            .narrow(1, 0, 1)
            .reshape([batch_size])
            .neg();

        self.precision.from_full(loss)
    }
}

impl<B: Backend> SoftmaxLossFn<B> for SampledSoftmaxLoss<'_, B> {
    fn forward(&self, labels: Tensor<B, 1, Int>, inputs: Tensor<B, 2>) -> Tensor<B, 1> {
        let sample = LogUniformSampler::new(self.num_classes)
            .sample(&mut rand::thread_rng(), self.num_sampled);

        self.forward_with_sample(labels, inputs, &sample)
    }
}

// ===== 候補サンプラー =====

/// 重複なしでサンプルした負例
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSample {
    pub ids: Vec<i64>,
    pub expected_counts: Vec<f32>,
    pub num_tries: usize,
}

/// Zipf分布に近い対数一様サンプラー（IDが小さいほど高頻度）
#[derive(Debug, Clone, Copy)]
pub struct LogUniformSampler {
    range_max: usize,
}

impl LogUniformSampler {
    pub fn new(range_max: usize) -> Self {
        Self { range_max }
    }

    /// P(k) = (log(k + 2) - log(k + 1)) / log(range_max + 1)
    pub fn probability(&self, class: usize) -> f64 {
        let k = class as f64;
        ((k + 2.0) / (k + 1.0)).ln() / (self.range_max as f64 + 1.0).ln()
    }

    /// `num_tries` 回の試行で一度でも引かれる期待値
    pub fn expected_count(&self, class: usize, num_tries: usize) -> f64 {
        let p = self.probability(class);
        -((num_tries as f64) * (-p).ln_1p()).exp_m1()
    }

    /// 重複なしで `num_sampled` 個引く（num_sampled < range_max が前提）
    pub fn sample<R: Rng>(&self, rng: &mut R, num_sampled: usize) -> CandidateSample {
        let log_range = (self.range_max as f64 + 1.0).ln();
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(num_sampled);
        let mut num_tries = 0;

        while ids.len() < num_sampled.min(self.range_max) {
            num_tries += 1;
            let value = ((rng.gen::<f64>() * log_range).exp() as usize).saturating_sub(1) % self.range_max;
            if seen.insert(value) {
                ids.push(value as i64);
            }
        }

        let expected_counts = ids
            .iter()
            .map(|&id| self.expected_count(id as usize, num_tries) as f32)
            .collect();

        CandidateSample {
            ids,
            expected_counts,
            num_tries,
        }
    }

    /// ラベル `[batch]` の期待値をテンソル上で計算
    fn expected_count_tensor<B: Backend>(&self, labels: Tensor<B, 1, Int>, num_tries: usize) -> Tensor<B, 1> {
        let k = labels.float();
        let log_range = (self.range_max as f64 + 1.0).ln();
        let p = ((k.clone() + 2.0) / (k + 1.0)).log() / log_range;

        (p.neg().log1p() * num_tries as f64).exp().neg() + 1.0
    }
}

// ===== 系列損失 =====

/// 重み付き系列損失
///
/// 例ごとに `Σ_t ce_t · w_t / (Σ_t w_t + 1e-12)` を求め、バッチ平均を返す。
pub fn sequence_loss<B: Backend>(
    logits: &[Tensor<B, 2>],
    targets: &[Tensor<B, 1, Int>],
    weights: &[Tensor<B, 1>],
    softmax_loss: &dyn SoftmaxLossFn<B>,
) -> Tensor<B, 1> {
    let mut weighted_sum: Option<Tensor<B, 1>> = None;
    let mut total_weight: Option<Tensor<B, 1>> = None;

    for ((logit, target), weight) in logits.iter().zip(targets).zip(weights) {
        let crossent = softmax_loss.forward(target.clone(), logit.clone());
        let weighted = crossent * weight.clone();

        weighted_sum = Some(match weighted_sum {
            Some(sum) => sum + weighted,
            None => weighted,
        });
        total_weight = Some(match total_weight {
            Some(sum) => sum + weight.clone(),
            None => weight.clone(),
        });
    }

    match (weighted_sum, total_weight) {
        (Some(sum), Some(total)) => (sum / (total + 1e-12)).mean(),
        _ => {
            let device = logits
                .first()
                .map(|logit| logit.device())
                .unwrap_or_default();
            Tensor::zeros([1], &device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    #[test]
    fn sampler_draws_unique_ids_in_range() {
        let sampler = LogUniformSampler::new(50);
        let mut rng = StdRng::seed_from_u64(7);
        let sample = sampler.sample(&mut rng, 20);

        assert_eq!(sample.ids.len(), 20);
        let unique: HashSet<_> = sample.ids.iter().collect();
        assert_eq!(unique.len(), 20);
        assert!(sample.ids.iter().all(|&id| (0..50).contains(&id)));
        assert!(sample.num_tries >= 20);
        for count in &sample.expected_counts {
            assert!(*count > 0.0 && *count <= sample.num_tries as f32);
        }
    }

    #[test]
    fn sampler_probabilities_sum_to_one() {
        let sampler = LogUniformSampler::new(100);
        let total: f64 = (0..100).map(|k| sampler.probability(k)).sum();

        assert!((total - 1.0).abs() < 1e-9);
        assert!(sampler.probability(0) > sampler.probability(99));
    }

    #[test]
    fn full_softmax_of_uniform_logits_is_log_vocab() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([3, 8], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_data([0, 4, 7], &device);

        let loss = FullSoftmaxLoss.forward(labels, logits);
        let values: Vec<f32> = loss.to_data().to_vec().unwrap();

        for value in values {
            assert!((value - (8.0_f32).ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn sequence_loss_ignores_zero_weight_positions() {
        let device = Default::default();
        let confident = Tensor::<TestBackend, 2>::from_floats([[10.0, -10.0]], &device);
        let wrong = Tensor::<TestBackend, 2>::from_floats([[-10.0, 10.0]], &device);
        let targets = vec![
            Tensor::<TestBackend, 1, Int>::from_data([0], &device),
            Tensor::<TestBackend, 1, Int>::from_data([0], &device),
        ];

        let masked = vec![
            Tensor::<TestBackend, 1>::from_floats([1.0], &device),
            Tensor::<TestBackend, 1>::from_floats([0.0], &device),
        ];
        let loss: f32 = sequence_loss(&[confident.clone(), wrong.clone()], &targets, &masked, &FullSoftmaxLoss)
            .into_scalar()
            .elem();
        assert!(loss < 1e-3);

        let unmasked = vec![
            Tensor::<TestBackend, 1>::from_floats([1.0], &device),
            Tensor::<TestBackend, 1>::from_floats([1.0], &device),
        ];
        let loss: f32 = sequence_loss(&[confident, wrong], &targets, &unmasked, &FullSoftmaxLoss)
            .into_scalar()
            .elem();
        assert!(loss > 5.0);
    }

    #[test]
    fn sampled_softmax_matches_manual_computation() {
        let device = Default::default();
        let projection = ProjectionOp::<TestBackend>::new([10, 4], "test", Precision::F32, &device);
        let loss_fn = SampledSoftmaxLoss::new(&projection, 3, 10);

        let inputs = Tensor::<TestBackend, 2>::from_floats([[0.5, -1.0, 0.25, 2.0]], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_data([6], &device);
        let sampler = LogUniformSampler::new(10);
        let sample = CandidateSample {
            ids: vec![0, 1, 2],
            expected_counts: vec![
                sampler.expected_count(0, 3) as f32,
                sampler.expected_count(1, 3) as f32,
                sampler.expected_count(2, 3) as f32,
            ],
            num_tries: 3,
        };

        let loss: f32 = loss_fn
            .forward_with_sample(labels, inputs.clone(), &sample)
            .into_scalar()
            .elem();

        // 手計算: logit_k = x · w_k + b_k - log(Q(k))
        let (weight_t, _) = projection.weights_t();
        let scores: Vec<f32> = inputs.matmul(weight_t.transpose()).to_data().to_vec().unwrap();
        let true_logit = scores[6] - (sampler.expected_count(6, 3) as f32).ln();
        let sampled: Vec<f32> = (0..3)
            .map(|k| scores[k] - sample.expected_counts[k].ln())
            .collect();
        let max = sampled.iter().copied().fold(true_logit, f32::max);
        let log_sum = (std::iter::once(true_logit)
            .chain(sampled.iter().copied())
            .map(|logit| (logit - max).exp())
            .sum::<f32>())
        .ln()
            + max;
        let expected = log_sum - true_logit;

        assert!((loss - expected).abs() < 1e-4, "{} vs {}", loss, expected);
    }

    #[test]
    fn sampled_softmax_masks_accidental_hits() {
        let device = Default::default();
        let projection = ProjectionOp::<TestBackend>::new([10, 4], "test", Precision::F32, &device);
        let loss_fn = SampledSoftmaxLoss::new(&projection, 2, 10);

        let inputs = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 1.0, 1.0]], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_data([1], &device);
        let sample = CandidateSample {
            ids: vec![1, 1],
            expected_counts: vec![0.5, 0.5],
            num_tries: 2,
        };

        // 負例がすべて正解と一致するので損失はほぼ0
        let loss: f32 = loss_fn
            .forward_with_sample(labels, inputs, &sample)
            .into_scalar()
            .elem();
        assert!(loss.abs() < 1e-4);
    }
}
