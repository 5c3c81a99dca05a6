use crate::vocabulary::Vocabulary;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::Path;

/// モデルが必要とするデータソース側の情報
pub trait TextData {
    fn vocabulary_size(&self) -> usize;
    /// 推論開始時のデコーダー入力
    fn go_token(&self) -> i32;
}

/// 時間方向優先のバッチ（`encoder_seqs[i]` は位置iのバッチ全体）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub encoder_seqs: Vec<Vec<i32>>,
    pub decoder_seqs: Vec<Vec<i32>>,
    pub target_seqs: Vec<Vec<i32>>,
    pub weights: Vec<Vec<f32>>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.encoder_seqs.first().map(|position| position.len()).unwrap_or(0)
    }
}

/// 質問と応答の対
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub question: Vec<i32>,
    pub answer: Vec<i32>,
}

/// 対話コーパス
pub struct Corpus {
    pub vocabulary: Vocabulary,
    pub samples: Vec<Sample>,
    max_length_enco: usize,
    max_length_deco: usize,
}

impl Corpus {
    /// TSV形式のファイルから読み込む
    /// 形式: 質問[TAB]応答
    pub fn load(
        file_path: &Path,
        max_length_enco: usize,
        max_length_deco: usize,
        vocabulary: Option<Vocabulary>,
    ) -> Result<Self> {
        let content = fs::read_to_string(file_path)
            .with_context(|| format!("failed to read corpus {}", file_path.display()))?;

        let mut pairs = Vec::new();
        for line in content.lines() {
            let line = line.trim();

            // 空行とコメント行をスキップ
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.split_once('\t') {
                Some((question, answer)) => pairs.push((question.trim(), answer.trim())),
                None => tracing::warn!("TAB区切りではない行をスキップ: {}", line),
            }
        }

        let vocabulary = vocabulary.unwrap_or_else(|| {
            Vocabulary::from_sentences(pairs.iter().flat_map(|(q, a)| [*q, *a]))
        });

        let corpus = Self::from_pairs(&pairs, vocabulary, max_length_enco, max_length_deco);
        tracing::info!(
            "コーパス読み込み: {}サンプル, 語彙サイズ {}",
            corpus.len(),
            corpus.vocabulary.len()
        );

        Ok(corpus)
    }

    /// 長すぎる対は除外する（応答は<go>と<eos>の分だけ短く）
    pub fn from_pairs(
        pairs: &[(&str, &str)],
        vocabulary: Vocabulary,
        max_length_enco: usize,
        max_length_deco: usize,
    ) -> Self {
        let samples = pairs
            .iter()
            .map(|(question, answer)| Sample {
                question: vocabulary.encode(question),
                answer: vocabulary.encode(answer),
            })
            .filter(|sample| {
                !sample.question.is_empty()
                    && !sample.answer.is_empty()
                    && sample.question.len() <= max_length_enco
                    && sample.answer.len() + 2 <= max_length_deco
            })
            .collect();

        Self {
            vocabulary,
            samples,
            max_length_enco,
            max_length_deco,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// シャッフルしてバッチに分割
    pub fn batches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Batch> {
        let mut order: Vec<&Sample> = self.samples.iter().collect();
        order.shuffle(rng);

        order
            .chunks(batch_size.max(1))
            .map(|chunk| self.create_batch(chunk))
            .collect()
    }

    /// サンプル群から時間方向優先のバッチを作る
    pub fn create_batch(&self, samples: &[&Sample]) -> Batch {
        let pad = self.vocabulary.pad_id();
        let mut encoder_rows = Vec::with_capacity(samples.len());
        let mut decoder_rows = Vec::with_capacity(samples.len());
        let mut target_rows = Vec::with_capacity(samples.len());
        let mut weight_rows = Vec::with_capacity(samples.len());

        for sample in samples {
            encoder_rows.push(self.vocabulary.pad_encoder(&sample.question, self.max_length_enco));

            // デコーダー入力: [<go>, w1, ..., wN, <eos>]
            let mut decoder = vec![self.vocabulary.go_id()];
            decoder.extend(&sample.answer);
            decoder.push(self.vocabulary.eos_id());

            // ターゲット: [w1, ..., wN, <eos>]
            let mut target = decoder[1..].to_vec();
            let mut weights = vec![1.0; target.len()];

            decoder.resize(self.max_length_deco, pad);
            target.resize(self.max_length_deco, pad);
            weights.resize(self.max_length_deco, 0.0);

            decoder_rows.push(decoder);
            target_rows.push(target);
            weight_rows.push(weights);
        }

        Batch {
            encoder_seqs: transpose(&encoder_rows, self.max_length_enco),
            decoder_seqs: transpose(&decoder_rows, self.max_length_deco),
            target_seqs: transpose(&target_rows, self.max_length_deco),
            weights: transpose(&weight_rows, self.max_length_deco),
        }
    }
}

/// `[batch][position]` → `[position][batch]`
fn transpose<T: Copy>(rows: &[Vec<T>], length: usize) -> Vec<Vec<T>> {
    (0..length)
        .map(|position| rows.iter().map(|row| row[position]).collect())
        .collect()
}
