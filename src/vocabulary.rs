use crate::data::{Batch, TextData};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const PAD_TOKEN: &str = "<pad>";
pub const GO_TOKEN: &str = "<go>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNKNOWN_TOKEN: &str = "<unknown>";

/// 単語単位の語彙（入力・出力で共通）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Vocabulary {
    id_to_word: Vec<String>,
    #[serde(skip)]
    word_to_id: HashMap<String, usize>,
}

impl Vocabulary {
    /// 特殊トークンのみの語彙
    pub fn new() -> Self {
        let mut vocabulary = Self {
            id_to_word: Vec::new(),
            word_to_id: HashMap::new(),
        };

        // ID順: <pad>=0, <go>=1, <eos>=2, <unknown>=3
        for token in [PAD_TOKEN, GO_TOKEN, EOS_TOKEN, UNKNOWN_TOKEN] {
            vocabulary.add_word(token);
        }

        vocabulary
    }

    /// 文のリストから語彙を構築（出現順）
    pub fn from_sentences<'a>(sentences: impl IntoIterator<Item = &'a str>) -> Self {
        let mut vocabulary = Self::new();
        for sentence in sentences {
            for word in Self::tokenize(sentence) {
                vocabulary.add_word(&word);
            }
        }
        vocabulary
    }

    fn add_word(&mut self, word: &str) -> usize {
        if let Some(&id) = self.word_to_id.get(word) {
            return id;
        }
        let id = self.id_to_word.len();
        self.id_to_word.push(word.to_string());
        self.word_to_id.insert(word.to_string(), id);
        id
    }

    /// 小文字化して句読点を分離
    pub fn tokenize(text: &str) -> Vec<String> {
        let mut spaced = String::with_capacity(text.len());
        for c in text.to_lowercase().chars() {
            if c.is_ascii_punctuation() && c != '\'' {
                spaced.push(' ');
                spaced.push(c);
                spaced.push(' ');
            } else {
                spaced.push(c);
            }
        }

        spaced.split_whitespace().map(|s| s.to_string()).collect()
    }

    pub fn pad_id(&self) -> i32 {
        0
    }

    pub fn go_id(&self) -> i32 {
        1
    }

    pub fn eos_id(&self) -> i32 {
        2
    }

    pub fn unknown_id(&self) -> i32 {
        3
    }

    pub fn len(&self) -> usize {
        self.id_to_word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_word.is_empty()
    }

    pub fn encode(&self, text: &str) -> Vec<i32> {
        Self::tokenize(text)
            .iter()
            .map(|word| {
                self.word_to_id
                    .get(word)
                    .map(|&id| id as i32)
                    .unwrap_or(self.unknown_id())
            })
            .collect()
    }

    /// <eos>で打ち切り、<pad>と<go>は出力しない
    pub fn decode(&self, token_ids: &[i32]) -> String {
        token_ids
            .iter()
            .take_while(|&&id| id != self.eos_id())
            .filter(|&&id| id != self.pad_id() && id != self.go_id())
            .filter_map(|&id| self.id_to_word.get(id as usize).cloned())
            .collect::<Vec<String>>()
            .join(" ")
    }

    /// 推論用の1文バッチ（空文または長すぎる文はNone）
    pub fn sentence_to_batch(&self, text: &str, max_length_enco: usize) -> Option<Batch> {
        let tokens = self.encode(text);
        if tokens.is_empty() || tokens.len() > max_length_enco {
            return None;
        }

        let encoder_seq = self.pad_encoder(&tokens, max_length_enco);
        Some(Batch {
            encoder_seqs: encoder_seq.into_iter().map(|id| vec![id]).collect(),
            ..Batch::default()
        })
    }

    /// 反転して左側をパディング
    pub fn pad_encoder(&self, tokens: &[i32], max_length_enco: usize) -> Vec<i32> {
        let mut padded = vec![self.pad_id(); max_length_enco.saturating_sub(tokens.len())];
        padded.extend(tokens.iter().rev().take(max_length_enco));
        padded
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write vocabulary to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary from {}", path.display()))?;
        let mut vocabulary: Self = serde_json::from_str(&json)?;
        vocabulary.word_to_id = vocabulary
            .id_to_word
            .iter()
            .enumerate()
            .map(|(id, word)| (word.clone(), id))
            .collect();
        Ok(vocabulary)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl TextData for Vocabulary {
    fn vocabulary_size(&self) -> usize {
        self.len()
    }

    fn go_token(&self) -> i32 {
        self.go_id()
    }
}
