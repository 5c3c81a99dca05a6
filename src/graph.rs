use anyhow::{bail, Result};
use std::fmt;

/// プレースホルダーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderKind {
    EncoderInput,
    DecoderInput,
    DecoderTarget,
    DecoderWeight,
}

/// 要素の型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Int,
    Float,
}

impl PlaceholderKind {
    pub fn element_type(self) -> ElementType {
        match self {
            PlaceholderKind::DecoderWeight => ElementType::Float,
            _ => ElementType::Int,
        }
    }

    fn scoped_name(self) -> &'static str {
        match self {
            PlaceholderKind::EncoderInput => "placeholder_encoder/inputs",
            PlaceholderKind::DecoderInput => "placeholder_decoder/inputs",
            PlaceholderKind::DecoderTarget => "placeholder_decoder/targets",
            PlaceholderKind::DecoderWeight => "placeholder_decoder/weights",
        }
    }
}

/// 位置ごとの入力プレースホルダー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub position: usize,
}

impl Placeholder {
    pub fn new(kind: PlaceholderKind, position: usize) -> Self {
        Self { kind, position }
    }

    pub fn element_type(&self) -> ElementType {
        self.kind.element_type()
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.scoped_name(), self.position)
    }
}

/// グラフ構築時に一度だけ確保されるプレースホルダー一式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    pub encoder_inputs: Vec<Placeholder>,
    pub decoder_inputs: Vec<Placeholder>,
    pub decoder_targets: Vec<Placeholder>,
    pub decoder_weights: Vec<Placeholder>,
}

impl Placeholders {
    pub fn new(max_length_enco: usize, max_length_deco: usize) -> Self {
        let allocate = |kind: PlaceholderKind, len: usize| -> Vec<Placeholder> {
            (0..len).map(|i| Placeholder::new(kind, i)).collect()
        };

        Self {
            encoder_inputs: allocate(PlaceholderKind::EncoderInput, max_length_enco),
            decoder_inputs: allocate(PlaceholderKind::DecoderInput, max_length_deco),
            decoder_targets: allocate(PlaceholderKind::DecoderTarget, max_length_deco),
            decoder_weights: allocate(PlaceholderKind::DecoderWeight, max_length_deco),
        }
    }

    pub fn len(&self) -> usize {
        self.encoder_inputs.len()
            + self.decoder_inputs.len()
            + self.decoder_targets.len()
            + self.decoder_weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Placeholder> {
        self.encoder_inputs
            .iter()
            .chain(&self.decoder_inputs)
            .chain(&self.decoder_targets)
            .chain(&self.decoder_weights)
    }
}

/// プレースホルダーに束縛する値（バッチ内の1位置分）
#[derive(Debug, Clone, PartialEq)]
pub enum FeedValue {
    Int(Vec<i32>),
    Float(Vec<f32>),
}

impl FeedValue {
    pub fn element_type(&self) -> ElementType {
        match self {
            FeedValue::Int(_) => ElementType::Int,
            FeedValue::Float(_) => ElementType::Float,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FeedValue::Int(values) => values.len(),
            FeedValue::Float(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// プレースホルダー → 値 の順序付き束縛
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDict {
    entries: Vec<(Placeholder, FeedValue)>,
}

impl FeedDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同じプレースホルダーへの再束縛は上書き
    pub fn bind(&mut self, placeholder: Placeholder, value: FeedValue) -> Result<()> {
        if placeholder.element_type() != value.element_type() {
            bail!(
                "{} expects {:?} values, got {:?}",
                placeholder,
                placeholder.element_type(),
                value.element_type()
            );
        }

        match self.entries.iter_mut().find(|(bound, _)| *bound == placeholder) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((placeholder, value)),
        }
        Ok(())
    }

    pub fn get(&self, placeholder: &Placeholder) -> Option<&FeedValue> {
        self.entries
            .iter()
            .find(|(bound, _)| bound == placeholder)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, placeholder: &Placeholder) -> bool {
        self.get(placeholder).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Placeholder, FeedValue)> {
        self.entries.iter()
    }
}

/// グラフ上の固定オペレーター
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Adamによる損失最小化
    Minimize,
    Loss,
    /// 位置ごとの語彙ロジット
    Outputs,
}

/// 1パス分のオペレーター束（モードごとに形が固定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ops {
    Training { update: Operator, loss: Operator },
    Inference { outputs: Operator },
}

impl Ops {
    pub fn training() -> Self {
        Ops::Training {
            update: Operator::Minimize,
            loss: Operator::Loss,
        }
    }

    pub fn inference() -> Self {
        Ops::Inference {
            outputs: Operator::Outputs,
        }
    }

    pub fn operators(&self) -> Vec<Operator> {
        match *self {
            Ops::Training { update, loss } => vec![update, loss],
            Ops::Inference { outputs } => vec![outputs],
        }
    }

    pub fn has_update(&self) -> bool {
        matches!(self, Ops::Training { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_dict_rejects_wrong_element_type() {
        let mut feed = FeedDict::new();
        let weight = Placeholder::new(PlaceholderKind::DecoderWeight, 0);

        assert!(feed.bind(weight, FeedValue::Int(vec![1])).is_err());
        assert!(feed.bind(weight, FeedValue::Float(vec![1.0])).is_ok());
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn feed_dict_rebinding_overwrites() {
        let mut feed = FeedDict::new();
        let input = Placeholder::new(PlaceholderKind::DecoderInput, 0);

        feed.bind(input, FeedValue::Int(vec![4])).unwrap();
        feed.bind(input, FeedValue::Int(vec![1])).unwrap();

        assert_eq!(feed.len(), 1);
        assert_eq!(feed.get(&input), Some(&FeedValue::Int(vec![1])));
    }

    #[test]
    fn placeholders_are_allocated_per_position() {
        let placeholders = Placeholders::new(5, 7);

        assert_eq!(placeholders.encoder_inputs.len(), 5);
        assert_eq!(placeholders.decoder_weights.len(), 7);
        assert_eq!(placeholders.len(), 5 + 3 * 7);
        assert_eq!(
            placeholders.decoder_targets[3].to_string(),
            "placeholder_decoder/targets_3"
        );
    }
}
