use crate::session::{predicted_ids, Fetched, Session};
use crate::vocabulary::Vocabulary;
use anyhow::{bail, Result};
use burn::tensor::backend::AutodiffBackend;

/// 質問文から応答文を生成（エンコードできない文はNone）
pub fn predict_answer<B: AutodiffBackend>(
    session: &mut Session<B>,
    vocabulary: &Vocabulary,
    question: &str,
) -> Result<Option<String>> {
    let max_length_enco = session.model().config().max_length_enco;
    let Some(batch) = vocabulary.sentence_to_batch(question, max_length_enco) else {
        return Ok(None);
    };

    let (ops, feed) = session.model().step(&batch)?;
    let outputs = match session.run(&ops, &feed)? {
        Fetched::Outputs(outputs) => outputs,
        Fetched::Training { .. } => bail!("model is not in inference mode"),
    };

    let token_ids = predicted_ids(&outputs)?;
    Ok(Some(vocabulary.decode(&token_ids)))
}
