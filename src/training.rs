use crate::checkpoint::save_checkpoint;
use crate::config::TrainingConfig;
use crate::data::Corpus;
use crate::metrics::TrainingMetrics;
use crate::session::{Fetched, Session};
use anyhow::{bail, ensure, Result};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

/// 訓練実行
///
/// バッチごとに `step` → `Session::run` を繰り返す。`save_dir` があれば
/// `save_every` ステップごとと最後にチェックポイントを書く。
pub fn train<B: AutodiffBackend>(
    session: &mut Session<B>,
    corpus: &Corpus,
    config: &TrainingConfig,
    save_dir: Option<&Path>,
) -> Result<TrainingMetrics> {
    ensure!(!corpus.is_empty(), "corpus has no usable samples");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut loss_history = Vec::with_capacity(config.num_epochs);

    tracing::info!("訓練開始: {}エポック, {}サンプル", config.num_epochs, corpus.len());

    for epoch in 0..config.num_epochs {
        let mut total_loss = 0.0;
        let mut batch_count = 0;

        for batch in corpus.batches(config.batch_size, &mut rng) {
            let (ops, feed) = session.model().step(&batch)?;
            let loss = match session.run(&ops, &feed)? {
                Fetched::Training { loss } => loss,
                Fetched::Outputs(_) => bail!("model is not in training mode"),
            };

            total_loss += loss;
            batch_count += 1;

            let global_step = session.global_step();
            if global_step % 100 == 0 {
                tracing::info!("ステップ {}: Loss = {:.6}", global_step, loss);
            }

            if let Some(dir) = save_dir {
                if config.save_every > 0 && global_step % config.save_every == 0 {
                    save_checkpoint(session.model(), &corpus.vocabulary, dir)?;
                }
            }
        }

        let avg_loss = total_loss / batch_count.max(1) as f32;
        loss_history.push(avg_loss);
        tracing::info!("Epoch {}/{}: Loss = {:.6}", epoch + 1, config.num_epochs, avg_loss);
    }

    if let Some(dir) = save_dir {
        save_checkpoint(session.model(), &corpus.vocabulary, dir)?;
    }

    Ok(TrainingMetrics {
        final_loss: loss_history.last().copied().unwrap_or(0.0),
        loss_history,
        epochs: config.num_epochs,
        global_steps: session.global_step(),
        learning_rate: session.model().config().learning_rate,
        batch_size: config.batch_size,
    })
}
