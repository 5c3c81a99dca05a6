#![recursion_limit = "256"]

use anyhow::{bail, Context, Result};
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use seq2seq_chatbot::checkpoint::load_checkpoint;
use seq2seq_chatbot::config::{ModelConfig, TrainingConfig};
use seq2seq_chatbot::data::Corpus;
use seq2seq_chatbot::inference::predict_answer;
use seq2seq_chatbot::metrics::save_metrics;
use seq2seq_chatbot::seq2seq::Seq2SeqModel;
use seq2seq_chatbot::session::Session;
use seq2seq_chatbot::training::train;
use seq2seq_chatbot::vocabulary::Vocabulary;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Seq2Seqチャットボット
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 訓練モード
    #[arg(long)]
    train: bool,

    /// 対話コーパス（質問[TAB]応答）
    #[arg(long, default_value = "data/corpus.tsv")]
    corpus: PathBuf,

    /// モデルを保存するディレクトリ
    #[arg(long)]
    save: Option<PathBuf>,

    /// モデルを読み込むディレクトリ
    #[arg(long)]
    load: Option<PathBuf>,

    /// 応答を生成する質問文
    #[arg(long)]
    predict: Option<String>,

    /// 対話モード（空行またはexitで終了）
    #[arg(long)]
    interactive: bool,

    /// バックエンドの選択（ndarray, wgpu）
    #[arg(long, default_value = "ndarray")]
    backend: String,

    #[arg(long, default_value_t = 512)]
    hidden_size: usize,

    #[arg(long, default_value_t = 2)]
    num_layers: usize,

    /// エンコーダー長（デコーダー長はこれ+2）
    #[arg(long, default_value_t = 10)]
    max_length: usize,

    #[arg(long, default_value_t = 64)]
    embedding_size: usize,

    /// 0または語彙サイズ以上なら通常のsoftmax
    #[arg(long, default_value_t = 0)]
    softmax_samples: usize,

    /// 出力keep確率
    #[arg(long, default_value_t = 0.9)]
    dropout: f64,

    #[arg(long, default_value_t = 0.002)]
    learning_rate: f64,

    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    #[arg(long, default_value_t = 30)]
    num_epochs: usize,

    #[arg(long, default_value_t = 2000)]
    save_every: usize,
}

impl Args {
    fn model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_hidden_size(self.hidden_size)
            .with_num_layers(self.num_layers)
            .with_max_length_enco(self.max_length)
            .with_max_length_deco(self.max_length + 2)
            .with_embedding_size(self.embedding_size)
            .with_softmax_samples(self.softmax_samples)
            .with_dropout(self.dropout)
            .with_learning_rate(self.learning_rate)
    }

    fn training_config(&self) -> TrainingConfig {
        TrainingConfig::new()
            .with_batch_size(self.batch_size)
            .with_num_epochs(self.num_epochs)
            .with_save_every(self.save_every)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("seq2seq_chatbot=info".parse()?),
        )
        .init();

    let start_time = Instant::now();
    let args = Args::parse();

    match args.backend.as_str() {
        "wgpu" => run::<Autodiff<Wgpu>>(&args, WgpuDevice::default())?,
        "ndarray" => run::<Autodiff<NdArray>>(&args, Default::default())?,
        other => bail!("未対応のバックエンド: {}", other),
    }

    tracing::info!("実行時間: {:.2}秒", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn run<B: AutodiffBackend>(args: &Args, device: B::Device) -> Result<()> {
    let mut checkpoint_dir = args.load.clone();

    // 訓練モード
    if args.train {
        let (model, corpus) = match &args.load {
            // 継続訓練: 保存済みの設定と語彙を使う
            Some(load_dir) => {
                let (model, vocabulary) = load_checkpoint::<B>(load_dir, false, &device)?;
                let config = model.config().clone();
                let corpus = Corpus::load(
                    &args.corpus,
                    config.max_length_enco,
                    config.max_length_deco,
                    Some(vocabulary),
                )?;
                (model, corpus)
            }
            None => {
                let config = args.model_config();
                let corpus = Corpus::load(&args.corpus, config.max_length_enco, config.max_length_deco, None)?;
                let model = Seq2SeqModel::<B>::new(&config, &corpus.vocabulary, &device)?;
                (model, corpus)
            }
        };

        let mut session = Session::new(model);
        let metrics = train(&mut session, &corpus, &args.training_config(), args.save.as_deref())?;
        tracing::info!("訓練完了！最終Loss = {:.6}", metrics.final_loss);

        if let Some(save_dir) = &args.save {
            save_metrics(save_dir, session.model().config(), &metrics)?;
            checkpoint_dir = Some(save_dir.clone());
        }
    }

    if args.predict.is_none() && !args.interactive {
        if !args.train {
            println!("使用方法:");
            println!("  訓練: cargo run --release -- --train --corpus data/corpus.tsv --save models/chat");
            println!("  推論: cargo run --release -- --load models/chat --predict \"hello\"");
            println!("  対話: cargo run --release -- --load models/chat --interactive");
        }
        return Ok(());
    }

    // 推論モード
    let load_dir = checkpoint_dir.context("--load (or --train with --save) is required for inference")?;
    let (model, vocabulary) = load_checkpoint::<B>(&load_dir, true, &device)?;
    let mut session = Session::new(model);

    if let Some(question) = &args.predict {
        answer(&mut session, &vocabulary, question)?;
    }

    if args.interactive {
        chat(&mut session, &vocabulary, &load_dir)?;
    }

    Ok(())
}

fn answer<B: AutodiffBackend>(session: &mut Session<B>, vocabulary: &Vocabulary, question: &str) -> Result<()> {
    match predict_answer(session, vocabulary, question)? {
        Some(response) => println!("Q: {}\nA: {}", question, response),
        None => println!(
            "Q: {}\n(文が長すぎるか空です。最大{}語まで)",
            question,
            session.model().config().max_length_enco
        ),
    }
    Ok(())
}

fn chat<B: AutodiffBackend>(session: &mut Session<B>, vocabulary: &Vocabulary, load_dir: &Path) -> Result<()> {
    println!("対話モード（{}）: 空行またはexitで終了", load_dir.display());

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("Q: ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let question = line?;
        let question = question.trim();
        if question.is_empty() || question == "exit" {
            break;
        }

        match predict_answer(session, vocabulary, question)? {
            Some(response) => println!("A: {}\n", response),
            None => println!(
                "Error: 文が長すぎるか空です（最大{}語）\n",
                session.model().config().max_length_enco
            ),
        }
    }

    Ok(())
}
