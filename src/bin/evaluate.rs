use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use inbox_classifier::config::EmbeddingConfig;
use inbox_classifier::embedding::{CentroidIntentClassifier, Embedder, HttpEmbedder};
use inbox_classifier::error::Result;
use inbox_classifier::pipeline::eval::{EvalReport, evaluate, load_golden};
use inbox_classifier::pipeline::taxonomy::Taxonomy;

#[derive(Parser, Debug)]
#[command(
    name = "inbox-classifier-evaluate",
    about = "Score the taxonomy and intent classifier against a golden set"
)]
struct EvalCli {
    /// Golden set JSONL
    #[arg(long)]
    data: PathBuf,

    /// Minimum acceptable value for each accuracy metric
    #[arg(long, default_value_t = 0.8)]
    threshold: f64,

    /// Taxonomy JSON with level-1 centroids
    #[arg(long, env = "TAXONOMY_PATH")]
    taxonomy: PathBuf,

    /// Intent centroids, in the taxonomy file format
    #[arg(long, env = "INTENT_CENTROIDS_PATH")]
    intents: PathBuf,
}

#[tokio::main]
async fn main() -> std::result::Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = EvalCli::parse();
    let report = run(&cli).await?;

    println!("Total samples: {}", report.total);
    println!("Level-1 accuracy: {:.3}", report.level1_accuracy);
    println!("Intent accuracy: {:.3}", report.intent_accuracy);
    println!("Confusion (intent):");
    for entry in &report.confusion {
        println!("{} -> {}: {}", entry.expected, entry.predicted, entry.count);
    }

    let failing = report.failing_metrics(cli.threshold);
    if failing.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for (metric, value) in failing {
        eprintln!(
            "{metric} {value:.3} below threshold {:.3}; failing.",
            cli.threshold
        );
    }
    Ok(ExitCode::FAILURE)
}

async fn run(cli: &EvalCli) -> Result<EvalReport> {
    let embedding_config = EmbeddingConfig::from_env()?;
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(&embedding_config)?);
    let taxonomy = Taxonomy::load(&cli.taxonomy)?;
    let intents = CentroidIntentClassifier::new(Arc::clone(&embedder), Taxonomy::load(&cli.intents)?);

    let examples = load_golden(&cli.data)?;
    Ok(evaluate(&examples, embedder.as_ref(), &taxonomy, &intents).await?)
}
