mod args;

use std::sync::Arc;

use args::{Cli, Command, IndexPagesArgs, RetrieveArgs};
use clap::Parser;
use common::utils::{
    config::{get_config, AppConfig},
    embedding::EmbeddingProvider,
    usage::UsageTracker,
};
use ingestion_pipeline::{load_pages, load_structure};
use retrieval_pipeline::{
    reranker_from_config, BatchingConfig, Corpus, EmbeddingBatchPipeline, HnswParams,
    PageScorerConfig, RetrievalTuning, TwoStageRetriever, WeightedKeywordPageScorer,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let mut config = get_config()?;
    let usage = UsageTracker::new();

    match cli.command {
        Command::Retrieve(args) => {
            args.apply(&mut config);
            retrieve(&config, &args, &usage).await?;
        }
        Command::IndexPages(args) => {
            args.apply(&mut config);
            index_pages(&config, &args, &usage).await?;
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "usage": usage.snapshot() }))?
    );
    Ok(())
}

async fn retrieve(
    config: &AppConfig,
    args: &RetrieveArgs,
    usage: &UsageTracker,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()?;
    let passages = load_structure(&args.source, &http).await?;

    let embedder = Arc::new(
        EmbeddingProvider::from_config(
            config,
            &config.embedding_backend,
            config.embedding_model.clone(),
        )
        .await?,
    );
    info!(
        backend = embedder.backend_label(),
        model = ?embedder.model_code(),
        dimension = embedder.dimension(),
        "Embedding provider ready"
    );
    let batching = EmbeddingBatchPipeline::new(BatchingConfig::from_config(config))?
        .with_expected_dimension(embedder.dimension());

    let corpus = Corpus::ingest(
        passages,
        embedder.as_ref(),
        &batching,
        HnswParams::from_config(config),
        usage,
    )
    .await?;

    let retriever = TwoStageRetriever::new(
        corpus,
        embedder,
        reranker_from_config(config)?,
        RetrievalTuning::from_config(config),
    )?;

    for query in &args.queries {
        let output = retriever.retrieve(query, usage).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "query": query,
                "passages": output.passages,
                "ids": output.ids,
                "timings_ms": output.stage_timings.to_json(),
            }))?
        );
    }
    Ok(())
}

async fn index_pages(
    config: &AppConfig,
    args: &IndexPagesArgs,
    usage: &UsageTracker,
) -> Result<(), Box<dyn std::error::Error>> {
    let pages = load_pages(&args.pages).await?;
    let model = Arc::new(
        EmbeddingProvider::from_config(
            config,
            &config.similarity_backend,
            config.similarity_model.clone(),
        )
        .await?,
    );

    let scorer = WeightedKeywordPageScorer::new(
        model,
        config.index_keywords.clone(),
        PageScorerConfig::from_config(config),
    )?;
    let matches = scorer.score(&pages, usage).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "matches": matches.by_score(),
            "pages": matches.page_numbers_by_position(),
        }))?
    );
    Ok(())
}
