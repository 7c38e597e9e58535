use std::{future::Future, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{
        embedding::{EmbeddingClient, EmbeddingIntent},
        usage::UsageTracker,
    },
};
use tracing::{debug, instrument};

use crate::{
    corpus::Corpus,
    reranking::{RerankClient, RerankHit},
    RetrievedPassage,
};

use super::{config::RetrievalTuning, PipelineStage, PipelineStageTimings, StageKind};

/// ANN candidates in the order the index returned them.
///
/// Ids and texts are kept side by side so a reranker position always maps
/// back to the passage it was produced for. Never reorder or filter one
/// without the other.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    ids: Vec<usize>,
    texts: Vec<String>,
}

impl CandidateSet {
    pub fn from_ids(corpus: &Corpus, ids: Vec<usize>) -> Result<Self, AppError> {
        let texts = ids
            .iter()
            .map(|&id| {
                corpus.passage(id).map(|p| p.text().to_string()).ok_or_else(|| {
                    AppError::InternalError(format!("ANN index returned unknown passage {id}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ids, texts })
    }

    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Passage id behind a reranker position.
    pub fn resolve(&self, position: usize) -> Option<usize> {
        self.ids.get(position).copied()
    }
}

pub struct PipelineContext<'a> {
    pub corpus: &'a Corpus,
    pub embedder: &'a dyn EmbeddingClient,
    pub reranker: &'a dyn RerankClient,
    pub usage: &'a UsageTracker,
    pub input_text: String,
    pub tuning: RetrievalTuning,
    pub query_embedding: Option<Vec<f32>>,
    pub candidates: CandidateSet,
    pub reranked: Vec<RerankHit>,
    pub results: Vec<RetrievedPassage>,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        corpus: &'a Corpus,
        embedder: &'a dyn EmbeddingClient,
        reranker: &'a dyn RerankClient,
        usage: &'a UsageTracker,
        input_text: String,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            corpus,
            embedder,
            reranker,
            usage,
            input_text,
            tuning,
            query_embedding: None,
            candidates: CandidateSet::default(),
            reranked: Vec::new(),
            results: Vec::new(),
            stage_timings: PipelineStageTimings::default(),
        }
    }

    fn ensure_embedding(&self) -> Result<&Vec<f32>, AppError> {
        self.query_embedding.as_ref().ok_or_else(|| {
            AppError::InternalError(
                "query embedding missing before candidate collection".to_string(),
            )
        })
    }

    fn query_context(&self) -> String {
        let preview: String = self.input_text.chars().take(40).collect();
        format!("query '{}'", preview.replace('\n', " "))
    }

    pub fn take_stage_timings(&mut self) -> PipelineStageTimings {
        std::mem::take(&mut self.stage_timings)
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: Duration) {
        self.stage_timings.record(kind, duration);
    }

    pub fn take_results(&mut self) -> Vec<RetrievedPassage> {
        std::mem::take(&mut self.results)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmbedStage;

#[async_trait]
impl PipelineStage for EmbedStage {
    fn kind(&self) -> StageKind {
        StageKind::Embed
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        embed(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectCandidatesStage;

#[async_trait]
impl PipelineStage for CollectCandidatesStage {
    fn kind(&self) -> StageKind {
        StageKind::CollectCandidates
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        collect_candidates(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        rerank(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssembleStage;

#[async_trait]
impl PipelineStage for AssembleStage {
    fn kind(&self) -> StageKind {
        StageKind::Assemble
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        assemble(ctx)
    }
}

#[instrument(level = "trace", skip_all)]
pub async fn embed(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    if ctx.query_embedding.is_some() {
        debug!("Reusing cached query embedding");
        return Ok(());
    }

    debug!("Generating query embedding");
    let context = ctx.query_context();
    let texts = [ctx.input_text.clone()];
    let vectors = with_timeout(
        "embedding",
        &context,
        ctx.tuning.request_timeout,
        ctx.embedder.embed(&texts, EmbeddingIntent::Query, ctx.usage),
    )
    .await?;

    let embedding = vectors
        .into_iter()
        .next()
        .ok_or_else(|| AppError::upstream("embedding", &context, "no vector returned for query"))?;

    let expected = ctx.corpus.index().dimension();
    if embedding.len() != expected {
        return Err(AppError::upstream(
            "embedding",
            context,
            format!(
                "query vector has dimension {}, corpus expects {expected}",
                embedding.len()
            ),
        ));
    }
    if embedding.iter().any(|value| !value.is_finite()) {
        return Err(AppError::upstream(
            "embedding",
            context,
            "query vector contains non-finite values",
        ));
    }
    ctx.query_embedding = Some(embedding);
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub fn collect_candidates(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let embedding = ctx.ensure_embedding()?;
    let neighbors = ctx
        .corpus
        .index()
        .query(embedding, ctx.tuning.retrieve_top_k)?;
    debug!(
        requested = ctx.tuning.retrieve_top_k,
        candidates = neighbors.len(),
        "Collected ANN candidates"
    );

    let ids = neighbors.into_iter().map(|n| n.id).collect();
    ctx.candidates = CandidateSet::from_ids(ctx.corpus, ids)?;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn rerank(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    if ctx.candidates.is_empty() {
        debug!("No candidates to rerank");
        return Ok(());
    }

    let context = format!(
        "{} with {} candidates",
        ctx.query_context(),
        ctx.candidates.len()
    );
    let top_n = ctx.tuning.rerank_top_k;
    let hits = with_timeout(
        "rerank",
        &context,
        ctx.tuning.request_timeout,
        ctx.reranker
            .rerank(&ctx.input_text, ctx.candidates.texts(), top_n, ctx.usage),
    )
    .await?;

    // Implementations validate too; this keeps the position mapping safe
    // for any client.
    ctx.reranked = RerankHit::validate(hits, ctx.candidates.len(), top_n)
        .map_err(|message| AppError::upstream("rerank", context, message))?;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub fn assemble(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let mut results = Vec::with_capacity(ctx.reranked.len());
    for hit in &ctx.reranked {
        let id = ctx.candidates.resolve(hit.index).ok_or_else(|| {
            AppError::InternalError(format!("rerank position {} has no candidate", hit.index))
        })?;
        let passage = ctx.corpus.passage(id).ok_or_else(|| {
            AppError::InternalError(format!("candidate {id} missing from corpus"))
        })?;
        results.push(RetrievedPassage {
            id,
            title: passage.title().to_string(),
            text: passage.text().to_string(),
            metadata: passage.metadata().to_string(),
            score: hit.score,
        });
    }

    debug!(results = results.len(), "Assembled reranked passages");
    ctx.results = results;
    Ok(())
}

/// Bounds a collaborator call. Expiry is reported as an upstream failure.
async fn with_timeout<T, F>(
    service: &'static str,
    context: &str,
    timeout: Duration,
    call: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(AppError::Upstream { service, message, .. })) => {
            Err(AppError::upstream(service, context, message))
        }
        Ok(Err(other)) => Err(AppError::upstream(service, context, other)),
        Err(_) => Err(AppError::upstream(
            service,
            context,
            format!("timed out after {}s", timeout.as_secs()),
        )),
    }
}
