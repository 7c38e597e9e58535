mod config;
mod stages;

pub use config::RetrievalTuning;
pub use stages::CandidateSet;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{embedding::EmbeddingClient, usage::UsageTracker},
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::{corpus::Corpus, reranking::RerankClient, RetrievedPassage};

use stages::{AssembleStage, CollectCandidatesStage, EmbedStage, PipelineContext, RerankStage};

// Stage type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Embed,
    CollectCandidates,
    Rerank,
    Assemble,
}

// Pipeline stage trait
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

// Type alias for boxed stages
pub type BoxedStage = Box<dyn PipelineStage>;

// Pipeline stage timings tracker
#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    fn get_stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_millis())
            .unwrap_or(0)
    }

    pub fn embed_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Embed)
    }

    pub fn collect_candidates_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::CollectCandidates)
    }

    pub fn rerank_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Rerank)
    }

    pub fn assemble_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Assemble)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "embed": self.embed_ms(),
            "collect_candidates": self.collect_candidates_ms(),
            "rerank": self.rerank_ms(),
            "assemble": self.assemble_ms(),
        })
    }
}

/// Ranked passages plus the parallel list of their corpus ids.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    pub passages: Vec<RetrievedPassage>,
    /// `ids[i] == passages[i].id`, kept separately for consumers that only
    /// need to highlight positions in the full corpus.
    pub ids: Vec<usize>,
    pub stage_timings: PipelineStageTimings,
}

impl RetrievalOutput {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// Embeds a query, pulls ANN candidates from the corpus and reranks them.
///
/// The corpus is shared read-only, so one retriever can serve concurrent
/// queries.
pub struct TwoStageRetriever {
    corpus: Arc<Corpus>,
    embedder: Arc<dyn EmbeddingClient>,
    reranker: Arc<dyn RerankClient>,
    tuning: RetrievalTuning,
}

impl TwoStageRetriever {
    pub fn new(
        corpus: Arc<Corpus>,
        embedder: Arc<dyn EmbeddingClient>,
        reranker: Arc<dyn RerankClient>,
        tuning: RetrievalTuning,
    ) -> Result<Self, AppError> {
        tuning.validate()?;
        Ok(Self {
            corpus,
            embedder,
            reranker,
            tuning,
        })
    }

    fn stages() -> Vec<BoxedStage> {
        vec![
            Box::new(EmbedStage),
            Box::new(CollectCandidatesStage),
            Box::new(RerankStage),
            Box::new(AssembleStage),
        ]
    }

    /// Answers `query` with at most `rerank_top_k` passages in rerank order.
    ///
    /// An empty corpus yields an empty output without calling any service.
    #[instrument(skip_all, fields(corpus = self.corpus.len()))]
    pub async fn retrieve(
        &self,
        query: &str,
        usage: &UsageTracker,
    ) -> Result<RetrievalOutput, AppError> {
        let input_chars = query.chars().count();
        let input_preview: String = query.chars().take(120).collect();
        let input_preview_clean = input_preview.replace('\n', " ");
        let preview_len = input_preview_clean.chars().count();
        info!(
            input_chars,
            preview_truncated = input_chars > preview_len,
            preview = %input_preview_clean,
            "Starting retrieval pipeline"
        );

        if self.corpus.is_empty() {
            info!("Corpus is empty; returning no passages");
            return Ok(RetrievalOutput::default());
        }

        let mut ctx = PipelineContext::new(
            &self.corpus,
            self.embedder.as_ref(),
            self.reranker.as_ref(),
            usage,
            query.to_owned(),
            self.tuning,
        );

        for stage in Self::stages() {
            let start = Instant::now();
            stage.execute(&mut ctx).await?;
            ctx.record_stage_duration(stage.kind(), start.elapsed());
        }

        let stage_timings = ctx.take_stage_timings();
        let passages = ctx.take_results();
        let ids = passages.iter().map(|p| p.id).collect();
        info!(
            candidates = ctx.candidates.len(),
            results = passages.len(),
            "Finished retrieval pipeline"
        );

        Ok(RetrievalOutput {
            passages,
            ids,
            stage_timings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ann::HnswParams, reranking::RerankHit};
    use common::{
        types::passage::PassageRecord,
        utils::embedding::{EmbeddingIntent, EmbeddingProvider},
    };
    use tokio::sync::Mutex;

    fn fruit_vector(text: &str) -> Vec<f32> {
        if text.contains("apples") {
            vec![0.99, 0.14, 0.0]
        } else if text.contains("bananas") {
            vec![0.98, 0.0, 0.2]
        } else if text.contains("fruit") {
            vec![1.0, 0.0, 0.0]
        } else {
            vec![0.0, 1.0, 0.0]
        }
    }

    #[derive(Default)]
    struct MockEmbedder {
        calls: Mutex<Vec<(Vec<String>, EmbeddingIntent)>>,
    }

    #[async_trait]
    impl EmbeddingClient for MockEmbedder {
        async fn embed(
            &self,
            texts: &[String],
            intent: EmbeddingIntent,
            usage: &UsageTracker,
        ) -> Result<Vec<Vec<f32>>, AppError> {
            self.calls.lock().await.push((texts.to_vec(), intent));
            usage.record_embedding(texts.len(), None);
            Ok(texts.iter().map(|t| fruit_vector(t)).collect())
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    /// Scores candidates by a fixed word preference and records what it saw.
    struct MockReranker {
        preferred: &'static str,
        seen: Mutex<Vec<Vec<String>>>,
        forced: Option<Vec<RerankHit>>,
    }

    impl MockReranker {
        fn preferring(word: &'static str) -> Self {
            Self {
                preferred: word,
                seen: Mutex::new(Vec::new()),
                forced: None,
            }
        }

        fn returning(hits: Vec<RerankHit>) -> Self {
            Self {
                forced: Some(hits),
                ..Self::preferring("")
            }
        }
    }

    #[async_trait]
    impl RerankClient for MockReranker {
        async fn rerank(
            &self,
            _query: &str,
            candidates: &[String],
            top_n: usize,
            usage: &UsageTracker,
        ) -> Result<Vec<RerankHit>, AppError> {
            self.seen.lock().await.push(candidates.to_vec());
            usage.record_rerank(candidates.len(), None);
            if let Some(hits) = &self.forced {
                return Ok(hits.clone());
            }
            let mut hits: Vec<RerankHit> = candidates
                .iter()
                .enumerate()
                .map(|(index, text)| RerankHit {
                    index,
                    score: if text.contains(self.preferred) {
                        0.9
                    } else {
                        0.1 / (index as f32 + 1.0)
                    },
                })
                .collect();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            hits.truncate(top_n);
            Ok(hits)
        }
    }

    fn records(texts: &[&str]) -> Vec<PassageRecord> {
        PassageRecord::from_ordered(texts.iter().enumerate().map(|(i, t)| {
            (format!("title {i}"), (*t).to_string(), format!("1_{i}"))
        }))
    }

    fn fruit_corpus() -> Arc<Corpus> {
        let passages = records(&["apples are fruit", "cars have wheels", "bananas are fruit"]);
        let embeddings = passages.iter().map(|p| fruit_vector(p.text())).collect();
        Arc::new(Corpus::build(passages, embeddings, HnswParams::default()).unwrap())
    }

    fn tuning(retrieve_top_k: usize, rerank_top_k: usize) -> RetrievalTuning {
        RetrievalTuning {
            retrieve_top_k,
            rerank_top_k,
            ..RetrievalTuning::default()
        }
    }

    #[tokio::test]
    async fn fruit_query_reranks_ann_candidates() {
        let embedder = Arc::new(MockEmbedder::default());
        let reranker = Arc::new(MockReranker::preferring("bananas"));
        let retriever = TwoStageRetriever::new(
            fruit_corpus(),
            embedder.clone(),
            reranker.clone(),
            tuning(2, 1),
        )
        .unwrap();
        let usage = UsageTracker::new();

        let output = retriever.retrieve("fruit", &usage).await.unwrap();

        let seen = reranker.seen.lock().await;
        assert_eq!(
            seen[0],
            vec!["apples are fruit".to_string(), "bananas are fruit".to_string()]
        );
        assert_eq!(output.ids, vec![2]);
        assert_eq!(output.passages.len(), 1);
        assert_eq!(output.passages[0].text, "bananas are fruit");
        assert_eq!(output.passages[0].title, "title 2");
        assert_eq!(output.passages[0].metadata, "1_2");
        assert!((output.passages[0].score - 0.9).abs() < f32::EPSILON);

        let calls = embedder.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec!["fruit".to_string()]);
        assert_eq!(calls[0].1, EmbeddingIntent::Query);

        let snapshot = usage.snapshot();
        assert_eq!(snapshot.embedding_requests, 1);
        assert_eq!(snapshot.rerank_requests, 1);
        assert_eq!(snapshot.reranked_documents, 2);
    }

    /// Returns a fixed vector for every text, whatever the corpus dimension.
    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        async fn embed(
            &self,
            texts: &[String],
            _intent: EmbeddingIntent,
            _usage: &UsageTracker,
        ) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }

        fn dimension(&self) -> usize {
            self.0.len()
        }
    }

    #[tokio::test]
    async fn malformed_query_vector_is_an_upstream_error_naming_the_query() {
        for vector in [vec![1.0, 0.0], vec![f32::NAN, 0.0, 0.0]] {
            let reranker = Arc::new(MockReranker::preferring("fruit"));
            let retriever = TwoStageRetriever::new(
                fruit_corpus(),
                Arc::new(FixedEmbedder(vector)),
                reranker.clone(),
                tuning(2, 1),
            )
            .unwrap();

            let err = retriever
                .retrieve("fruit", &UsageTracker::new())
                .await
                .unwrap_err();
            match err {
                AppError::Upstream {
                    service, context, ..
                } => {
                    assert_eq!(service, "embedding");
                    assert_eq!(context, "query 'fruit'");
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(reranker.seen.lock().await.is_empty());
        }
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty_without_service_calls() {
        let embedder = Arc::new(MockEmbedder::default());
        let reranker = Arc::new(MockReranker::preferring("fruit"));
        let retriever = TwoStageRetriever::new(
            Arc::new(Corpus::empty().unwrap()),
            embedder.clone(),
            reranker.clone(),
            RetrievalTuning::default(),
        )
        .unwrap();

        let output = retriever
            .retrieve("anything", &UsageTracker::new())
            .await
            .unwrap();

        assert!(output.is_empty());
        assert!(output.ids.is_empty());
        assert!(embedder.calls.lock().await.is_empty());
        assert!(reranker.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn retrieve_top_k_larger_than_corpus_uses_every_passage() {
        let reranker = Arc::new(MockReranker::preferring("wheels"));
        let retriever = TwoStageRetriever::new(
            fruit_corpus(),
            Arc::new(MockEmbedder::default()),
            reranker.clone(),
            tuning(10, 3),
        )
        .unwrap();

        let output = retriever
            .retrieve("fruit", &UsageTracker::new())
            .await
            .unwrap();

        assert_eq!(reranker.seen.lock().await[0].len(), 3);
        assert_eq!(output.passages.len(), 3);
        assert_eq!(output.ids[0], 1);
    }

    #[tokio::test]
    async fn results_are_capped_and_drawn_from_candidates() {
        let texts = [
            "alpha river stone",
            "beta river cloud",
            "gamma desert sand",
            "delta river mouth",
            "epsilon forest leaf",
            "zeta river bank",
            "eta ocean wave",
            "theta river delta",
        ];
        let provider = EmbeddingProvider::new_hashed(128).unwrap();
        let usage = UsageTracker::new();
        let passages = records(&texts);
        let embeddings = provider
            .embed(
                &passages.iter().map(|p| p.text().to_string()).collect::<Vec<_>>(),
                EmbeddingIntent::Document,
                &usage,
            )
            .await
            .unwrap();
        let corpus = Arc::new(Corpus::build(passages, embeddings, HnswParams::default()).unwrap());

        let reranker = Arc::new(MockReranker::preferring("river"));
        let retriever = TwoStageRetriever::new(
            corpus.clone(),
            Arc::new(provider),
            reranker.clone(),
            tuning(5, 3),
        )
        .unwrap();

        let output = retriever.retrieve("river", &usage).await.unwrap();

        assert!(output.passages.len() <= 3);
        assert_eq!(output.passages.len(), output.ids.len());
        let seen = reranker.seen.lock().await;
        assert_eq!(seen[0].len(), 5);
        for (id, passage) in output.ids.iter().zip(&output.passages) {
            assert_eq!(*id, passage.id);
            assert!(seen[0].iter().any(|text| text == corpus.passage(*id).unwrap().text()));
        }
        for pair in output.passages.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn rerank_positions_map_back_to_candidate_ids() {
        // Candidates arrive as [0, 2]; position 1 must resolve to passage 2.
        let reranker = Arc::new(MockReranker::returning(vec![
            RerankHit {
                index: 1,
                score: 0.8,
            },
            RerankHit {
                index: 0,
                score: 0.3,
            },
        ]));
        let retriever = TwoStageRetriever::new(
            fruit_corpus(),
            Arc::new(MockEmbedder::default()),
            reranker,
            tuning(2, 2),
        )
        .unwrap();

        let output = retriever
            .retrieve("fruit", &UsageTracker::new())
            .await
            .unwrap();

        assert_eq!(output.ids, vec![2, 0]);
    }

    #[tokio::test]
    async fn out_of_range_rerank_index_is_an_upstream_error() {
        let reranker = Arc::new(MockReranker::returning(vec![RerankHit {
            index: 7,
            score: 0.5,
        }]));
        let retriever = TwoStageRetriever::new(
            fruit_corpus(),
            Arc::new(MockEmbedder::default()),
            reranker,
            tuning(2, 1),
        )
        .unwrap();

        let err = retriever
            .retrieve("fruit", &UsageTracker::new())
            .await
            .unwrap_err();

        match err {
            AppError::Upstream {
                service, context, ..
            } => {
                assert_eq!(service, "rerank");
                assert!(context.contains("fruit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn records_every_stage_timing() {
        let retriever = TwoStageRetriever::new(
            fruit_corpus(),
            Arc::new(MockEmbedder::default()),
            Arc::new(MockReranker::preferring("apples")),
            tuning(2, 1),
        )
        .unwrap();

        let output = retriever
            .retrieve("fruit", &UsageTracker::new())
            .await
            .unwrap();

        let kinds: Vec<StageKind> = output
            .stage_timings
            .into_vec()
            .into_iter()
            .map(|(kind, _)| kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Embed,
                StageKind::CollectCandidates,
                StageKind::Rerank,
                StageKind::Assemble
            ]
        );
    }
}
