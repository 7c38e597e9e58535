pub mod ann;
pub mod batching;
pub mod corpus;
pub mod page_scoring;
pub mod pipeline;
pub mod reranking;
pub mod scoring;

use serde::Serialize;

pub use ann::{HnswIndex, HnswParams, Neighbor};
pub use batching::{BatchingConfig, EmbeddingBatchPipeline};
pub use corpus::Corpus;
pub use page_scoring::{
    PageMatches, PageRecord, PageScorerConfig, SimilarityMatch, WeightedKeywordPageScorer,
};
pub use pipeline::{
    PipelineStageTimings, RetrievalOutput, RetrievalTuning, StageKind, TwoStageRetriever,
};
pub use reranking::{reranker_from_config, CohereReranker, RerankClient, RerankHit, RerankerPool};

// Final passage representation returned to callers, carrying its rerank score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub id: usize,
    pub title: String,
    pub text: String,
    pub metadata: String,
    pub score: f32,
}
