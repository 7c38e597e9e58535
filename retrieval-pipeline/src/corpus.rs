use std::sync::Arc;

use common::{
    error::AppError,
    types::passage::PassageRecord,
    utils::{embedding::EmbeddingClient, usage::UsageTracker},
};
use tracing::{info, instrument};

use crate::{
    ann::{HnswIndex, HnswParams},
    batching::EmbeddingBatchPipeline,
};

/// Passages, their embeddings and the ANN index over them.
///
/// `passages[i]`, `embeddings[i]` and index label `i` always describe the same
/// passage. The corpus is immutable once built; clone the `Arc` to share it
/// between concurrent readers.
#[derive(Debug)]
pub struct Corpus {
    passages: Vec<PassageRecord>,
    embeddings: Vec<Vec<f32>>,
    index: HnswIndex,
}

impl Corpus {
    /// Indexes already-embedded passages. Capacity is fixed to the passage count.
    pub fn build(
        passages: Vec<PassageRecord>,
        embeddings: Vec<Vec<f32>>,
        params: HnswParams,
    ) -> Result<Self, AppError> {
        if passages.len() != embeddings.len() {
            return Err(AppError::Validation(format!(
                "{} passages but {} embeddings",
                passages.len(),
                embeddings.len()
            )));
        }
        if let Some((position, passage)) = passages
            .iter()
            .enumerate()
            .find(|(position, passage)| passage.id() != *position)
        {
            return Err(AppError::Validation(format!(
                "passage at position {position} has id {}; ids must equal positions",
                passage.id()
            )));
        }

        let index = HnswIndex::build(embeddings.clone(), passages.len(), params)?;
        Ok(Self {
            passages,
            embeddings,
            index,
        })
    }

    /// Embeds `passages` in batches with the document intent and indexes them.
    /// Any failed batch aborts ingestion so a partial corpus is never built.
    #[instrument(skip_all, fields(passages = passages.len()))]
    pub async fn ingest(
        passages: Vec<PassageRecord>,
        client: &dyn EmbeddingClient,
        batching: &EmbeddingBatchPipeline,
        params: HnswParams,
        usage: &UsageTracker,
    ) -> Result<Arc<Self>, AppError> {
        let texts: Vec<String> = passages.iter().map(|p| p.text().to_string()).collect();
        let embeddings = batching.run(client, &texts, usage).await?;
        let corpus = Self::build(passages, embeddings, params)?;
        info!(passages = corpus.len(), "Corpus ready");
        Ok(Arc::new(corpus))
    }

    pub fn empty() -> Result<Self, AppError> {
        Self::build(Vec::new(), Vec::new(), HnswParams::default())
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn passage(&self, id: usize) -> Option<&PassageRecord> {
        self.passages.get(id)
    }

    pub fn passages(&self) -> &[PassageRecord] {
        &self.passages
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    pub fn index(&self) -> &HnswIndex {
        &self.index
    }
}
