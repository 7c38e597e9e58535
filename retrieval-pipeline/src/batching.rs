use std::time::{Duration, Instant};

use common::{
    error::AppError,
    utils::{
        config::AppConfig,
        embedding::{EmbeddingClient, EmbeddingIntent},
        usage::UsageTracker,
    },
};
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

/// Knobs for [`EmbeddingBatchPipeline`]. Batch size and concurrency change
/// throughput only; the output is identical for any valid setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingConfig {
    pub batch_size: usize,
    /// Batch calls allowed in flight at once.
    pub concurrency: usize,
    /// Upper bound for a single batch call.
    pub timeout: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 90,
            concurrency: 1,
            timeout: Duration::from_secs(120),
        }
    }
}

impl BatchingConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.embedding_batch_size,
            concurrency: config.embedding_concurrency,
            timeout: config.request_timeout(),
        }
    }
}

/// Splits an ordered list of texts into contiguous batches, embeds each batch
/// and concatenates the vectors back in input order.
#[derive(Debug, Clone)]
pub struct EmbeddingBatchPipeline {
    config: BatchingConfig,
    expected_dimension: Option<usize>,
}

impl EmbeddingBatchPipeline {
    pub fn new(config: BatchingConfig) -> Result<Self, AppError> {
        if config.batch_size == 0 {
            return Err(AppError::Validation(
                "EMBEDDING_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }
        if config.concurrency == 0 {
            return Err(AppError::Validation(
                "EMBEDDING_CONCURRENCY must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            config,
            expected_dimension: None,
        })
    }

    /// Rejects any batch whose vectors are not `dimension` long.
    pub fn with_expected_dimension(mut self, dimension: usize) -> Self {
        self.expected_dimension = Some(dimension);
        self
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Number of calls `run` will make for `items` texts.
    pub fn batch_count(&self, items: usize) -> usize {
        items.div_ceil(self.config.batch_size)
    }

    /// Embeds every text with the document intent. `result[i]` belongs to
    /// `texts[i]`. The first failing batch aborts the run and nothing is returned.
    #[instrument(skip_all, fields(items = texts.len(), batch_size = self.config.batch_size))]
    pub async fn run(
        &self,
        client: &dyn EmbeddingClient,
        texts: &[String],
        usage: &UsageTracker,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        self.run_with_intent(client, texts, EmbeddingIntent::Document, usage)
            .await
    }

    pub async fn run_with_intent(
        &self,
        client: &dyn EmbeddingClient,
        texts: &[String],
        intent: EmbeddingIntent,
        usage: &UsageTracker,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let batches = self.batch_count(texts.len());
        let batch_size = self.config.batch_size;

        // `buffered` yields results in submission order regardless of which
        // call finishes first.
        let per_batch: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(batch_size).enumerate())
            .map(|(batch, chunk)| {
                let start = batch * batch_size;
                self.embed_batch(client, batch, start, chunk, intent, usage)
            })
            .buffered(self.config.concurrency)
            .try_collect()
            .await?;

        let vectors: Vec<Vec<f32>> = per_batch.into_iter().flatten().collect();
        if vectors.len() != texts.len() {
            return Err(AppError::InternalError(format!(
                "batched embedding produced {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        info!(
            items = texts.len(),
            batches,
            %intent,
            elapsed_ms = started.elapsed().as_millis(),
            "Embedded texts"
        );
        Ok(vectors)
    }

    async fn embed_batch(
        &self,
        client: &dyn EmbeddingClient,
        batch: usize,
        start: usize,
        chunk: &[String],
        intent: EmbeddingIntent,
        usage: &UsageTracker,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let end = start + chunk.len();
        let context = format!("batch {batch} (items {start}..{end})");
        debug!(batch, start, end, "Embedding batch");

        let vectors = tokio::time::timeout(self.config.timeout, client.embed(chunk, intent, usage))
            .await
            .map_err(|_| {
                AppError::upstream(
                    "embedding",
                    context.clone(),
                    format!("timed out after {}s", self.config.timeout.as_secs()),
                )
            })?
            .map_err(|err| match err {
                AppError::Upstream { service, message, .. } => {
                    AppError::upstream(service, context.clone(), message)
                }
                other => AppError::upstream("embedding", context.clone(), other.to_string()),
            })?;

        if vectors.len() != chunk.len() {
            return Err(AppError::upstream(
                "embedding",
                context,
                format!("expected {} vectors, received {}", chunk.len(), vectors.len()),
            ));
        }
        if let Some(expected) = self.expected_dimension {
            if let Some((position, vector)) = vectors
                .iter()
                .enumerate()
                .find(|(_, vector)| vector.len() != expected)
            {
                return Err(AppError::upstream(
                    "embedding",
                    context,
                    format!(
                        "vector {} has dimension {}, expected {expected}",
                        start + position,
                        vector.len()
                    ),
                ));
            }
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Encodes each text as `[len, first byte]` and records every call.
    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<(usize, EmbeddingIntent)>>,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl EmbeddingClient for RecordingClient {
        async fn embed(
            &self,
            texts: &[String],
            intent: EmbeddingIntent,
            usage: &UsageTracker,
        ) -> Result<Vec<Vec<f32>>, AppError> {
            let mut calls = self.calls.lock().await;
            let call = calls.len();
            calls.push((texts.len(), intent));
            if self.fail_on_call == Some(call) {
                return Err(AppError::upstream("embedding", "mock", "service unavailable"));
            }
            usage.record_embedding(texts.len(), None);
            Ok(texts
                .iter()
                .map(|text| {
                    vec![
                        text.len() as f32,
                        f32::from(text.bytes().next().unwrap_or_default()),
                    ]
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn texts(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{}-{}", (b'a' + (i % 26) as u8) as char, "x".repeat(i))).collect()
    }

    fn pipeline(batch_size: usize) -> EmbeddingBatchPipeline {
        EmbeddingBatchPipeline::new(BatchingConfig {
            batch_size,
            ..BatchingConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn preserves_input_order_across_batches() {
        let client = RecordingClient::default();
        let usage = UsageTracker::new();
        let input = texts(25);

        let vectors = pipeline(4).run(&client, &input, &usage).await.unwrap();

        assert_eq!(vectors.len(), input.len());
        for (text, vector) in input.iter().zip(&vectors) {
            assert_eq!(vector[0], text.len() as f32);
        }
    }

    #[tokio::test]
    async fn batch_size_does_not_change_output() {
        let input = texts(37);
        let usage = UsageTracker::new();

        let mut outputs = Vec::new();
        for batch_size in [1, 5, 36, 37, 90] {
            let client = RecordingClient::default();
            outputs.push(pipeline(batch_size).run(&client, &input, &usage).await.unwrap());
        }
        for output in &outputs[1..] {
            assert_eq!(output, &outputs[0]);
        }
    }

    #[tokio::test]
    async fn concurrency_does_not_change_output() {
        let input = texts(40);
        let usage = UsageTracker::new();
        let sequential = pipeline(3)
            .run(&RecordingClient::default(), &input, &usage)
            .await
            .unwrap();
        let parallel = EmbeddingBatchPipeline::new(BatchingConfig {
            batch_size: 3,
            concurrency: 4,
            ..BatchingConfig::default()
        })
        .unwrap()
        .run(&RecordingClient::default(), &input, &usage)
        .await
        .unwrap();

        assert_eq!(sequential, parallel);
    }

    #[tokio::test]
    async fn issues_one_document_call_per_batch() {
        let client = RecordingClient::default();
        let usage = UsageTracker::new();
        let input = texts(200);

        pipeline(90).run(&client, &input, &usage).await.unwrap();

        let calls = client.calls.lock().await;
        assert_eq!(
            *calls,
            vec![
                (90, EmbeddingIntent::Document),
                (90, EmbeddingIntent::Document),
                (20, EmbeddingIntent::Document),
            ]
        );
        assert_eq!(usage.snapshot().embedded_texts, 200);
        assert_eq!(pipeline(90).batch_count(200), 3);
    }

    #[tokio::test]
    async fn failing_batch_aborts_with_batch_context() {
        let client = RecordingClient {
            fail_on_call: Some(1),
            ..RecordingClient::default()
        };
        let usage = UsageTracker::new();

        let err = pipeline(10)
            .run(&client, &texts(30), &usage)
            .await
            .unwrap_err();

        match err {
            AppError::Upstream { service, context, .. } => {
                assert_eq!(service, "embedding");
                assert_eq!(context, "batch 1 (items 10..20)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let client = RecordingClient::default();
        let usage = UsageTracker::new();
        let result = pipeline(5)
            .with_expected_dimension(1024)
            .run(&client, &texts(3), &usage)
            .await;

        assert!(matches!(result, Err(AppError::Upstream { .. })));
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let client = RecordingClient::default();
        let usage = UsageTracker::new();
        let vectors = pipeline(5).run(&client, &[], &usage).await.unwrap();

        assert!(vectors.is_empty());
        assert!(client.calls.lock().await.is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = EmbeddingBatchPipeline::new(BatchingConfig {
            batch_size: 0,
            ..BatchingConfig::default()
        });
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
