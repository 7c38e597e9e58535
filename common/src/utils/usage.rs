use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Accumulates usage reported by external services.
///
/// Create one per process (or per request scope) and pass it by reference to
/// every embedding, rerank and similarity call.
#[derive(Debug, Default)]
pub struct UsageTracker {
    embedding_requests: AtomicU64,
    embedded_texts: AtomicU64,
    embedding_tokens: AtomicU64,
    rerank_requests: AtomicU64,
    reranked_documents: AtomicU64,
    rerank_units: AtomicU64,
    similarity_requests: AtomicU64,
}

/// Point-in-time copy of the tracker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub embedding_requests: u64,
    pub embedded_texts: u64,
    pub embedding_tokens: u64,
    pub rerank_requests: u64,
    pub reranked_documents: u64,
    pub rerank_units: u64,
    pub similarity_requests: u64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_embedding(&self, texts: usize, tokens: Option<u64>) {
        self.embedding_requests.fetch_add(1, Ordering::Relaxed);
        self.embedded_texts
            .fetch_add(texts as u64, Ordering::Relaxed);
        if let Some(tokens) = tokens {
            self.embedding_tokens.fetch_add(tokens, Ordering::Relaxed);
        }
    }

    pub fn record_rerank(&self, documents: usize, units: Option<u64>) {
        self.rerank_requests.fetch_add(1, Ordering::Relaxed);
        self.reranked_documents
            .fetch_add(documents as u64, Ordering::Relaxed);
        if let Some(units) = units {
            self.rerank_units.fetch_add(units, Ordering::Relaxed);
        }
    }

    pub fn record_similarity(&self) {
        self.similarity_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            embedding_requests: self.embedding_requests.load(Ordering::Relaxed),
            embedded_texts: self.embedded_texts.load(Ordering::Relaxed),
            embedding_tokens: self.embedding_tokens.load(Ordering::Relaxed),
            rerank_requests: self.rerank_requests.load(Ordering::Relaxed),
            reranked_documents: self.reranked_documents.load(Ordering::Relaxed),
            rerank_units: self.rerank_units.load(Ordering::Relaxed),
            similarity_requests: self.similarity_requests.load(Ordering::Relaxed),
        }
    }

    /// Returns the current counters and zeroes them.
    pub fn reset(&self) -> UsageSnapshot {
        UsageSnapshot {
            embedding_requests: self.embedding_requests.swap(0, Ordering::Relaxed),
            embedded_texts: self.embedded_texts.swap(0, Ordering::Relaxed),
            embedding_tokens: self.embedding_tokens.swap(0, Ordering::Relaxed),
            rerank_requests: self.rerank_requests.swap(0, Ordering::Relaxed),
            reranked_documents: self.reranked_documents.swap(0, Ordering::Relaxed),
            rerank_units: self.rerank_units.swap(0, Ordering::Relaxed),
            similarity_requests: self.similarity_requests.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_resets_counters() {
        let usage = UsageTracker::new();
        usage.record_embedding(90, Some(1200));
        usage.record_embedding(10, None);
        usage.record_rerank(10, Some(1));
        usage.record_similarity();

        let snapshot = usage.snapshot();
        assert_eq!(snapshot.embedding_requests, 2);
        assert_eq!(snapshot.embedded_texts, 100);
        assert_eq!(snapshot.embedding_tokens, 1200);
        assert_eq!(snapshot.rerank_requests, 1);
        assert_eq!(snapshot.reranked_documents, 10);
        assert_eq!(snapshot.rerank_units, 1);
        assert_eq!(snapshot.similarity_requests, 1);

        let drained = usage.reset();
        assert_eq!(drained, snapshot);
        assert_eq!(usage.snapshot(), UsageSnapshot::default());
    }
}
