mod cohere;

use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{config::AppConfig, usage::UsageTracker},
};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::scoring::score_desc;

pub use cohere::CohereReranker;

/// A candidate's position in the list passed to the reranker plus its
/// relevance score. The reranker only knows positions, never passage ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankHit {
    pub index: usize,
    pub score: f32,
}

impl RerankHit {
    /// Checks raw reranker output against the candidate list it was produced
    /// for, then orders it by descending score and keeps at most `top_n`.
    ///
    /// Out-of-range or repeated indices and non-finite scores are rejected.
    pub fn validate(
        mut hits: Vec<Self>,
        candidate_count: usize,
        top_n: usize,
    ) -> Result<Vec<Self>, String> {
        let mut seen = HashSet::with_capacity(hits.len());
        for hit in &hits {
            if hit.index >= candidate_count {
                return Err(format!(
                    "rerank index {} out of range for {candidate_count} candidates",
                    hit.index
                ));
            }
            if !seen.insert(hit.index) {
                return Err(format!("rerank index {} returned more than once", hit.index));
            }
            if !hit.score.is_finite() {
                return Err(format!("rerank score for index {} is not finite", hit.index));
            }
        }

        hits.sort_by(|a, b| score_desc(a.score, b.score));
        hits.truncate(top_n);
        Ok(hits)
    }
}

/// Scores `candidates` against `query` and returns at most `top_n` hits in
/// descending score order.
#[async_trait]
pub trait RerankClient: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
        top_n: usize,
        usage: &UsageTracker,
    ) -> Result<Vec<RerankHit>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankBackend {
    FastEmbed,
    Cohere,
}

impl std::str::FromStr for RerankBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            "cohere" => Ok(Self::Cohere),
            other => Err(AppError::Validation(format!(
                "unknown rerank backend '{other}'. Expected 'fastembed' or 'cohere'."
            ))),
        }
    }
}

/// Builds the reranker named by `RERANK_BACKEND`.
pub fn reranker_from_config(config: &AppConfig) -> Result<Arc<dyn RerankClient>, AppError> {
    let backend: RerankBackend = config.rerank_backend.parse()?;
    info!(?backend, model = ?config.rerank_model, "Initialising reranker");
    match backend {
        RerankBackend::FastEmbed => {
            let pool: Arc<dyn RerankClient> = RerankerPool::from_config(config)?;
            Ok(pool)
        }
        RerankBackend::Cohere => Ok(Arc::new(CohereReranker::from_config(config)?)),
    }
}

pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    next_engine: AtomicUsize,
}

impl RerankerPool {
    /// Build the pool at startup.
    /// `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "RERANKING_POOL_SIZE must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_engine: AtomicUsize::new(0),
        }))
    }

    pub fn from_config(config: &AppConfig) -> Result<Arc<Self>, AppError> {
        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        let init_options = build_rerank_init_options(config)?;
        Self::new_with_options(pool_size, init_options)
    }

    /// Check out capacity + pick an engine.
    /// This returns a lease that can perform rerank().
    pub async fn checkout(&self) -> Result<RerankerLease, AppError> {
        // Acquire a permit. This enforces backpressure.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool is closed".to_string()))?;

        let idx = self.next_engine.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        let engine = self
            .engines
            .get(idx)
            .cloned()
            .ok_or_else(|| AppError::InternalError("reranker pool has no engines".to_string()))?;

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

#[async_trait]
impl RerankClient for RerankerPool {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
        top_n: usize,
        usage: &UsageTracker,
    ) -> Result<Vec<RerankHit>, AppError> {
        let context = format!("{} candidates", candidates.len());
        let lease = self.checkout().await?;
        let hits = lease
            .rerank(query, candidates.to_vec())
            .await
            .map_err(|err| AppError::upstream("rerank", context.clone(), err))?;
        usage.record_rerank(candidates.len(), None);
        RerankHit::validate(hits, candidates.len(), top_n)
            .map_err(|message| AppError::upstream("rerank", context, message))
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = match config.rerank_model.as_deref() {
        Some(code) => RerankInitOptions::new(parse_rerank_model(code)?),
        None => RerankInitOptions::default(),
    };

    let cache_dir = config
        .fastembed_cache_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| env::var("RERANKING_CACHE_DIR").ok().map(PathBuf::from))
        .or_else(|| env::var("FASTEMBED_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;

    let show_progress = config
        .fastembed_show_download_progress
        .or_else(|| env_bool("RERANKING_SHOW_DOWNLOAD_PROGRESS"))
        .or_else(|| env_bool("FASTEMBED_SHOW_DOWNLOAD_PROGRESS"))
        .unwrap_or(true);
    options.show_download_progress = show_progress;

    if let Some(max_length) = config.fastembed_max_length.or_else(|| {
        env::var("RERANKING_MAX_LENGTH")
            .ok()
            .and_then(|value| value.parse().ok())
    }) {
        options.max_length = max_length;
    }

    Ok(options)
}

fn parse_rerank_model(code: &str) -> Result<RerankerModel, AppError> {
    TextRerank::list_supported_models()
        .into_iter()
        .find(|info| info.model_code.eq_ignore_ascii_case(code))
        .map(|info| info.model)
        .ok_or_else(|| AppError::Validation(format!("unknown FastEmbed rerank model '{code}'")))
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| is_truthy(&value))
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankHit>, AppError> {
        // Lock this specific engine so we get &mut TextRerank
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        Ok(results
            .into_iter()
            .map(|result| RerankHit {
                index: result.index,
                score: result.score,
            })
            .collect())
    }
}
