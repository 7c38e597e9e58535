//! Locates pages that resemble structural keywords such as "INDEX" or
//! "TABLE OF CONTENTS".
//!
//! Each page and each keyword is embedded once from its upper-cased text. The
//! keyword vector is multiplied by the keyword's weight before comparison.
//! Cosine similarity is scale invariant, so any positive weight produces the
//! same score as weight 1.0 and weight 0.0 zeroes the vector, which removes
//! the keyword from the results. In practice the weight therefore acts as an
//! on/off switch per keyword direction rather than a probability.
//!
//! Matches above the threshold are ranked globally across all keyword/page
//! pairs, so a page matching several keywords can appear more than once.

use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    types::{keyword::Keyword, page::PageText},
    utils::{config::AppConfig, embedding::TextSimilarityModel, usage::UsageTracker},
};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::scoring::{cosine_with_norms, l2_norm, score_desc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageScorerConfig {
    /// Pairs must score strictly above this to be kept.
    pub threshold: f32,
    /// Global number of pairs kept after sorting.
    pub top_k: usize,
    /// Similarity calls allowed in flight at once.
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for PageScorerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            top_k: 5,
            concurrency: 1,
            timeout: Duration::from_secs(120),
        }
    }
}

impl PageScorerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            threshold: config.page_similarity_threshold,
            top_k: config.page_top_k,
            concurrency: config.embedding_concurrency,
            timeout: config.request_timeout(),
        }
    }
}

/// A page with its similarity vector, alive only for one scoring pass.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub page_number: u32,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityMatch {
    pub page_number: u32,
    pub score: f32,
}

/// Matches sorted by descending score. The position-ordered view is derived
/// on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageMatches {
    matches: Vec<SimilarityMatch>,
}

impl PageMatches {
    pub fn by_score(&self) -> &[SimilarityMatch] {
        &self.matches
    }

    /// Page numbers ascending. Duplicates are kept.
    pub fn page_numbers_by_position(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.matches.iter().map(|m| m.page_number).collect();
        pages.sort_unstable();
        pages
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

struct Normed<'a> {
    vector: &'a [f32],
    norm: f64,
}

/// Ranks every (keyword, page) pair by cosine similarity.
///
/// Norms are computed once per vector, in `f64` so that a large keyword
/// weight cannot overflow them. Pairs are generated keyword by
/// keyword in page order, and the sort is stable, so equal scores keep that
/// order.
pub fn rank(
    pages: &[PageRecord],
    keyword_vectors: &[Vec<f32>],
    threshold: f32,
    top_k: usize,
) -> Result<PageMatches, AppError> {
    let dimension = keyword_vectors
        .first()
        .map(Vec::len)
        .or_else(|| pages.first().map(|p| p.embedding.len()));
    if let Some(dimension) = dimension {
        let mismatch = keyword_vectors
            .iter()
            .map(Vec::len)
            .chain(pages.iter().map(|p| p.embedding.len()))
            .find(|len| *len != dimension);
        if let Some(len) = mismatch {
            return Err(AppError::Validation(format!(
                "similarity vectors disagree on dimension: {len} vs {dimension}"
            )));
        }
    }

    let page_norms: Vec<Normed<'_>> = pages
        .iter()
        .map(|p| Normed {
            vector: &p.embedding,
            norm: l2_norm(&p.embedding),
        })
        .collect();
    let keyword_norms: Vec<Normed<'_>> = keyword_vectors
        .iter()
        .map(|v| Normed {
            vector: v,
            norm: l2_norm(v),
        })
        .collect();

    let mut matches = Vec::new();
    for keyword in &keyword_norms {
        for (page, normed) in pages.iter().zip(&page_norms) {
            let score = cosine_with_norms(normed.vector, keyword.vector, normed.norm, keyword.norm);
            if score > threshold {
                matches.push(SimilarityMatch {
                    page_number: page.page_number,
                    score,
                });
            }
        }
    }

    matches.sort_by(|a, b| score_desc(a.score, b.score));
    matches.truncate(top_k);
    Ok(PageMatches { matches })
}

pub struct WeightedKeywordPageScorer {
    model: Arc<dyn TextSimilarityModel>,
    keywords: Vec<Keyword>,
    config: PageScorerConfig,
}

impl WeightedKeywordPageScorer {
    pub fn new(
        model: Arc<dyn TextSimilarityModel>,
        keywords: Vec<Keyword>,
        config: PageScorerConfig,
    ) -> Result<Self, AppError> {
        for keyword in &keywords {
            keyword.validate()?;
        }
        if !config.threshold.is_finite() {
            return Err(AppError::Validation(
                "PAGE_SIMILARITY_THRESHOLD must be a finite number".to_string(),
            ));
        }
        if config.concurrency == 0 {
            return Err(AppError::Validation(
                "similarity concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            model,
            keywords,
            config,
        })
    }

    /// Embeds every page's upper-cased text. Output order follows `pages`.
    pub async fn embed_pages(
        &self,
        pages: &[PageText],
        usage: &UsageTracker,
    ) -> Result<Vec<PageRecord>, AppError> {
        let texts: Vec<String> = pages.iter().map(|p| p.text.to_uppercase()).collect();
        let contexts = pages.iter().map(|p| format!("page {}", p.page_number));
        let vectors = self.embed_all(texts.iter().zip(contexts), usage).await?;

        Ok(pages
            .iter()
            .zip(vectors)
            .map(|(page, embedding)| PageRecord {
                page_number: page.page_number,
                text: page.text.clone(),
                embedding,
            })
            .collect())
    }

    /// Embeds every upper-cased keyword and scales it by its weight.
    pub async fn keyword_vectors(&self, usage: &UsageTracker) -> Result<Vec<Vec<f32>>, AppError> {
        let texts: Vec<String> = self.keywords.iter().map(|k| k.text.to_uppercase()).collect();
        let contexts = self.keywords.iter().map(|k| format!("keyword '{}'", k.text));
        let vectors = self.embed_all(texts.iter().zip(contexts), usage).await?;

        vectors
            .into_iter()
            .zip(&self.keywords)
            .map(|(vector, keyword)| {
                let scaled: Vec<f32> = vector.into_iter().map(|x| x * keyword.weight).collect();
                if scaled.iter().any(|x| !x.is_finite()) {
                    return Err(AppError::Validation(format!(
                        "keyword '{}' weight {} overflows its similarity vector",
                        keyword.text, keyword.weight
                    )));
                }
                Ok(scaled)
            })
            .collect()
    }

    /// Scores `pages` against the configured keywords.
    #[instrument(skip_all, fields(pages = pages.len(), keywords = self.keywords.len()))]
    pub async fn score(
        &self,
        pages: &[PageText],
        usage: &UsageTracker,
    ) -> Result<PageMatches, AppError> {
        if pages.is_empty() || self.keywords.is_empty() || self.config.top_k == 0 {
            debug!("Nothing to score");
            return Ok(PageMatches::default());
        }

        let records = self.embed_pages(pages, usage).await?;
        let keyword_vectors = self.keyword_vectors(usage).await?;
        let matches = rank(
            &records,
            &keyword_vectors,
            self.config.threshold,
            self.config.top_k,
        )?;

        info!(
            matches = matches.len(),
            threshold = self.config.threshold,
            top_k = self.config.top_k,
            "Scored pages against keywords"
        );
        Ok(matches)
    }

    async fn embed_all<'t, I>(&self, items: I, usage: &UsageTracker) -> Result<Vec<Vec<f32>>, AppError>
    where
        I: Iterator<Item = (&'t String, String)>,
    {
        stream::iter(items)
            .map(|(text, context)| self.embed_one(text, context, usage))
            .buffered(self.config.concurrency)
            .try_collect()
            .await
    }

    async fn embed_one(
        &self,
        text: &str,
        context: String,
        usage: &UsageTracker,
    ) -> Result<Vec<f32>, AppError> {
        match tokio::time::timeout(self.config.timeout, self.model.embed_text(text, usage)).await {
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(AppError::Upstream { service, message, .. })) => {
                Err(AppError::upstream(service, context, message))
            }
            Ok(Err(other)) => Err(AppError::upstream("similarity", context, other)),
            Err(_) => Err(AppError::upstream(
                "similarity",
                context,
                format!("timed out after {}s", self.config.timeout.as_secs()),
            )),
        }
    }
}
