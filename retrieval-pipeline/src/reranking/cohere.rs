use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{config::AppConfig, usage::UsageTracker},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RerankClient, RerankHit};

const DEFAULT_COHERE_RERANK_MODEL: &str = "rerank-english-v3.0";

/// Reranker backed by a Cohere-compatible `/v1/rerank` endpoint.
#[derive(Clone)]
pub struct CohereReranker {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResponseItem>,
    #[serde(default)]
    meta: Option<RerankMeta>,
}

#[derive(Deserialize)]
struct RerankResponseItem {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct RerankMeta {
    #[serde(default)]
    billed_units: Option<BilledUnits>,
}

#[derive(Deserialize)]
struct BilledUnits {
    #[serde(default)]
    search_units: Option<u64>,
}

impl CohereReranker {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, AppError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AppError::Validation(
                "Cohere rerank backend requires COHERE_API_KEY".to_string(),
            ));
        }
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let api_key = config.cohere_api_key.clone().ok_or_else(|| {
            AppError::Validation("Cohere rerank backend requires COHERE_API_KEY".to_string())
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Self::new(
            http,
            config.cohere_base_url.clone(),
            api_key,
            config
                .rerank_model
                .clone()
                .unwrap_or_else(|| DEFAULT_COHERE_RERANK_MODEL.to_string()),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/rerank", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RerankClient for CohereReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
        top_n: usize,
        usage: &UsageTracker,
    ) -> Result<Vec<RerankHit>, AppError> {
        let context = format!("{} candidates via {}", candidates.len(), self.model);
        debug!(candidates = candidates.len(), top_n, "Sending Cohere rerank request");

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&RerankRequest {
                model: &self.model,
                query,
                documents: candidates,
                top_n,
            })
            .send()
            .await
            .map_err(|err| AppError::upstream("rerank", context.clone(), err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(
                "rerank",
                context,
                format!("Cohere rerank API error: {status} - {body}"),
            ));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|err| AppError::upstream("rerank", context.clone(), err))?;

        let units = parsed
            .meta
            .and_then(|meta| meta.billed_units)
            .and_then(|units| units.search_units);
        usage.record_rerank(candidates.len(), units);

        let hits = parsed
            .results
            .into_iter()
            .map(|item| RerankHit {
                index: item.index,
                score: item.relevance_score,
            })
            .collect();
        RerankHit::validate(hits, candidates.len(), top_n)
            .map_err(|message| AppError::upstream("rerank", context, message))
    }
}
