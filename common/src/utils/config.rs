use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::types::keyword::{default_index_keywords, Keyword};

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default)]
    pub cohere_api_key: Option<String>,
    #[serde(default = "default_cohere_base_url")]
    pub cohere_base_url: String,
    #[serde(default = "default_rerank_backend")]
    pub rerank_backend: String,
    #[serde(default)]
    pub rerank_model: Option<String>,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default = "default_similarity_backend")]
    pub similarity_backend: String,
    #[serde(default)]
    pub similarity_model: Option<String>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_retrieve_top_k")]
    pub retrieve_top_k: usize,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_hnsw_connectivity")]
    pub hnsw_connectivity: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
    #[serde(default = "default_page_similarity_threshold")]
    pub page_similarity_threshold: f32,
    #[serde(default = "default_page_top_k")]
    pub page_top_k: usize,
    #[serde(default = "default_index_keywords")]
    pub index_keywords: Vec<Keyword>,
}

fn default_embedding_backend() -> String {
    "fastembed".to_string()
}

const fn default_embedding_dimensions() -> u32 {
    1024
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_cohere_base_url() -> String {
    "https://api.cohere.com".to_string()
}

fn default_rerank_backend() -> String {
    "fastembed".to_string()
}

fn default_similarity_backend() -> String {
    "fastembed".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    120
}

// Keeps each request under the embedding service's payload limit.
const fn default_embedding_batch_size() -> usize {
    90
}

const fn default_embedding_concurrency() -> usize {
    1
}

const fn default_retrieve_top_k() -> usize {
    10
}

const fn default_rerank_top_k() -> usize {
    3
}

const fn default_hnsw_connectivity() -> usize {
    64
}

const fn default_hnsw_ef_construction() -> usize {
    512
}

const fn default_hnsw_ef_search() -> usize {
    64
}

const fn default_page_similarity_threshold() -> f32 {
    0.2
}

const fn default_page_top_k() -> usize {
    5
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            embedding_backend: default_embedding_backend(),
            embedding_model: None,
            embedding_dimensions: default_embedding_dimensions(),
            openai_api_key: None,
            openai_base_url: default_base_url(),
            cohere_api_key: None,
            cohere_base_url: default_cohere_base_url(),
            rerank_backend: default_rerank_backend(),
            rerank_model: None,
            reranking_pool_size: None,
            similarity_backend: default_similarity_backend(),
            similarity_model: None,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
            data_dir: default_data_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_concurrency: default_embedding_concurrency(),
            retrieve_top_k: default_retrieve_top_k(),
            rerank_top_k: default_rerank_top_k(),
            hnsw_connectivity: default_hnsw_connectivity(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            hnsw_ef_search: default_hnsw_ef_search(),
            page_similarity_threshold: default_page_similarity_threshold(),
            page_top_k: default_page_top_k(),
            index_keywords: default_index_keywords(),
        }
    }
}

impl AppConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn empty_sources_fall_back_to_reference_values() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str("{}", FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.embedding_batch_size, 90);
        assert_eq!(config.retrieve_top_k, 10);
        assert_eq!(config.rerank_top_k, 3);
        assert_eq!(config.hnsw_connectivity, 64);
        assert_eq!(config.hnsw_ef_construction, 512);
        assert_eq!(config.page_top_k, 5);
        assert!((config.page_similarity_threshold - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.index_keywords.len(), 7);
    }

    #[test]
    fn file_values_override_defaults() {
        let raw = r#"
            embedding_backend = "hashed"
            embedding_batch_size = 16
            rerank_top_k = 1

            [[index_keywords]]
            text = "INDEX"
            weight = 2.0

            [[index_keywords]]
            text = "LIST"
        "#;
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.embedding_backend, "hashed");
        assert_eq!(config.embedding_batch_size, 16);
        assert_eq!(config.rerank_top_k, 1);
        assert_eq!(config.index_keywords.len(), 2);
        assert_eq!(config.index_keywords[1].weight, 1.0);
    }
}
