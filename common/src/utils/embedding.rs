use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::AppError,
    utils::{config::AppConfig, usage::UsageTracker},
};

const DEFAULT_COHERE_EMBED_MODEL: &str = "embed-english-v3.0";
const DEFAULT_OPENAI_EMBED_MODEL: &str = "text-embedding-3-small";

/// Why a text is being embedded. Some services encode documents and queries
/// differently for the same model, so the two must never be swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingIntent {
    Document,
    Query,
}

impl EmbeddingIntent {
    pub const fn cohere_input_type(self) -> &'static str {
        match self {
            Self::Document => "search_document",
            Self::Query => "search_query",
        }
    }

    /// Instruction prefix expected by asymmetric local model families.
    fn fastembed_prefix(self, model_code: &str) -> Option<&'static str> {
        let code = model_code.to_ascii_lowercase();
        if code.contains("e5") {
            Some(match self {
                Self::Document => "passage: ",
                Self::Query => "query: ",
            })
        } else if code.contains("nomic") {
            Some(match self {
                Self::Document => "search_document: ",
                Self::Query => "search_query: ",
            })
        } else {
            None
        }
    }
}

impl fmt::Display for EmbeddingIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Document => "document",
            Self::Query => "query",
        })
    }
}

/// Maps batches of strings to fixed-dimension vectors, one per input, in order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
        usage: &UsageTracker,
    ) -> Result<Vec<Vec<f32>>, AppError>;

    fn dimension(&self) -> usize;
}

/// Produces a fixed-dimension vector for arbitrary text. Used for page and
/// keyword comparison, independently of the passage embedding client.
#[async_trait]
pub trait TextSimilarityModel: Send + Sync {
    async fn embed_text(&self, text: &str, usage: &UsageTracker) -> Result<Vec<f32>, AppError>;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    OpenAI,
    Cohere,
    FastEmbed,
    Hashed,
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::FastEmbed
    }
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "cohere" => Ok(Self::Cohere),
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai', 'cohere', 'hashed', or 'fastembed'."
            )),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Cohere {
        http: reqwest::Client,
        base_url: String,
        api_key: String,
        model: String,
        dimension: usize,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

#[derive(Serialize)]
struct CohereEmbedRequest<'a> {
    texts: &'a [String],
    model: &'a str,
    input_type: &'static str,
}

#[derive(Deserialize)]
struct CohereEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    meta: Option<CohereMeta>,
}

#[derive(Deserialize)]
struct CohereMeta {
    #[serde(default)]
    billed_units: Option<CohereBilledUnits>,
}

#[derive(Deserialize)]
struct CohereBilledUnits {
    #[serde(default)]
    input_tokens: Option<u64>,
}

impl EmbeddingProvider {
    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
            EmbeddingInner::Cohere { .. } => "cohere",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension }
            | EmbeddingInner::FastEmbed { dimension, .. }
            | EmbeddingInner::Cohere { dimension, .. } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } | EmbeddingInner::Cohere { model, .. } => {
                Some(model.clone())
            }
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    /// Embeds `texts` in one service call. Returns the vectors and the token
    /// count when the service reports one.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
    ) -> Result<(Vec<Vec<f32>>, Option<u64>)> {
        if texts.is_empty() {
            return Ok((Vec::new(), None));
        }

        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok((
                texts
                    .iter()
                    .map(|text| hashed_embedding(text, *dimension))
                    .collect(),
                None,
            )),
            EmbeddingInner::FastEmbed {
                model, model_name, ..
            } => {
                let inputs: Vec<String> =
                    match intent.fastembed_prefix(&model_name.to_string()) {
                        Some(prefix) => texts.iter().map(|t| format!("{prefix}{t}")).collect(),
                        None => texts.to_vec(),
                    };
                let mut guard = model.lock().await;
                let vectors = guard
                    .embed(inputs, None)
                    .context("generating fastembed batch embeddings")?;
                Ok((vectors, None))
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                debug!(%intent, "OpenAI embeddings do not distinguish intents");
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts.to_vec())
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;
                let tokens = u64::from(response.usage.prompt_tokens);

                let mut data = response.data;
                data.sort_by_key(|item| item.index);
                let embeddings: Vec<Vec<f32>> =
                    data.into_iter().map(|item| item.embedding).collect();

                Ok((embeddings, Some(tokens)))
            }
            EmbeddingInner::Cohere {
                http,
                base_url,
                api_key,
                model,
                ..
            } => {
                let response = http
                    .post(format!("{}/v1/embed", base_url.trim_end_matches('/')))
                    .bearer_auth(api_key)
                    .json(&CohereEmbedRequest {
                        texts,
                        model,
                        input_type: intent.cohere_input_type(),
                    })
                    .send()
                    .await
                    .context("sending Cohere embed request")?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    bail!("Cohere embed API error: {status} - {body}");
                }

                let parsed: CohereEmbedResponse = response
                    .json()
                    .await
                    .context("decoding Cohere embed response")?;
                let tokens = parsed
                    .meta
                    .and_then(|meta| meta.billed_units)
                    .and_then(|units| units.input_tokens);

                Ok((parsed.embeddings, tokens))
            }
        }
    }

    pub async fn new_openai(
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Result<Self> {
        Ok(EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        })
    }

    pub fn new_cohere(
        http: reqwest::Client,
        base_url: String,
        api_key: String,
        model: String,
        dimension: usize,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            bail!("Cohere embedding backend requires COHERE_API_KEY");
        }
        Ok(EmbeddingProvider {
            inner: EmbeddingInner::Cohere {
                http,
                base_url,
                api_key,
                model,
                dimension: dimension.max(1),
            },
        })
    }

    pub async fn new_fastembed(
        model_override: Option<String>,
        settings: FastEmbedSettings,
    ) -> Result<Self> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let options = settings.init_options(model_name.clone());
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")??;

        Ok(EmbeddingProvider {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
        })
    }

    pub fn new_hashed(dimension: usize) -> Result<Self> {
        Ok(EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        })
    }

    /// Builds the provider named by `backend`, using connection settings from
    /// `config`. The same constructor serves passage embedding and the page
    /// similarity model, which are configured independently.
    pub async fn from_config(
        config: &AppConfig,
        backend: &str,
        model_override: Option<String>,
    ) -> Result<Self> {
        let backend = EmbeddingBackend::from_str(backend)?;
        let dimension = config.embedding_dimensions;
        info!(?backend, model = ?model_override, "Initialising embedding provider");

        match backend {
            EmbeddingBackend::Hashed => Self::new_hashed(dimension as usize),
            EmbeddingBackend::FastEmbed => {
                Self::new_fastembed(model_override, FastEmbedSettings::from_config(config)).await
            }
            EmbeddingBackend::OpenAI => {
                let api_key = config
                    .openai_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("OpenAI embedding backend requires OPENAI_API_KEY"))?;
                let http = reqwest::Client::builder()
                    .timeout(config.request_timeout())
                    .build()?;
                let client = Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&config.openai_base_url),
                )
                .with_http_client(http);
                Self::new_openai(
                    Arc::new(client),
                    model_override.unwrap_or_else(|| DEFAULT_OPENAI_EMBED_MODEL.to_string()),
                    dimension,
                )
                .await
            }
            EmbeddingBackend::Cohere => {
                let api_key = config
                    .cohere_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("Cohere embedding backend requires COHERE_API_KEY"))?;
                let http = reqwest::Client::builder()
                    .timeout(config.request_timeout())
                    .build()?;
                Self::new_cohere(
                    http,
                    config.cohere_base_url.clone(),
                    api_key,
                    model_override.unwrap_or_else(|| DEFAULT_COHERE_EMBED_MODEL.to_string()),
                    dimension as usize,
                )
            }
        }
    }
}

/// Model cache and download settings for the local FastEmbed backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastEmbedSettings {
    pub cache_dir: PathBuf,
    pub show_download_progress: bool,
    pub max_length: Option<usize>,
}

impl FastEmbedSettings {
    /// Falls back to `{data_dir}/fastembed/embedding` when no cache dir is set.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cache_dir: config.fastembed_cache_dir.as_ref().map_or_else(
                || Path::new(&config.data_dir).join("fastembed").join("embedding"),
                PathBuf::from,
            ),
            show_download_progress: config.fastembed_show_download_progress.unwrap_or(true),
            max_length: config.fastembed_max_length,
        }
    }

    fn init_options(&self, model: EmbeddingModel) -> TextInitOptions {
        let options = TextInitOptions::new(model)
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(self.show_download_progress);
        match self.max_length {
            Some(max_length) => options.with_max_length(max_length),
            None => options,
        }
    }
}

/// Checks a service response before it is allowed into a corpus: one vector
/// per input, uniform length, finite components.
pub fn validate_embeddings(vectors: &[Vec<f32>], expected_count: usize) -> Result<(), String> {
    if vectors.len() != expected_count {
        return Err(format!(
            "expected {expected_count} embeddings, received {}",
            vectors.len()
        ));
    }
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let dimension = first.len();
    if dimension == 0 {
        return Err("received an empty embedding vector".to_string());
    }
    for (position, vector) in vectors.iter().enumerate() {
        if vector.len() != dimension {
            return Err(format!(
                "embedding {position} has dimension {}, expected {dimension}",
                vector.len()
            ));
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(format!("embedding {position} contains non-finite values"));
        }
    }
    Ok(())
}

#[async_trait]
impl EmbeddingClient for EmbeddingProvider {
    async fn embed(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
        usage: &UsageTracker,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let context = format!("{} {intent} texts via {}", texts.len(), self.backend_label());
        let (vectors, tokens) = self
            .embed_batch(texts, intent)
            .await
            .map_err(|err| AppError::upstream("embedding", context.clone(), format!("{err:#}")))?;
        validate_embeddings(&vectors, texts.len())
            .map_err(|message| AppError::upstream("embedding", context, message))?;
        usage.record_embedding(texts.len(), tokens);
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        EmbeddingProvider::dimension(self)
    }
}

#[async_trait]
impl TextSimilarityModel for EmbeddingProvider {
    async fn embed_text(&self, text: &str, usage: &UsageTracker) -> Result<Vec<f32>, AppError> {
        let context = format!("{} chars via {}", text.chars().count(), self.backend_label());
        let (vectors, _) = self
            .embed_batch(&[text.to_owned()], EmbeddingIntent::Document)
            .await
            .map_err(|err| AppError::upstream("similarity", context.clone(), format!("{err:#}")))?;
        validate_embeddings(&vectors, 1)
            .map_err(|message| AppError::upstream("similarity", context.clone(), message))?;
        usage.record_similarity();
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::upstream("similarity", context, "no vector returned"))
    }

    fn dimension(&self) -> usize {
        EmbeddingProvider::dimension(self)
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    if token_count == 0.0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}
