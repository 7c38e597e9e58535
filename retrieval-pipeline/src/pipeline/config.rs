use std::time::Duration;

use common::{error::AppError, utils::config::AppConfig};
use serde::{Deserialize, Serialize};

/// Tunable parameters that govern each retrieval stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalTuning {
    /// Candidates pulled from the ANN index for reranking.
    pub retrieve_top_k: usize,
    /// Passages kept after reranking.
    pub rerank_top_k: usize,
    /// Upper bound for each query embedding and rerank call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            retrieve_top_k: 10,
            rerank_top_k: 3,
            request_timeout: default_request_timeout(),
        }
    }
}

impl RetrievalTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retrieve_top_k: config.retrieve_top_k,
            rerank_top_k: config.rerank_top_k,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.retrieve_top_k == 0 {
            return Err(AppError::Validation(
                "RETRIEVE_TOP_K must be greater than zero".to_string(),
            ));
        }
        if self.rerank_top_k == 0 {
            return Err(AppError::Validation(
                "RERANK_TOP_K must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let tuning = RetrievalTuning::default();
        assert_eq!(tuning.retrieve_top_k, 10);
        assert_eq!(tuning.rerank_top_k, 3);
        assert!(tuning.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let tuning = RetrievalTuning {
            rerank_top_k: 0,
            ..RetrievalTuning::default()
        };
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn reads_limits_from_app_config() {
        let config = AppConfig {
            retrieve_top_k: 4,
            rerank_top_k: 2,
            request_timeout_secs: 9,
            ..AppConfig::default()
        };
        let tuning = RetrievalTuning::from_config(&config);
        assert_eq!(tuning.retrieve_top_k, 4);
        assert_eq!(tuning.rerank_top_k, 2);
        assert_eq!(tuning.request_timeout, Duration::from_secs(9));
    }
}
