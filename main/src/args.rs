use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use common::utils::config::AppConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build a corpus from a document structure and answer queries against it
    Retrieve(RetrieveArgs),
    /// Rank pages by similarity to the configured structural keywords
    IndexPages(IndexPagesArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RetrieveArgs {
    /// Document structure JSON, as a local path or http(s) URL
    #[arg(long)]
    pub source: String,

    /// Query to answer; repeat for several queries over the same corpus
    #[arg(long = "query", required = true)]
    pub queries: Vec<String>,

    /// ANN candidates passed to the reranker
    #[arg(long)]
    pub retrieve_top_k: Option<usize>,

    /// Passages kept after reranking
    #[arg(long)]
    pub rerank_top_k: Option<usize>,

    /// Texts per embedding request
    #[arg(long)]
    pub batch_size: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct IndexPagesArgs {
    /// JSON array of page texts or {page_number, text} objects
    #[arg(long)]
    pub pages: PathBuf,

    /// Minimum similarity (exclusive) for a keyword/page pair
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Pairs kept across all keywords
    #[arg(long)]
    pub top_k: Option<usize>,
}

impl RetrieveArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(value) = self.retrieve_top_k {
            config.retrieve_top_k = value;
        }
        if let Some(value) = self.rerank_top_k {
            config.rerank_top_k = value;
        }
        if let Some(value) = self.batch_size {
            config.embedding_batch_size = value;
        }
    }
}

impl IndexPagesArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(value) = self.threshold {
            config.page_similarity_threshold = value;
        }
        if let Some(value) = self.top_k {
            config.page_top_k = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_queries() {
        let cli = Cli::try_parse_from([
            "main",
            "retrieve",
            "--source",
            "structure.json",
            "--query",
            "fruit",
            "--query",
            "wheels",
            "--rerank-top-k",
            "1",
        ])
        .unwrap();

        let Command::Retrieve(args) = cli.command else {
            panic!("expected retrieve");
        };
        assert_eq!(args.queries, vec!["fruit", "wheels"]);

        let mut config = AppConfig::default();
        args.apply(&mut config);
        assert_eq!(config.rerank_top_k, 1);
        assert_eq!(config.retrieve_top_k, 10);
    }

    #[test]
    fn retrieve_requires_a_query() {
        assert!(Cli::try_parse_from(["main", "retrieve", "--source", "s.json"]).is_err());
    }

    #[test]
    fn index_pages_overrides_scoring_limits() {
        let cli = Cli::try_parse_from([
            "main",
            "index-pages",
            "--pages",
            "pages.json",
            "--top-k",
            "3",
        ])
        .unwrap();

        let Command::IndexPages(args) = cli.command else {
            panic!("expected index-pages");
        };
        let mut config = AppConfig::default();
        args.apply(&mut config);
        assert_eq!(config.page_top_k, 3);
        assert!((config.page_similarity_threshold - 0.2).abs() < f32::EPSILON);
    }
}
