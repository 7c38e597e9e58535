use std::{net::IpAddr, path::Path, time::Instant};

use common::{error::AppError, types::passage::PassageRecord};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Chapter holding the document's own index pages. Never retrievable.
const INDEX_CHAPTER: &str = "index";
/// Entry listing a page's images instead of a text block.
const IMAGES_ENTRY: &str = "images";

/// Loads a document structure from an `http(s)` URL or a local path and
/// flattens it into passages in document order.
pub async fn load_structure(
    source: &str,
    http: &reqwest::Client,
) -> Result<Vec<PassageRecord>, AppError> {
    let now = Instant::now();
    let raw = match url::Url::parse(source) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => fetch(&url, http).await?,
        _ => read_file(Path::new(source)).await?,
    };

    let value: Value = serde_json::from_str(&raw)?;
    let passages = parse_structure(&value)?;
    info!(
        source,
        passages = passages.len(),
        elapsed_ms = now.elapsed().as_millis(),
        "Loaded document structure"
    );
    Ok(passages)
}

async fn fetch(url: &url::Url, http: &reqwest::Client) -> Result<String, AppError> {
    ensure_source_url_allowed(url)?;
    info!(%url, "Fetching document structure");
    let response = http.get(url.as_str()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::NotFound(format!(
            "document structure at {url} returned {status}"
        )));
    }
    Ok(response.text().await?)
}

async fn read_file(path: &Path) -> Result<String, AppError> {
    tokio::fs::read_to_string(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("document structure {}", path.display()))
        } else {
            AppError::Io(err)
        }
    })
}

/// Flattens `{document: {chapter: {page: {block: {title, text}}}}}`.
///
/// The `index` chapter and `images` entries are skipped, as are blocks with
/// empty text. A missing or null title falls back to the chapter name.
/// Metadata is `"{page}_{block}"` built from the part of the page key after
/// its first `_` and the part of the block key after its first space.
pub fn parse_structure(value: &Value) -> Result<Vec<PassageRecord>, AppError> {
    let documents = as_object(value, "document structure root")?;
    let mut items = Vec::new();

    for (document_key, chapters) in documents {
        let chapters = as_object(chapters, document_key)?;
        for (chapter, pages) in chapters {
            if chapter == INDEX_CHAPTER {
                debug!(%document_key, "Skipping index chapter");
                continue;
            }
            let pages = as_object(pages, chapter)?;
            for (page_key, blocks) in pages {
                let blocks = as_object(blocks, page_key)?;
                for (block_key, block) in blocks {
                    if block_key == IMAGES_ENTRY {
                        continue;
                    }
                    let Some(block) = block.as_object() else {
                        warn!(%chapter, %page_key, %block_key, "Skipping non-object block");
                        continue;
                    };

                    let text = block
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if text.trim().is_empty() {
                        continue;
                    }
                    let title = block
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or(chapter.as_str());

                    items.push((
                        title.to_string(),
                        text.to_string(),
                        format!(
                            "{}_{}",
                            suffix_after(page_key, '_'),
                            suffix_after(block_key, ' ')
                        ),
                    ));
                }
            }
        }
    }

    Ok(PassageRecord::from_ordered(items))
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, AppError> {
    value.as_object().ok_or_else(|| {
        AppError::Validation(format!("expected a JSON object for '{what}'"))
    })
}

/// Everything after the first `separator`, or the whole key when absent.
fn suffix_after(key: &str, separator: char) -> &str {
    key.split_once(separator).map_or(key, |(_, rest)| rest)
}

fn ensure_source_url_allowed(url: &url::Url) -> Result<(), AppError> {
    let Some(host) = url.host_str() else {
        warn!(%url, "Rejected source URL missing host");
        return Err(AppError::Validation(
            "URL is missing a host component".to_string(),
        ));
    };

    if host.eq_ignore_ascii_case("localhost") {
        warn!(%url, host, "Rejected source URL to localhost");
        return Err(AppError::Validation("Source URL host is not allowed".to_string()));
    }

    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        let is_disallowed = match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
        };

        if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || is_disallowed {
            warn!(%url, host, %ip, "Rejected source URL pointing to restricted network range");
            return Err(AppError::Validation("Source URL host is not allowed".to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample() -> Value {
        json!({
            "manual": {
                "index": {
                    "page_1": {"block 1": {"title": "Index", "text": "a, b, c"}}
                },
                "Safety": {
                    "page_3": {
                        "block 1": {"title": "Warnings", "text": "Do not open."},
                        "images": ["fig1.png"],
                        "block 2": {"title": null, "text": "Keep dry."}
                    },
                    "page_4": {
                        "block 1": {"title": "Empty", "text": "   "}
                    }
                },
                "Setup": {
                    "page_5": {"block 7": {"title": "Install", "text": "Plug it in."}}
                }
            }
        })
    }

    #[test]
    fn flattens_in_document_order_with_positional_ids() {
        let passages = parse_structure(&sample()).unwrap();

        let texts: Vec<&str> = passages.iter().map(|p| p.text()).collect();
        assert_eq!(texts, vec!["Do not open.", "Keep dry.", "Plug it in."]);
        let ids: Vec<usize> = passages.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn builds_metadata_from_page_and_block_suffixes() {
        let passages = parse_structure(&sample()).unwrap();
        assert_eq!(passages[0].metadata(), "3_1");
        assert_eq!(passages[1].metadata(), "3_2");
        assert_eq!(passages[2].metadata(), "5_7");
    }

    #[test]
    fn null_title_falls_back_to_chapter() {
        let passages = parse_structure(&sample()).unwrap();
        assert_eq!(passages[0].title(), "Warnings");
        assert_eq!(passages[1].title(), "Safety");
    }

    #[test]
    fn keys_without_separator_are_kept_whole() {
        assert_eq!(suffix_after("cover", '_'), "cover");
        assert_eq!(suffix_after("page_1_b", '_'), "1_b");
    }

    #[test]
    fn non_object_root_is_rejected() {
        assert!(parse_structure(&json!([1, 2, 3])).is_err());
    }

    #[tokio::test]
    async fn loads_from_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", sample()).unwrap();

        let passages = load_structure(
            file.path().to_str().unwrap(),
            &reqwest::Client::new(),
        )
        .await
        .unwrap();

        assert_eq!(passages.len(), 3);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = load_structure("/definitely/not/here.json", &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn rejects_restricted_hosts() {
        for raw in [
            "http://localhost/doc.json",
            "http://127.0.0.1/doc.json",
            "http://192.168.1.10/doc.json",
        ] {
            let url = url::Url::parse(raw).unwrap();
            assert!(ensure_source_url_allowed(&url).is_err(), "{raw}");
        }
        let url = url::Url::parse("https://docs.example.com/structure.json").unwrap();
        assert!(ensure_source_url_allowed(&url).is_ok());
    }
}
