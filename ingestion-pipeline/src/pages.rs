use std::path::Path;

use common::{error::AppError, types::page::PageText};
use serde::Deserialize;
use tracing::info;

#[derive(Deserialize)]
#[serde(untagged)]
enum PageEntry {
    Text(String),
    Numbered { page_number: u32, text: String },
}

/// Reads extracted page text from a JSON array.
///
/// Entries are either plain strings, numbered 1..=N in order, or
/// `{page_number, text}` objects. Both forms may not be mixed.
pub async fn load_pages(path: &Path) -> Result<Vec<PageText>, AppError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let pages = parse_pages(&raw)?;
    info!(path = %path.display(), pages = pages.len(), "Loaded page texts");
    Ok(pages)
}

pub fn parse_pages(raw: &str) -> Result<Vec<PageText>, AppError> {
    let entries: Vec<PageEntry> = serde_json::from_str(raw)?;

    let numbered = entries
        .iter()
        .filter(|e| matches!(e, PageEntry::Numbered { .. }))
        .count();
    if numbered != 0 && numbered != entries.len() {
        return Err(AppError::Validation(
            "page list mixes plain strings and numbered pages".to_string(),
        ));
    }

    let mut pages = Vec::with_capacity(entries.len());
    for (position, entry) in entries.into_iter().enumerate() {
        let page = match entry {
            PageEntry::Text(text) => {
                let number = u32::try_from(position + 1).map_err(|_| {
                    AppError::Validation("too many pages to number".to_string())
                })?;
                PageText::new(number, text)
            }
            PageEntry::Numbered { page_number, text } => {
                if page_number == 0 {
                    return Err(AppError::Validation(
                        "page numbers start at 1".to_string(),
                    ));
                }
                PageText::new(page_number, text)
            }
        };
        pages.push(page);
    }
    Ok(pages)
}
