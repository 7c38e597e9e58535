use serde::{Deserialize, Serialize};

/// One retrievable unit of a document.
///
/// `id` is the passage's ordinal position in the corpus it was ingested into.
/// The same number indexes the parallel embedding array and is the label the
/// ANN index reports back, so it must never be reassigned after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassageRecord {
    id: usize,
    title: String,
    text: String,
    metadata: String,
}

impl PassageRecord {
    pub fn new(id: usize, title: String, text: String, metadata: String) -> Self {
        Self {
            id,
            title,
            text,
            metadata,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Opaque `"{page}_{block}"` locator carried through to results.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Assigns positional ids to `(title, text, metadata)` triples in order.
    pub fn from_ordered<I>(items: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        items
            .into_iter()
            .enumerate()
            .map(|(id, (title, text, metadata))| Self::new(id, title, text, metadata))
            .collect()
    }
}
