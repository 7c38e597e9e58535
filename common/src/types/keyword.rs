use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Weight used for keywords that do not specify one.
pub const DEFAULT_KEYWORD_WEIGHT: f32 = 1.0;

/// A structural keyword and its importance multiplier.
///
/// The weight scales the keyword's vector before it is compared against page
/// vectors. It is a multiplier, not a probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

const fn default_weight() -> f32 {
    DEFAULT_KEYWORD_WEIGHT
}

impl Keyword {
    pub fn new(text: impl Into<String>, weight: f32) -> Result<Self, AppError> {
        let keyword = Self {
            text: text.into(),
            weight,
        };
        keyword.validate()?;
        Ok(keyword)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.text.trim().is_empty() {
            return Err(AppError::Validation("keyword text must not be empty".into()));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(AppError::Validation(format!(
                "keyword '{}' has invalid weight {}; weights must be finite and >= 0",
                self.text, self.weight
            )));
        }
        Ok(())
    }
}

/// Keywords used to locate table-of-contents pages when none are configured.
pub fn default_index_keywords() -> Vec<Keyword> {
    [
        ("INDEX", 2.0),
        ("TABLE OF CONTENTS", 1.5),
        ("ARGUMENT", 1.0),
        ("CONTENTS", 1.5),
        ("SUMMARY", 1.5),
        ("LIST", 1.0),
        ("FIGURES", 1.0),
    ]
    .into_iter()
    .map(|(text, weight)| Keyword {
        text: text.to_string(),
        weight,
    })
    .collect()
}
