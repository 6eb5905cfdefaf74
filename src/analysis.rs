//! Text analysis transform applied to `text` payloads before they are stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextAnalysis {
    pub word_count: usize,
    pub character_count: usize,
    pub unique_words: usize,
}

impl TextAnalysis {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "word_count": self.word_count,
            "character_count": self.character_count,
            "unique_words": self.unique_words,
        })
    }
}

/// Count words, characters and distinct words in `text`.
///
/// Words are whitespace-separated; distinct words compare case-insensitively.
/// Characters are Unicode scalar values, whitespace included.
pub fn process_text(text: &str) -> TextAnalysis {
    let mut word_count = 0;
    let mut unique = HashSet::new();

    for word in text.split_whitespace() {
        word_count += 1;
        unique.insert(word.to_lowercase());
    }

    TextAnalysis {
        word_count,
        character_count: text.chars().count(),
        unique_words: unique.len(),
    }
}
