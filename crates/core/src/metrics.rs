use serde::{Deserialize, Serialize};

use crate::ids::ContentChecksum;

/// Derived figures recomputed on every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetrics {
    pub character_count: u64,
    pub word_count: u64,
    pub checksum: ContentChecksum,
}

impl ContentMetrics {
    /// Characters are Unicode scalar values; a word is a maximal run of
    /// non-whitespace characters.
    pub fn compute(content: &str) -> Self {
        Self {
            character_count: content.chars().count() as u64,
            word_count: content.split_whitespace().count() as u64,
            checksum: checksum(content),
        }
    }

    pub fn matches(&self, content: &str) -> bool {
        checksum(content) == self.checksum
    }
}

pub fn checksum(content: &str) -> ContentChecksum {
    ContentChecksum::from_bytes(*blake3::hash(content.as_bytes()).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_words_as_whitespace_runs() {
        let m = ContentMetrics::compute("  Hello,\tworld!\n\nfoo  ");
        assert_eq!(m.word_count, 3);
        assert_eq!(m.character_count, 22);
    }

    #[test]
    fn empty_content() {
        let m = ContentMetrics::compute("");
        assert_eq!(m.word_count, 0);
        assert_eq!(m.character_count, 0);
        assert_eq!(m.checksum, checksum(""));
    }

    #[test]
    fn characters_are_scalar_values_not_bytes() {
        let m = ContentMetrics::compute("Größe 日本");
        assert_eq!(m.character_count, 8);
        assert_eq!(m.word_count, 2);
    }

    #[test]
    fn checksum_is_deterministic_and_content_sensitive() {
        let a = ContentMetrics::compute("Hello world");
        let b = ContentMetrics::compute("Hello world");
        let c = ContentMetrics::compute("Hello world!");
        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
        assert!(a.matches("Hello world"));
        assert!(!a.matches("hello world"));
    }
}
