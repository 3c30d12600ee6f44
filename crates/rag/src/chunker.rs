//! Text chunking
//!
//! Splits documents into overlapping character-bounded chunks on sentence
//! boundaries where possible. Each chunk carries the tail of its predecessor
//! so passages that straddle a boundary stay retrievable.

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use parley_config::constants::rag;

/// Configuration for chunking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Target chunk size in characters
    pub target_chars: usize,
    /// Characters of the previous chunk carried into the next one
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_chars: rag::CHUNK_TARGET_CHARS,
            overlap_chars: rag::CHUNK_OVERLAP_CHARS,
        }
    }
}

/// One chunk of a source document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Index of this chunk within its document
    pub index: usize,
}

/// Sentence-boundary chunker
pub struct TextChunker {
    config: ChunkConfig,
}

impl TextChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Split `text` into overlapping chunks. Whitespace-only input yields
    /// no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut current = String::new();

        for sentence in text.unicode_sentences() {
            // Oversized sentences are hard-split so no chunk grows unbounded.
            for piece in split_oversized(sentence, self.config.target_chars) {
                if !current.is_empty()
                    && current.chars().count() + piece.chars().count() > self.config.target_chars
                {
                    let overlap = tail_chars(&current, self.config.overlap_chars);
                    chunks.push(current);
                    current = overlap;
                }
                current.push_str(&piece);
            }
        }

        if !current.trim().is_empty() {
            chunks.push(current);
        }

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                text: text.trim().to_string(),
                index,
            })
            .filter(|c| !c.text.is_empty())
            .collect()
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(ChunkConfig::default())
    }
}

/// Hard-split a sentence longer than `max_chars` on grapheme boundaries.
fn split_oversized(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }

    let graphemes: Vec<&str> = sentence.graphemes(true).collect();
    graphemes
        .chunks(max_chars.max(1))
        .map(|g| g.concat())
        .collect()
}

/// Last `n` characters of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> TextChunker {
        TextChunker::default()
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(chunker().chunk("").is_empty());
        assert!(chunker().chunk("   \n\t ").is_empty());
    }

    #[test]
    fn test_short_document_is_one_chunk() {
        let chunks = chunker().chunk("The secret code is 42.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "The secret code is 42.");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_long_document_respects_target() {
        let sentence = "This sentence is reasonably sized for a chunking test. ";
        let doc = sentence.repeat(40);
        let chunks = chunker().chunk(&doc);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Target plus one sentence of slack plus the carried overlap.
            assert!(chunk.text.chars().count() <= 500 + sentence.len() + 50);
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let sentence = "Alpha beta gamma delta epsilon zeta eta theta iota kappa. ";
        let doc = sentence.repeat(40);
        let chunks = chunker().chunk(&doc);
        assert!(chunks.len() > 1);

        let first_tail: String = {
            let t = &chunks[0].text;
            let count = t.chars().count();
            t.chars().skip(count.saturating_sub(20)).collect()
        };
        assert!(chunks[1].text.contains(first_tail.trim()));
    }

    #[test]
    fn test_oversized_sentence_is_hard_split() {
        let doc = "x".repeat(2000);
        let chunks = chunker().chunk(&doc);
        assert!(chunks.len() >= 4);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 550);
        }
    }

    #[test]
    fn test_indexes_are_sequential() {
        let doc = "One sentence here. ".repeat(100);
        let chunks = chunker().chunk(&doc);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }
}
