//! Sliding-window text chunker.
//!
//! Splits extracted document text into overlapping fragments of at most
//! `size` units, where a unit is a tokenizer token or, when no tokenizer is
//! available, a whitespace-delimited word. Consecutive fragments share
//! exactly `overlap` units.
//!
//! ```text
//! units:   0 ........ size
//!                 step ........ step+size
//!                            2*step ........ end
//! step = size - overlap
//! ```
//!
//! The window stops after the first fragment that reaches the end of the
//! unit sequence, so text of `N > size` units yields
//! `ceil((N - overlap) / (size - overlap))` fragments and shorter text
//! yields exactly one. Chunking is a pure function of text and parameters:
//! the same input always produces the same fragments, which is what makes
//! [`fragment_id`]s stable across re-ingestion.

use std::path::Path;

use tracing::warn;

use crate::config::ChunkingConfig;
use crate::error::PipelineError;

/// Splits text into atomic units and serializes unit slices back to text.
pub enum TextTokenizer {
    /// Whitespace-delimited words, re-joined with single spaces.
    Words,
    #[cfg(feature = "hf-tokenizer")]
    HuggingFace(Box<tokenizers::Tokenizer>),
}

impl TextTokenizer {
    /// Pick the best tokenizer available for `hint`.
    ///
    /// `"words"`, `"whitespace"` and the empty string select word units.
    /// Anything else must be a path to a HuggingFace `tokenizer.json`.
    /// Model names such as `"gpt-4"` or `"bert-base-uncased"` are not
    /// resolved. A hint that is not an existing file, a file that cannot be
    /// loaded, or a build without `hf-tokenizer` all fall back to words, and
    /// window sizes then count words.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim() {
            "" | "words" | "whitespace" => TextTokenizer::Words,
            path if !Path::new(path).is_file() => {
                warn!(
                    tokenizer = path,
                    "tokenizer is not a path to a tokenizer.json file (model names are not supported), chunking by words"
                );
                TextTokenizer::Words
            }
            path => Self::load_hf(path),
        }
    }

    #[cfg(feature = "hf-tokenizer")]
    fn load_hf(path: &str) -> Self {
        match tokenizers::Tokenizer::from_file(path) {
            Ok(tokenizer) => TextTokenizer::HuggingFace(Box::new(tokenizer)),
            Err(e) => {
                warn!(tokenizer = path, error = %e, "tokenizer unavailable, chunking by words");
                TextTokenizer::Words
            }
        }
    }

    #[cfg(not(feature = "hf-tokenizer"))]
    fn load_hf(path: &str) -> Self {
        warn!(
            tokenizer = path,
            "built without hf-tokenizer support, chunking by words"
        );
        TextTokenizer::Words
    }

    /// Human-readable unit name for logs.
    pub fn unit_name(&self) -> &'static str {
        match self {
            TextTokenizer::Words => "words",
            #[cfg(feature = "hf-tokenizer")]
            TextTokenizer::HuggingFace(_) => "tokens",
        }
    }
}

/// Fragment id for the `ordinal`-th fragment of a document.
pub fn fragment_id(doc_id: &str, ordinal: usize) -> String {
    format!("{}_{}", doc_id, ordinal)
}

/// Validated chunking policy.
pub struct Chunker {
    size: usize,
    overlap: usize,
    tokenizer: TextTokenizer,
}

impl Chunker {
    /// Fails with a client-data error unless `0 < size` and `overlap < size`.
    pub fn new(size: usize, overlap: usize, tokenizer: TextTokenizer) -> Result<Self, PipelineError> {
        if size == 0 {
            return Err(PipelineError::client_data("chunk size must be > 0"));
        }
        if overlap >= size {
            return Err(PipelineError::client_data(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, size
            )));
        }
        Ok(Self {
            size,
            overlap,
            tokenizer,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self, PipelineError> {
        Self::new(
            config.size,
            config.overlap,
            TextTokenizer::from_hint(&config.tokenizer),
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into fragments. Empty or whitespace-only text yields none.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        match &self.tokenizer {
            TextTokenizer::Words => {
                let words: Vec<&str> = text.split_whitespace().collect();
                self.windows(words.len())
                    .map(|(start, end)| words[start..end].join(" "))
                    .collect()
            }
            #[cfg(feature = "hf-tokenizer")]
            TextTokenizer::HuggingFace(tokenizer) => self.chunk_tokens(tokenizer, text),
        }
    }

    #[cfg(feature = "hf-tokenizer")]
    fn chunk_tokens(&self, tokenizer: &tokenizers::Tokenizer, text: &str) -> Vec<String> {
        let encoding = match tokenizer.encode(text, false) {
            Ok(encoding) => encoding,
            Err(e) => {
                warn!(error = %e, "tokenization failed, chunking by words");
                let words = Chunker {
                    size: self.size,
                    overlap: self.overlap,
                    tokenizer: TextTokenizer::Words,
                };
                return words.chunk(text);
            }
        };
        let ids = encoding.get_ids();
        let offsets = encoding.get_offsets();
        self.windows(ids.len())
            .map(|(start, end)| match tokenizer.decode(&ids[start..end], true) {
                Ok(piece) if !piece.trim().is_empty() => piece,
                Ok(_) => source_span(text, offsets, start, end),
                Err(e) => {
                    warn!(start, end, error = %e, "token window decode failed, using source text");
                    source_span(text, offsets, start, end)
                }
            })
            .collect()
    }

    /// Half-open `[start, end)` unit ranges of each fragment.
    ///
    /// Every window yields a fragment, so the fragment count depends only on
    /// `n`, `size` and `overlap`.
    fn windows(&self, n: usize) -> impl Iterator<Item = (usize, usize)> {
        let size = self.size;
        let step = self.size - self.overlap;
        let mut next = if n == 0 { None } else { Some(0) };
        std::iter::from_fn(move || {
            let start = next?;
            let end = (start + size).min(n);
            next = if end >= n { None } else { Some(start + step) };
            Some((start, end))
        })
    }
}

/// Source text covered by tokens `[start, end)`, from their byte offsets.
#[cfg(feature = "hf-tokenizer")]
fn source_span(text: &str, offsets: &[(usize, usize)], start: usize, end: usize) -> String {
    let from = offsets.get(start).map(|o| o.0).unwrap_or(0);
    let to = offsets
        .get(end.saturating_sub(1))
        .map(|o| o.1)
        .unwrap_or(text.len());
    text.get(from..to.max(from)).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(size, overlap, TextTokenizer::Words).unwrap()
    }

    #[test]
    fn empty_text_yields_no_fragments() {
        assert!(chunker(10, 2).chunk("").is_empty());
        assert!(chunker(10, 2).chunk("  \n\t ").is_empty());
    }

    #[test]
    fn short_text_yields_single_fragment() {
        let c = chunker(10, 2);
        assert_eq!(c.chunk("Hello, world!"), vec!["Hello, world!".to_string()]);
        assert_eq!(c.chunk(&words(10)), vec![words(10)]);
    }

    #[test]
    fn fragment_count_matches_window_formula() {
        let c = chunker(1000, 200);
        for n in [1001usize, 1800, 2999, 3000, 3001, 10_000] {
            let expected = (n - 200).div_ceil(800);
            assert_eq!(c.chunk(&words(n)).len(), expected, "n = {}", n);
        }
    }

    #[test]
    fn consecutive_fragments_overlap_exactly() {
        let c = chunker(5, 2);
        let fragments = c.chunk(&words(12));
        assert_eq!(
            fragments,
            vec![
                "w0 w1 w2 w3 w4",
                "w3 w4 w5 w6 w7",
                "w6 w7 w8 w9 w10",
                "w9 w10 w11",
            ]
        );
        for pair in fragments.windows(2) {
            let prev: Vec<&str> = pair[0].split(' ').collect();
            let next: Vec<&str> = pair[1].split(' ').collect();
            assert_eq!(prev[prev.len() - 2..], next[..2]);
        }
    }

    #[test]
    fn reassembly_recovers_text() {
        let c = chunker(7, 3);
        let text = words(40);
        let fragments = c.chunk(&text);
        let mut units: Vec<String> = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let skip = if i == 0 { 0 } else { 3 };
            units.extend(fragment.split(' ').skip(skip).map(str::to_string));
        }
        assert_eq!(units.join(" "), text);
    }

    #[test]
    fn zero_overlap_tiles_without_repetition() {
        let c = chunker(4, 0);
        assert_eq!(c.chunk(&words(8)).len(), 2);
        assert_eq!(c.chunk(&words(9)).len(), 3);
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(Chunker::new(0, 0, TextTokenizer::Words).is_err());
        let err = Chunker::new(100, 100, TextTokenizer::Words)
            .err()
            .unwrap();
        assert!(err.is_client_fault());
        assert!(Chunker::new(100, 150, TextTokenizer::Words).is_err());
    }

    #[test]
    fn deterministic() {
        let c = chunker(50, 10);
        let text = words(333);
        assert_eq!(c.chunk(&text), c.chunk(&text));
    }

    #[test]
    fn fragment_ids_combine_doc_and_ordinal() {
        assert_eq!(fragment_id("doc-1", 0), "doc-1_0");
        assert_eq!(fragment_id("doc-1", 12), "doc-1_12");
    }

    #[test]
    fn unknown_tokenizer_falls_back_to_words() {
        let tokenizer = TextTokenizer::from_hint("/nonexistent/tokenizer.json");
        assert_eq!(tokenizer.unit_name(), "words");
        assert_eq!(TextTokenizer::from_hint("").unit_name(), "words");
    }

    #[test]
    fn model_name_hints_fall_back_to_words() {
        for hint in ["gpt-4", "bert-base-uncased", "cl100k_base"] {
            assert_eq!(TextTokenizer::from_hint(hint).unit_name(), "words", "{}", hint);
        }
        let c = Chunker::new(5, 1, TextTokenizer::from_hint("gpt-4")).unwrap();
        assert_eq!(c.chunk(&words(9)), vec!["w0 w1 w2 w3 w4", "w4 w5 w6 w7 w8"]);
    }

    #[test]
    fn every_window_is_kept() {
        let c = chunker(10, 3);
        assert_eq!(c.windows(0).count(), 0);
        assert_eq!(c.windows(4).collect::<Vec<_>>(), vec![(0, 4)]);
        for n in 11..200usize {
            let expected = (n - 3).div_ceil(7);
            let ranges: Vec<_> = c.windows(n).collect();
            assert_eq!(ranges.len(), expected, "n = {}", n);
            assert_eq!(ranges.last().map(|r| r.1), Some(n));
        }
    }

    #[cfg(feature = "hf-tokenizer")]
    #[test]
    fn source_span_covers_token_offsets() {
        let text = "héllo big world";
        let offsets = [(0, 6), (7, 10), (11, 16)];
        assert_eq!(source_span(text, &offsets, 0, 2), "héllo big");
        assert_eq!(source_span(text, &offsets, 1, 3), "big world");
        assert_eq!(source_span(text, &[(0, 3), (2, 1)], 1, 2), "");
    }
}
