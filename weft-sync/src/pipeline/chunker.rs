// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Two-stage chunking.
//!
//! Stage 1 cuts at meaningful boundaries: paragraphs then sentences for
//! prose, declaration boundaries for code (language auto-detected). Stage 2
//! is the safety net: any piece still over the hard token limit is split at
//! character positions found by token counting. A chunk that comes out empty
//! or oversized after the safety net is a bug, and fails loud.

use once_cell::sync::Lazy;
use regex::Regex;

use weft_entities::Chunk;
use weft_inference::Tokenizer;

use crate::pipeline::PipelineError;

/// Hard per-chunk token cap (embedding provider limit).
pub const MAX_TOKENS_PER_CHUNK: usize = 8192;

/// Target chunk size; large single boundaries may exceed it, the safety net
/// may not.
pub const TARGET_CHUNK_TOKENS: usize = 2048;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CodeLanguage {
    Rust,
    Python,
    JavaScript,
    Unknown,
}

static RUST_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(pub\s+)?(fn|struct|enum|trait|impl|mod|macro_rules!)\s").expect("static regex")
});
static PYTHON_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(async\s+def|def|class|@)\s?").expect("static regex"));
static JAVASCRIPT_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(export\s+)?(async\s+)?(function|class|const|let|var)\s").expect("static regex")
});

pub struct TextChunker {
    tokenizer: Tokenizer,
    target_tokens: usize,
    max_tokens: usize,
}

impl TextChunker {
    pub fn new() -> Result<Self, PipelineError> {
        Ok(Self {
            tokenizer: Tokenizer::cl100k()
                .map_err(|error| PipelineError::ChunkerInit(error.to_string()))?,
            target_tokens: TARGET_CHUNK_TOKENS,
            max_tokens: MAX_TOKENS_PER_CHUNK,
        })
    }

    #[cfg(test)]
    fn with_limits(target_tokens: usize, max_tokens: usize) -> Self {
        Self {
            tokenizer: Tokenizer::cl100k().expect("cl100k tokenizer"),
            target_tokens,
            max_tokens,
        }
    }

    /// Splits prose at paragraph boundaries, falling back to sentences for
    /// paragraphs over the target.
    pub fn chunk_prose(&self, text: &str) -> Result<Vec<Chunk>, PipelineError> {
        if text.trim().is_empty() {
            return Err(PipelineError::EmptyChunk);
        }
        let mut spans: Vec<String> = Vec::new();
        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }
            if self.tokenizer.count(paragraph) > self.target_tokens {
                spans.extend(split_sentences(paragraph));
            } else {
                spans.push(paragraph.to_string());
            }
        }
        self.pack_spans(spans, "\n\n")
    }

    /// Splits code at declaration boundaries for the detected language, with
    /// a line-based fallback for unknown languages.
    pub fn chunk_code(&self, code: &str) -> Result<Vec<Chunk>, PipelineError> {
        if code.trim().is_empty() {
            return Err(PipelineError::EmptyChunk);
        }
        let boundary = match detect_language(code) {
            CodeLanguage::Rust => Some(&*RUST_BOUNDARY),
            CodeLanguage::Python => Some(&*PYTHON_BOUNDARY),
            CodeLanguage::JavaScript => Some(&*JAVASCRIPT_BOUNDARY),
            CodeLanguage::Unknown => None,
        };
        let spans = match boundary {
            Some(boundary) => split_at_boundaries(code, boundary),
            None => code.lines().map(|line| line.to_string()).collect(),
        };
        self.pack_spans(spans, "\n")
    }

    /// Greedily packs spans up to the target size, then applies the token
    /// safety net and validates every chunk.
    fn pack_spans(&self, spans: Vec<String>, joiner: &str) -> Result<Vec<Chunk>, PipelineError> {
        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;
        for span in spans {
            let span_tokens = self.tokenizer.count(&span);
            if current_tokens > 0 && current_tokens + span_tokens > self.target_tokens {
                pieces.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            if !current.is_empty() {
                current.push_str(joiner);
            }
            current.push_str(&span);
            current_tokens += span_tokens;
        }
        if !current.trim().is_empty() {
            pieces.push(current);
        }

        let mut chunks = Vec::new();
        for piece in pieces {
            for part in self.enforce_token_limit(piece) {
                let token_count = self.tokenizer.count(&part);
                if part.trim().is_empty() {
                    return Err(PipelineError::EmptyChunk);
                }
                if token_count > self.max_tokens {
                    return Err(PipelineError::OversizedChunk {
                        token_count,
                        max_tokens: self.max_tokens,
                    });
                }
                chunks.push(Chunk {
                    index: chunks.len() as u32,
                    text: part,
                    token_count,
                });
            }
        }
        if chunks.is_empty() {
            return Err(PipelineError::EmptyChunk);
        }
        Ok(chunks)
    }

    /// Splits a piece at character positions until every part fits the hard
    /// token limit. Char-boundary bisection avoids re-decoding tokens.
    fn enforce_token_limit(&self, piece: String) -> Vec<String> {
        if self.tokenizer.count(&piece) <= self.max_tokens {
            return vec![piece];
        }
        let midpoint = piece.len() / 2;
        let split_at = (midpoint..piece.len())
            .find(|i| piece.is_char_boundary(*i))
            .unwrap_or(piece.len());
        let (left, right) = piece.split_at(split_at);
        let mut parts = self.enforce_token_limit(left.to_string());
        parts.extend(self.enforce_token_limit(right.to_string()));
        parts
    }
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_inclusive(['.', '!', '?']) {
        current.push_str(word);
        if word.ends_with(['.', '!', '?']) {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

fn split_at_boundaries(code: &str, boundary: &Regex) -> Vec<String> {
    let starts: Vec<usize> = boundary.find_iter(code).map(|m| m.start()).collect();
    if starts.is_empty() {
        return vec![code.to_string()];
    }
    let mut spans = Vec::new();
    if starts[0] > 0 {
        spans.push(code[..starts[0]].to_string());
    }
    for (i, start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(code.len());
        spans.push(code[*start..end].to_string());
    }
    spans.retain(|span| !span.trim().is_empty());
    spans
}

fn detect_language(code: &str) -> CodeLanguage {
    let scores = [
        (CodeLanguage::Rust, RUST_BOUNDARY.find_iter(code).count()
            + code.matches("let mut ").count()
            + code.matches("::").count() / 2),
        (CodeLanguage::Python, PYTHON_BOUNDARY.find_iter(code).count()
            + code.matches("self.").count() / 2
            + code.matches("import ").count()),
        (
            CodeLanguage::JavaScript,
            JAVASCRIPT_BOUNDARY.find_iter(code).count()
                + code.matches("=>").count()
                + code.matches("const ").count(),
        ),
    ];
    scores
        .into_iter()
        .filter(|(_, score)| *score > 0)
        .max_by_key(|(_, score)| *score)
        .map(|(language, _)| language)
        .unwrap_or(CodeLanguage::Unknown)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_short_prose_is_one_chunk() {
        let chunker = TextChunker::new().unwrap();
        let chunks = chunker.chunk_prose("A short note about a football jersey.").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert!(chunks[0].token_count > 0);
    }

    #[test]
    fn test_empty_text_fails_loud() {
        let chunker = TextChunker::new().unwrap();
        assert!(matches!(
            chunker.chunk_prose("   \n\n  "),
            Err(PipelineError::EmptyChunk)
        ));
        assert!(matches!(chunker.chunk_code(""), Err(PipelineError::EmptyChunk)));
    }

    #[test]
    fn test_long_prose_splits_at_paragraphs_under_target() {
        let chunker = TextChunker::with_limits(50, 8192);
        let paragraph = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let text = vec![paragraph; 6].join("\n\n");
        let chunks = chunker.chunk_prose(&text).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Spans under the target pack up to it; none explodes past the
            // hard limit.
            assert!(chunk.token_count <= 8192);
            assert!(!chunk.text.trim().is_empty());
        }
        let indices: Vec<u32> = chunks.iter().map(|chunk| chunk.index).collect();
        let expected: Vec<u32> = (0..chunks.len() as u32).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn test_rust_code_splits_at_declarations() {
        let chunker = TextChunker::with_limits(30, 8192);
        let code = r#"
pub fn alpha() -> u32 {
    1
}

pub fn beta() -> u32 {
    2
}

pub struct Gamma {
    value: u32,
}
"#;
        let chunks = chunker.chunk_code(code).unwrap();
        assert!(chunks.len() >= 2);
        // Declaration starts stay at chunk starts.
        assert!(chunks
            .iter()
            .any(|chunk| chunk.text.trim_start().starts_with("pub fn beta")
                || chunk.text.trim_start().starts_with("pub fn alpha")));
    }

    #[test]
    fn test_python_code_is_detected_and_split() {
        let chunker = TextChunker::with_limits(20, 8192);
        let code = "import os\n\ndef first():\n    return 1\n\ndef second():\n    return 2\n\nclass Thing:\n    pass\n";
        let chunks = chunker.chunk_code(code).unwrap();
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn test_safety_net_enforces_hard_limit() {
        let chunker = TextChunker::with_limits(10, 20);
        // One unbreakable span: no sentence punctuation, no paragraphs.
        let text = "jersey ".repeat(300);
        let chunks = chunker.chunk_prose(&text).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 20, "chunk has {} tokens", chunk.token_count);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn proptest_chunks_respect_invariants(words in prop::collection::vec("[a-z]{1,12}", 1..400)) {
            let chunker = TextChunker::with_limits(64, 128);
            let text = words.join(" ");
            let chunks = chunker.chunk_prose(&text).unwrap();
            prop_assert!(!chunks.is_empty());
            for chunk in &chunks {
                prop_assert!(chunk.token_count <= 128);
                prop_assert!(!chunk.text.trim().is_empty());
            }
        }
    }
}
