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

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tiktoken_rs::CoreBPE;

use crate::InferenceError;

/// cl100k tokenizer shared process-wide: loading the BPE ranks is expensive
/// and the vocabulary never changes.
static CL100K: OnceCell<Arc<CoreBPE>> = OnceCell::new();

/// Token counter over the cl100k_base vocabulary (the default embedding
/// model's tokenization).
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl Tokenizer {
    pub fn cl100k() -> Result<Self, InferenceError> {
        let bpe = CL100K.get_or_try_init(|| {
            tiktoken_rs::cl100k_base()
                .map(Arc::new)
                .map_err(|error| InferenceError::Configuration(error.to_string()))
        })?;
        Ok(Self { bpe: bpe.clone() })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Convenience for one-off counts.
pub fn cl100k_token_count(text: &str) -> Result<usize, InferenceError> {
    Ok(Tokenizer::cl100k()?.count(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_count_scales_with_text() {
        let tokenizer = Tokenizer::cl100k().unwrap();
        assert_eq!(tokenizer.count(""), 0);
        let short = tokenizer.count("hello world");
        let long = tokenizer.count(&"hello world ".repeat(100));
        assert!(short >= 1);
        assert!(long > short * 50);
    }

    #[test]
    fn test_tokenizer_is_shared() {
        let a = Tokenizer::cl100k().unwrap();
        let b = Tokenizer::cl100k().unwrap();
        assert_eq!(a.count("same text"), b.count("same text"));
    }
}
