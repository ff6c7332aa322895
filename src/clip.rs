// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CLIP tokenizer implementation.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::{
	config::TokenizerConfig,
	pipelines::{PromptTokenizer, TokenizedPrompt},
	Result
};

/// A basic [CLIP](https://arxiv.org/abs/2103.00020) tokenizer.
///
/// CLIP is used by many diffusion models, including Stable Diffusion, for prompt tokenization and feature extraction.
/// Encodings are truncated or padded with the end-of-string token to exactly `model_max_length` tokens.
pub struct CLIPStandardTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	bos_token_id: u32,
	eos_token_id: u32
}

unsafe impl Send for CLIPStandardTokenizer {}
unsafe impl Sync for CLIPStandardTokenizer {}

impl CLIPStandardTokenizer {
	/// Loads a CLIP tokenizer from a file.
	///
	/// # Errors
	/// Returns an I/O error if the file can't be read, or a JSON error if it is not a serialized tokenizer.
	pub fn new(path: impl AsRef<Path>, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> Result<Self> {
		let bytes = std::fs::read(path)?;
		Self::from_bytes(bytes, model_max_length, bos_token_id, eos_token_id)
	}

	/// Loads the tokenizer described by a pipeline's [`TokenizerConfig`], relative to the pipeline root.
	///
	/// # Errors
	/// See [`CLIPStandardTokenizer::new`].
	pub fn from_config(root: impl AsRef<Path>, config: &TokenizerConfig) -> Result<Self> {
		match config {
			TokenizerConfig::CLIPTokenizer {
				path,
				model_max_length,
				bos_token,
				eos_token
			} => Self::new(root.as_ref().join(path), *model_max_length, *bos_token, *eos_token)
		}
	}

	/// Loads a CLIP tokenizer from a byte array.
	///
	/// # Errors
	/// Returns a JSON error if `bytes` is not a serialized tokenizer.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> Result<Self> {
		let tokenizer: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		Ok(Self {
			inner: tokenizer,
			model_max_length,
			bos_token_id,
			eos_token_id
		})
	}

	/// Returns the ID of the end-of-string token.
	pub fn eos(&self) -> u32 {
		self.eos_token_id
	}

	/// Returns the ID of the beginning-of-string token.
	pub fn bos(&self) -> u32 {
		self.bos_token_id
	}
}

impl PromptTokenizer for CLIPStandardTokenizer {
	fn max_length(&self) -> usize {
		self.model_max_length
	}

	fn encode(&self, text: &str) -> Result<TokenizedPrompt> {
		let encoding = self.inner.encode(text, true).map_err(|e| anyhow::anyhow!("{e:?}"))?;
		let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
		let mut attention_mask: Vec<i64> = encoding.get_attention_mask().iter().map(|&m| i64::from(m)).collect();

		if input_ids.len() > self.model_max_length {
			input_ids.truncate(self.model_max_length);
			attention_mask.truncate(self.model_max_length);
			// keep the end-of-string token after truncation
			if let Some(last) = input_ids.last_mut() {
				*last = i64::from(self.eos_token_id);
			}
		}
		input_ids.resize(self.model_max_length, i64::from(self.eos_token_id));
		attention_mask.resize(self.model_max_length, 0);
		Ok(TokenizedPrompt { input_ids, attention_mask })
	}
}
