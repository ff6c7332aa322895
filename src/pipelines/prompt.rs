//! Prompt tokenization & text encoding.

use std::sync::Arc;

use ndarray::{Array2, ArrayD};
use tracing::debug;

use crate::{config::TextEncoderConfig, session::SessionInputs, CancellationToken, DiffusionError, ModelSession, Result};

/// Token IDs & attention mask for one prompt, padded to the tokenizer's maximum length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPrompt {
	/// Token IDs.
	pub input_ids: Vec<i64>,
	/// `1` for real tokens, `0` for padding.
	pub attention_mask: Vec<i64>
}

/// Turns prompt text into token IDs.
pub trait PromptTokenizer: Send + Sync {
	/// Length every encoding is padded or truncated to.
	fn max_length(&self) -> usize;

	/// Tokenizes `text`.
	fn encode(&self, text: &str) -> Result<TokenizedPrompt>;
}

/// Text embeddings for one run.
#[derive(Debug, Clone)]
pub struct PromptResult {
	/// Hidden states for the positive prompt.
	pub cond: ArrayD<f32>,
	/// Hidden states for the negative prompt, present when guidance is enabled.
	pub uncond: Option<ArrayD<f32>>,
	/// Pooled projection of the positive prompt, for families that use one.
	pub cond_pooled: Option<ArrayD<f32>>,
	/// Pooled projection of the negative prompt.
	pub uncond_pooled: Option<ArrayD<f32>>
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PromptKey {
	prompt: String,
	negative_prompt: String,
	guidance: bool
}

/// Tokenizes & encodes prompts through the text encoder session, caching the last result.
///
/// The cache holds a single entry keyed by the prompt, the negative prompt and whether guidance is enabled. A run with
/// any of these changed replaces it.
pub struct PromptConditioner {
	tokenizer: Arc<dyn PromptTokenizer>,
	input_ids: String,
	pooled_output: Option<String>,
	cache: Option<(PromptKey, Arc<PromptResult>)>
}

impl PromptConditioner {
	/// Creates a conditioner for the text encoder described by `config`.
	pub fn new(tokenizer: Arc<dyn PromptTokenizer>, config: &TextEncoderConfig) -> Self {
		Self {
			tokenizer,
			input_ids: config.input_ids.clone(),
			pooled_output: config.pooled_output.clone(),
			cache: None
		}
	}

	/// Returns the cached embeddings if they were computed for exactly these inputs.
	pub fn cached(&self, prompt: &str, negative_prompt: &str, guidance: bool) -> Option<Arc<PromptResult>> {
		let key = PromptKey {
			prompt: prompt.to_owned(),
			negative_prompt: negative_prompt.to_owned(),
			guidance
		};
		match &self.cache {
			Some((cached, result)) if *cached == key => {
				debug!("prompt cache hit");
				Some(Arc::clone(result))
			}
			_ => None
		}
	}

	/// Encodes the prompt (and the negative prompt if `guidance` is set) with `session`, which must be loaded.
	///
	/// # Errors
	/// Propagates tokenizer & session errors.
	pub async fn encode(
		&mut self,
		session: &ModelSession,
		prompt: &str,
		negative_prompt: &str,
		guidance: bool,
		token: &CancellationToken
	) -> Result<Arc<PromptResult>> {
		if let Some(result) = self.cached(prompt, negative_prompt, guidance) {
			return Ok(result);
		}

		let (cond, cond_pooled) = self.encode_one(session, prompt, token).await?;
		let (uncond, uncond_pooled) = if guidance {
			let (uncond, pooled) = self.encode_one(session, negative_prompt, token).await?;
			(Some(uncond), pooled)
		} else {
			(None, None)
		};

		let result = Arc::new(PromptResult { cond, uncond, cond_pooled, uncond_pooled });
		let key = PromptKey {
			prompt: prompt.to_owned(),
			negative_prompt: negative_prompt.to_owned(),
			guidance
		};
		self.cache = Some((key, Arc::clone(&result)));
		Ok(result)
	}

	/// Drops the cached embeddings.
	pub fn clear_cache(&mut self) {
		self.cache = None;
	}

	async fn encode_one(&self, session: &ModelSession, text: &str, token: &CancellationToken) -> Result<(ArrayD<f32>, Option<ArrayD<f32>>)> {
		let tokens = self.tokenizer.encode(text)?;
		let len = tokens.input_ids.len();
		let input_ids = Array2::from_shape_vec((1, len), tokens.input_ids)?.into_dyn();
		let attention_mask = Array2::from_shape_vec((1, len), tokens.attention_mask)?.into_dyn();

		let inputs = SessionInputs::new().with(self.input_ids.as_str(), input_ids).with("attention_mask", attention_mask);
		let outputs = session.run(inputs, token).await?;

		let pooled = match &self.pooled_output {
			Some(name) => Some(
				outputs
					.get(name)
					.cloned()
					.ok_or_else(|| DiffusionError::config(format!("text encoder has no output named `{name}`")))?
			),
			None => None
		};
		let hidden = outputs.get("last_hidden_state").cloned().map_or_else(|| outputs.into_first(), Ok)?;
		Ok((hidden, pooled))
	}
}
