//! The pipeline configuration document (`diffusers.json`) found at the root of a converted model directory.
//!
//! ```
//! # use diffusion_orchestrator::config::{ModelFamily, PipelineConfig};
//! let config: PipelineConfig = serde_json::from_str(r#"{
//! 	"pipeline": "stable-diffusion",
//! 	"framework": "onnx",
//! 	"text-encoder": { "path": "text_encoder.onnx" },
//! 	"unet": { "path": "unet.onnx" },
//! 	"vae": { "decoder": "vae_decoder.onnx" },
//! 	"schedulers": ["euler", "ddim"]
//! }"#).unwrap();
//! assert_eq!(config.pipeline, ModelFamily::StableDiffusion);
//! assert_eq!(config.vae.scale_factor, 8);
//! assert_eq!(config.unet.inputs.sample, "sample");
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{DiffusionError, Result, SchedulerOptions, SchedulerType};

/// The file name of the configuration document.
pub const CONFIG_FILE: &str = "diffusers.json";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub enum DiffusionFramework {
	#[default]
	Onnx
}

/// The architecture family of a pipeline, which decides its stages & capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
	/// Stable Diffusion 1.x/2.x.
	StableDiffusion,
	/// Stable Diffusion XL, with pooled text embeddings.
	#[serde(rename = "stable-diffusion-xl")]
	StableDiffusionXL,
	/// Stable Cascade: a low-resolution prior stage feeding a decoder stage.
	StableCascade,
	/// Flux: a flow-matching transformer over packed latents.
	Flux,
	/// Latent video diffusion with a temporally compressed VAE.
	Video
}

impl ModelFamily {
	/// Whether the family accepts a ControlNet-style secondary conditioner.
	pub fn supports_controlnet(&self) -> bool {
		matches!(self, ModelFamily::StableDiffusion | ModelFamily::StableDiffusionXL | ModelFamily::Flux)
	}

	/// Whether the family runs a prior stage before the main denoising loop.
	pub fn is_cascaded(&self) -> bool {
		matches!(self, ModelFamily::StableCascade)
	}

	/// Whether the family's primary model integrates a flow-matching velocity; the scheduler shift is then derived
	/// from the packed latent sequence length.
	pub fn is_flow_matching(&self) -> bool {
		matches!(self, ModelFamily::Flux)
	}

	/// Whether latents carry a frame axis (`[batch, channels, frames, height, width]`).
	pub fn is_video(&self) -> bool {
		matches!(self, ModelFamily::Video)
	}

	/// Whether the text encoder produces a pooled embedding that the primary model consumes.
	pub fn uses_pooled_embeddings(&self) -> bool {
		matches!(self, ModelFamily::StableDiffusionXL | ModelFamily::Flux)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum TokenizerConfig {
	#[serde(rename_all = "kebab-case")]
	CLIPTokenizer {
		path: String,
		model_max_length: usize,
		bos_token: u32,
		eos_token: u32
	}
}

fn default_input_ids() -> String {
	"input_ids".to_string()
}

/// The text encoder model.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TextEncoderConfig {
	/// Model file, relative to the pipeline root.
	pub path: String,
	/// Name of the token ID input.
	#[serde(default = "default_input_ids")]
	pub input_ids: String,
	/// Name of the pooled embedding output, for families that consume one.
	#[serde(default)]
	pub pooled_output: Option<String>
}

/// Input names of a denoising model. Inputs the loaded model does not declare are dropped before each call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ModelInputNames {
	/// The noisy latent.
	pub sample: String,
	/// The current timestep.
	pub timestep: String,
	/// Text embeddings.
	pub encoder_hidden_states: String,
	/// Pooled text embeddings.
	pub pooled: String,
	/// ControlNet conditioning image.
	pub controlnet_cond: String,
	/// ControlNet conditioning scale.
	pub conditioning_scale: String,
	/// Output of the prior stage, consumed by the decoder stage of cascaded families.
	pub prior: String
}

impl Default for ModelInputNames {
	fn default() -> Self {
		Self {
			sample: "sample".to_string(),
			timestep: "timestep".to_string(),
			encoder_hidden_states: "encoder_hidden_states".to_string(),
			pooled: "text_embeds".to_string(),
			controlnet_cond: "controlnet_cond".to_string(),
			conditioning_scale: "conditioning_scale".to_string(),
			prior: "effnet".to_string()
		}
	}
}

/// The primary denoising model (U-Net or transformer).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DenoiserConfig {
	/// Model file, relative to the pipeline root.
	pub path: String,
	/// Input names.
	#[serde(default)]
	pub inputs: ModelInputNames
}

/// A ControlNet-style secondary conditioner. Its outputs are fed to the primary model under their own names.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControlNetConfig {
	/// Model file, relative to the pipeline root.
	pub path: String,
	/// Input names; `sample`, `timestep`, `encoder-hidden-states`, `controlnet-cond` & `conditioning-scale` are used.
	#[serde(default)]
	pub inputs: ModelInputNames
}

fn default_prior_channels() -> usize {
	16
}
fn default_prior_compression() -> f32 {
	42.67
}
fn default_decoder_multiplier() -> usize {
	10
}

/// The prior stage of a cascaded family.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PriorConfig {
	/// Model file, relative to the pipeline root.
	pub path: String,
	/// Input names.
	#[serde(default)]
	pub inputs: ModelInputNames,
	/// Channels of the prior latent.
	#[serde(default = "default_prior_channels")]
	pub latent_channels: usize,
	/// Spatial compression of the prior latent relative to the requested image size.
	#[serde(default = "default_prior_compression")]
	pub compression: f32,
	/// Fixed ratio between the decoder latent & prior latent resolutions.
	#[serde(default = "default_decoder_multiplier")]
	pub decoder_multiplier: usize,
	/// Scheduler parameters of the prior loop; the pipeline's scheduler options apply when absent.
	#[serde(default)]
	pub scheduler: Option<SchedulerOptions>
}

fn default_latent_channels() -> usize {
	4
}
fn default_scale_factor() -> usize {
	8
}
fn default_temporal_scale_factor() -> usize {
	1
}
fn default_scaling_factor() -> f32 {
	0.18215
}
fn default_sample_input() -> String {
	"sample".to_string()
}
fn default_latent_input() -> String {
	"latent_sample".to_string()
}

/// The variational autoencoder.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEConfig {
	/// Encoder model file, required for image-to-image & encoded conditioning.
	#[serde(default)]
	pub encoder: Option<String>,
	/// Decoder model file.
	pub decoder: String,
	/// Channels of the latent space.
	#[serde(default = "default_latent_channels")]
	pub latent_channels: usize,
	/// Spatial downscale from image to latent.
	#[serde(default = "default_scale_factor")]
	pub scale_factor: usize,
	/// Temporal downscale from frames to latent frames (video families).
	#[serde(default = "default_temporal_scale_factor")]
	pub temporal_scale_factor: usize,
	/// Multiplier applied to encoded latents.
	#[serde(default = "default_scaling_factor")]
	pub scaling_factor: f32,
	/// Offset subtracted from encoded latents before scaling.
	#[serde(default)]
	pub shift_factor: f32,
	/// Name of the encoder's image input.
	#[serde(default = "default_sample_input")]
	pub encoder_input: String,
	/// Name of the decoder's latent input.
	#[serde(default = "default_latent_input")]
	pub decoder_input: String
}

/// A converted pipeline.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineConfig {
	/// The model family.
	pub pipeline: ModelFamily,
	#[serde(default)]
	#[allow(missing_docs)]
	pub framework: DiffusionFramework,
	/// Tokenizer of the text encoder.
	#[serde(default)]
	pub tokenizer: Option<TokenizerConfig>,
	/// The text encoder.
	pub text_encoder: TextEncoderConfig,
	/// The primary denoising model.
	pub unet: DenoiserConfig,
	/// Optional secondary conditioner.
	#[serde(default)]
	pub controlnet: Option<ControlNetConfig>,
	/// Prior stage of cascaded families.
	#[serde(default)]
	pub prior: Option<PriorConfig>,
	/// The autoencoder.
	pub vae: VAEConfig,
	/// Schedulers the primary model was validated with.
	pub schedulers: Vec<SchedulerType>,
	/// Noise schedule the primary model was trained with.
	#[serde(default)]
	pub scheduler: SchedulerOptions
}

impl PipelineConfig {
	/// Reads `diffusers.json` from a pipeline root.
	///
	/// # Errors
	/// Returns an I/O or JSON error if the document cannot be read, or a configuration error if it is inconsistent.
	pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
		let bytes = fs::read(root.as_ref().join(CONFIG_FILE))?;
		let config: PipelineConfig = serde_json::from_slice(&bytes)?;
		config.validate()?;
		Ok(config)
	}

	/// Checks the document for internal consistency.
	///
	/// # Errors
	/// Returns a configuration error describing the first inconsistency.
	pub fn validate(&self) -> Result<()> {
		if self.schedulers.is_empty() {
			return Err(DiffusionError::config("pipeline declares no supported schedulers"));
		}
		if self.pipeline.is_cascaded() && self.prior.is_none() {
			return Err(DiffusionError::config(format!("{:?} pipelines require a `prior` stage", self.pipeline)));
		}
		if self.controlnet.is_some() && !self.pipeline.supports_controlnet() {
			return Err(DiffusionError::config(format!("{:?} pipelines do not support a controlnet", self.pipeline)));
		}
		if self.pipeline.uses_pooled_embeddings() && self.text_encoder.pooled_output.is_none() {
			return Err(DiffusionError::config(format!("{:?} pipelines require the text encoder's `pooled-output`", self.pipeline)));
		}
		if self.vae.scale_factor == 0 || self.vae.temporal_scale_factor == 0 || self.vae.latent_channels == 0 {
			return Err(DiffusionError::config("vae scale factors & latent channels must be >0"));
		}
		if let Some(prior) = &self.prior {
			if prior.decoder_multiplier == 0 || !prior.compression.is_normal() || prior.compression < 0.0 {
				return Err(DiffusionError::config("prior compression & decoder multiplier must be >0"));
			}
		}
		Ok(())
	}

	/// Whether `scheduler` is in the supported set.
	pub fn supports_scheduler(&self, scheduler: SchedulerType) -> bool {
		self.schedulers.contains(&scheduler)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn document(body: &str) -> serde_json::Result<PipelineConfig> {
		serde_json::from_str(&format!(
			r#"{{ "text-encoder": {{ "path": "te.onnx" }}, "unet": {{ "path": "unet.onnx" }}, "vae": {{ "decoder": "dec.onnx" }}, {body} }}"#
		))
	}

	#[test]
	fn test_cascaded_family_requires_prior() {
		let config = document(r#""pipeline": "stable-cascade", "schedulers": ["ddpm"]"#).unwrap();
		assert!(config.validate().is_err());
		let config = document(r#""pipeline": "stable-cascade", "schedulers": ["ddpm"], "prior": { "path": "prior.onnx" }"#).unwrap();
		config.validate().unwrap();
		assert_eq!(config.prior.unwrap().decoder_multiplier, 10);
	}

	#[test]
	fn test_video_family_rejects_controlnet() {
		let config = document(r#""pipeline": "video", "schedulers": ["euler"], "controlnet": { "path": "cn.onnx" }"#).unwrap();
		assert!(matches!(config.validate(), Err(DiffusionError::Configuration(_))));
	}

	#[test]
	fn test_pooled_families_require_pooled_output() {
		for family in ["stable-diffusion-xl", "flux"] {
			let config = document(&format!(r#""pipeline": "{family}", "schedulers": ["euler"]"#)).unwrap();
			assert!(matches!(config.validate(), Err(DiffusionError::Configuration(_))), "{family}");
		}
		let config = serde_json::from_str::<PipelineConfig>(
			r#"{ "pipeline": "flux", "schedulers": ["flow-match-euler"], "text-encoder": { "path": "te.onnx", "pooled-output": "pooler_output" },
				"unet": { "path": "unet.onnx" }, "vae": { "decoder": "dec.onnx" } }"#
		)
		.unwrap();
		config.validate().unwrap();
	}

	#[test]
	fn test_scheduler_options_are_read_kebab_case() {
		let config = document(r#""pipeline": "flux", "schedulers": ["flow-match-euler"], "scheduler": { "use-dynamic-shifting": true, "shift": 3.0 }"#).unwrap();
		assert!(config.scheduler.use_dynamic_shifting);
		assert_eq!(config.scheduler.shift, 3.0);
		assert_eq!(config.scheduler.num_train_timesteps, 1000);
		assert!(config.supports_scheduler(SchedulerType::FlowMatchEuler));
		assert!(!config.supports_scheduler(SchedulerType::Euler));
	}
}
