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

use std::{
	collections::BTreeSet,
	fmt,
	path::{Path, PathBuf},
	sync::Arc
};

use tracing::{debug, info};

use super::PipelineOptions;
use crate::{
	config::PipelineConfig,
	pipelines::{residency::SessionSet, Component, LatentCodec, PromptConditioner, PromptTokenizer, ResidencyPlan, SecondaryConditioner},
	CancellationToken, DiffusionDevice, ExecutionEngine, ModelSession, Result
};
#[cfg(feature = "tokenizers")]
use crate::{clip::CLIPStandardTokenizer, DeviceCatalog, DiffusionError};

/// A diffusion pipeline: text encoder, optional prior stage, primary denoiser, optional ControlNet & VAE, driven by
/// one denoising loop per stage.
///
/// The pipeline owns every [`ModelSession`] it creates and is the only thing that loads or unloads them. Creating a
/// pipeline reads its configuration but loads nothing; models are loaded by [`DiffusionPipeline::load`] or on
/// demand by [`DiffusionPipeline::run`], according to the run's memory policy.
///
/// ```ignore
/// use diffusion_orchestrator::{CancellationToken, DeviceCatalog, DiffusionPipeline, OrtEnvironment, PipelineOptions};
///
/// let catalog = DeviceCatalog::new(OrtEnvironment::default().into_arc());
/// let mut pipeline = DiffusionPipeline::new(&catalog, "./stable-diffusion-v1-5/", PipelineOptions::default())?;
/// pipeline.load(&CancellationToken::new()).await?;
/// ```
pub struct DiffusionPipeline {
	pub(super) root: PathBuf,
	pub(super) config: PipelineConfig,
	pub(super) options: PipelineOptions,
	pub(super) sessions: SessionSet,
	pub(super) prompts: PromptConditioner,
	pub(super) codec: LatentCodec,
	pub(super) controlnet: Option<SecondaryConditioner>
}

impl fmt::Debug for DiffusionPipeline {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DiffusionPipeline")
			.field("root", &self.root)
			.field("family", &self.config.pipeline)
			.field("resident", &self.sessions.resident())
			.finish()
	}
}

impl DiffusionPipeline {
	/// Creates a pipeline from the converted model in `root`, running its models through ONNX Runtime on the devices
	/// `catalog` resolves.
	///
	/// # Errors
	/// Returns an error if `diffusers.json` cannot be read or is inconsistent, or if the tokenizer cannot be loaded.
	#[cfg(feature = "tokenizers")]
	pub fn new(catalog: &DeviceCatalog, root: impl Into<PathBuf>, options: PipelineOptions) -> Result<Self> {
		let root = root.into();
		let config = PipelineConfig::from_dir(&root)?;
		let tokenizer = match &config.tokenizer {
			Some(tokenizer) => CLIPStandardTokenizer::from_config(&root, tokenizer)?,
			None => return Err(DiffusionError::config("pipeline does not declare a tokenizer"))
		};
		let options = PipelineOptions {
			devices: catalog.resolve_all(&options.devices),
			..options
		};
		Self::with_engine(catalog.engine(), root, config, options, Arc::new(tokenizer))
	}

	/// Creates a pipeline on top of an arbitrary execution engine & tokenizer.
	///
	/// # Errors
	/// Returns a configuration error if `config` is inconsistent.
	pub fn with_engine(
		engine: Arc<dyn ExecutionEngine>,
		root: impl Into<PathBuf>,
		config: PipelineConfig,
		options: PipelineOptions,
		tokenizer: Arc<dyn PromptTokenizer>
	) -> Result<Self> {
		let root = root.into();
		config.validate()?;

		let devices = &options.devices;
		let session = |component: Component, path: &str, device: &DiffusionDevice| {
			ModelSession::new(component.to_string(), root.join(path), device.clone(), Arc::clone(&engine))
		};
		let mut sessions = SessionSet::default();
		sessions.insert(Component::TextEncoder, session(Component::TextEncoder, &config.text_encoder.path, &devices.text_encoder));
		sessions.insert(Component::Denoiser, session(Component::Denoiser, &config.unet.path, &devices.denoiser));
		sessions.insert(Component::VaeDecoder, session(Component::VaeDecoder, &config.vae.decoder, &devices.vae_decoder));
		if let Some(encoder) = &config.vae.encoder {
			sessions.insert(Component::VaeEncoder, session(Component::VaeEncoder, encoder, &devices.vae_encoder));
		}
		if let Some(controlnet) = &config.controlnet {
			sessions.insert(Component::ControlNet, session(Component::ControlNet, &controlnet.path, &devices.controlnet));
		}
		if let Some(prior) = &config.prior {
			sessions.insert(Component::Prior, session(Component::Prior, &prior.path, &devices.prior));
		}
		sessions.set_optimizations(options.optimizations.clone());

		info!(family = ?config.pipeline, root = %root.display(), components = ?sessions.available().collect::<Vec<_>>(), "created pipeline");
		Ok(Self {
			prompts: PromptConditioner::new(tokenizer, &config.text_encoder),
			codec: LatentCodec::new(&config.vae),
			controlnet: config.controlnet.as_ref().map(SecondaryConditioner::new),
			root,
			config,
			options,
			sessions
		})
	}

	/// The pipeline's configuration document.
	pub fn config(&self) -> &PipelineConfig {
		&self.config
	}

	/// The directory models are loaded from.
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// The options the pipeline was created with.
	pub fn options(&self) -> &PipelineOptions {
		&self.options
	}

	/// The session of `component`, if the pipeline has one.
	pub fn session(&self, component: Component) -> Option<&ModelSession> {
		self.sessions.get(component).ok()
	}

	/// Components whose sessions are currently loaded.
	pub fn resident(&self) -> BTreeSet<Component> {
		self.sessions.resident()
	}

	/// Loads every model the pipeline's memory mode keeps resident. In [`super::MemoryMode::Minimum`] nothing is
	/// loaded ahead of a run.
	///
	/// If loading fails or is cancelled, models loaded by this call are unloaded again.
	///
	/// # Errors
	/// Returns [`crate::DiffusionError::ModelNotFound`] if a model file is missing, and propagates engine errors &
	/// cancellation.
	pub async fn load(&mut self, token: &CancellationToken) -> Result<()> {
		let plan = ResidencyPlan::new(self.sessions.available(), self.options.memory_mode.low_memory(), false);
		self.sessions.set_optimizations(self.options.optimizations.clone());

		let mut loaded = BTreeSet::new();
		for component in plan.preload() {
			if let Err(e) = self.sessions.ensure(component, token, &mut loaded).await {
				for component in &loaded {
					self.sessions.unload(*component);
				}
				return Err(e);
			}
		}
		info!(loaded = ?loaded, "pipeline loaded");
		Ok(())
	}

	/// Unloads every model and drops the prompt & encoder caches.
	pub fn unload(&mut self) {
		self.sessions.unload_all();
		self.prompts.clear_cache();
		self.codec.clear_cache();
		debug!("pipeline unloaded");
	}
}
