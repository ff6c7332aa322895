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

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use ndarray::{arr1, ArrayD, Axis, IxDyn};
use rand::Rng;
use tracing::{debug, info, info_span, trace, Instrument};

use super::{DiffusionPipeline, DiffusionProgress, GenerateOptions, ProgressCallback, RunPhase};
use crate::{
	config::ModelInputNames,
	guidance,
	pipelines::{Component, Phase, PromptResult, ResidencyPlan, SecondaryConditioner},
	schedulers::{create_scheduler, DiffusionScheduler},
	session::SessionInputs,
	CancellationToken, DiffusionError, Result
};

/// Which denoising loop an evaluation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
	Prior,
	Main
}

impl Stage {
	fn component(self) -> Component {
		match self {
			Stage::Prior => Component::Prior,
			Stage::Main => Component::Denoiser
		}
	}

	fn phase(self) -> RunPhase {
		match self {
			Stage::Prior => RunPhase::Prior,
			Stage::Main => RunPhase::Denoise
		}
	}
}

/// A run whose options passed validation, with its schedulers constructed.
struct ValidatedRun {
	latent_dims: Vec<usize>,
	prior_dims: Option<Vec<usize>>,
	scheduler: Box<dyn DiffusionScheduler>,
	prior_scheduler: Option<Box<dyn DiffusionScheduler>>,
	controlnet: bool
}

struct RunState<'a> {
	plan: ResidencyPlan,
	loaded: BTreeSet<Component>,
	progress: Option<ProgressCallback<'a>>,
	report_latents: bool
}

impl RunState<'_> {
	fn notify(&mut self, progress: DiffusionProgress) {
		if let Some(callback) = self.progress.as_deref_mut() {
			callback(progress);
		}
	}
}

/// Conditioning shared by every evaluation of one loop.
struct LoopInputs<'a> {
	prompts: &'a PromptResult,
	prior: Option<&'a ArrayD<f32>>,
	control: Option<(&'a ArrayD<f32>, f32)>,
	guidance_scale: f32
}

impl DiffusionPipeline {
	/// Runs the pipeline, returning the decoded output tensor (`[1, 3, height, width]`, or
	/// `[1, 3, frames, height, width]` for video families) with values in `[-1, 1]`.
	///
	/// Options are validated before any model is loaded. Each phase starts by unloading whatever the run's memory
	/// policy does not allow during it, and low-memory phases unload their models as soon as they complete.
	/// `progress` receives one notification per completed step, then a final [`RunPhase::Decode`] notification.
	///
	/// Cancelling `token` stops the run at the next step (or aborts the in-flight model call); every model loaded by
	/// this run is unloaded before [`DiffusionError::Cancelled`] is returned.
	///
	/// ```ignore
	/// let token = CancellationToken::new();
	/// let output = pipeline
	/// 	.run(&GenerateOptions::default().with_prompt("photo of a red fox").with_steps(20), None, &token)
	/// 	.await?;
	/// let images = diffusion_orchestrator::util::tensor_to_images(output.view())?;
	/// ```
	///
	/// # Errors
	/// Returns a configuration error for invalid options, [`DiffusionError::ModelNotFound`] for missing model files &
	/// propagates engine errors.
	pub async fn run(&mut self, options: &GenerateOptions, progress: Option<ProgressCallback<'_>>, token: &CancellationToken) -> Result<ArrayD<f32>> {
		let span = info_span!("run", family = ?self.config.pipeline, scheduler = %options.scheduler, steps = options.steps);
		self.run_inner(options, progress, token).instrument(span).await
	}

	async fn run_inner(&mut self, options: &GenerateOptions, progress: Option<ProgressCallback<'_>>, token: &CancellationToken) -> Result<ArrayD<f32>> {
		let started = Instant::now();
		let run = self.validate(options)?;

		let mut optimizations = self.options.optimizations.clone();
		optimizations.extend(options.optimizations.iter().map(|(c, o)| (*c, o.clone())));
		self.sessions.set_optimizations(optimizations);

		let low_memory = options.low_memory.unwrap_or_else(|| self.options.memory_mode.low_memory());
		let mut state = RunState {
			plan: ResidencyPlan::new(self.sessions.available(), low_memory, run.controlnet),
			loaded: BTreeSet::new(),
			progress,
			report_latents: options.report_latents
		};
		info!(width = options.width, height = options.height, ?low_memory, "starting run");

		let result = self.generate(options, run, &mut state, token).await;
		match &result {
			Ok(output) => info!(elapsed = ?started.elapsed(), shape = ?output.shape(), "run complete"),
			Err(e) if e.is_cancelled() => {
				debug!(unloading = ?state.loaded, "run cancelled, releasing models loaded for it");
				for component in &state.loaded {
					self.sessions.unload(*component);
				}
				info!(elapsed = ?started.elapsed(), "run cancelled");
			}
			Err(e) => debug!(error = %e, "run failed")
		}
		result
	}

	fn validate(&self, options: &GenerateOptions) -> Result<ValidatedRun> {
		let family = self.config.pipeline;
		let vae = &self.config.vae;

		if options.steps == 0 {
			return Err(DiffusionError::config("a run needs at least one step"));
		}
		if !self.config.supports_scheduler(options.scheduler) {
			return Err(DiffusionError::config(format!("scheduler `{}` is not supported by {family:?} pipelines", options.scheduler)));
		}
		if !options.guidance_scale.is_finite() || !options.prior_guidance_scale.is_finite() {
			return Err(DiffusionError::config("guidance scales must be finite"));
		}

		let controlnet = options.control_scale.is_some() || options.control_image.is_some();
		if controlnet {
			if !family.supports_controlnet() {
				return Err(DiffusionError::config(format!("{family:?} pipelines do not support secondary conditioning")));
			}
			if self.controlnet.is_none() {
				return Err(DiffusionError::config("secondary conditioning requested but the pipeline has no controlnet model"));
			}
			if options.control_image.is_none() {
				return Err(DiffusionError::config("secondary conditioning requested without a control image"));
			}
		}

		let scale = vae.scale_factor;
		let width = options.width as usize / scale * scale;
		let height = options.height as usize / scale * scale;
		if width == 0 || height == 0 {
			return Err(DiffusionError::config(format!("output size must be at least {scale}x{scale}")));
		}
		if family.is_video() && options.frames == 0 {
			return Err(DiffusionError::config("video runs need at least one frame"));
		}
		if let Some(image) = &options.control_image {
			check_image("control image", image, width, height)?;
		}

		if let Some(image) = &options.input_image {
			if !self.sessions.contains(Component::VaeEncoder) {
				return Err(DiffusionError::config("image-to-image requires a vae encoder"));
			}
			if family.is_cascaded() {
				return Err(DiffusionError::config(format!("{family:?} pipelines do not support image-to-image")));
			}
			if !(options.strength > 0.0 && options.strength <= 1.0) {
				return Err(DiffusionError::config(format!("strength must be in (0, 1], got {}", options.strength)));
			}
			check_image("input image", image, width, height)?;
		}

		let (latent_dims, prior_dims) = match &self.config.prior {
			Some(prior) if family.is_cascaded() => {
				let prior_height = (height as f32 / prior.compression).ceil() as usize;
				let prior_width = (width as f32 / prior.compression).ceil() as usize;
				let multiplier = prior.decoder_multiplier;
				(
					vec![1, vae.latent_channels, prior_height * multiplier, prior_width * multiplier],
					Some(vec![1, prior.latent_channels, prior_height, prior_width])
				)
			}
			_ if family.is_video() => {
				let frames = (options.frames - 1) / vae.temporal_scale_factor + 1;
				(vec![1, vae.latent_channels, frames, height / scale, width / scale], None)
			}
			_ => (vec![1, vae.latent_channels, height / scale, width / scale], None)
		};

		let seed = options.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut scheduler_options = options.scheduler_options.clone().unwrap_or_else(|| self.config.scheduler.clone());
		if family.is_flow_matching() && scheduler_options.use_dynamic_shifting && scheduler_options.image_seq_len.is_none() {
			// latents are packed into 2x2 patches
			scheduler_options.image_seq_len = Some((height / scale / 2) * (width / scale / 2));
		}
		let mut scheduler = create_scheduler(options.scheduler, &scheduler_options, options.steps, seed)?;

		let prior_scheduler = match &self.config.prior {
			Some(prior) if family.is_cascaded() => {
				if options.prior_steps == 0 {
					return Err(DiffusionError::config("the prior stage needs at least one step"));
				}
				let prior_options = prior.scheduler.clone().unwrap_or_else(|| scheduler_options.clone());
				Some(create_scheduler(options.scheduler, &prior_options, options.prior_steps, seed)?)
			}
			_ => None
		};

		if options.input_image.is_some() {
			let skipped = options.steps - (options.steps as f32 * options.strength).floor() as usize;
			if skipped >= options.steps {
				return Err(DiffusionError::config(format!("strength {} leaves no steps to run", options.strength)));
			}
			let begin = scheduler.begin_index_for_step(skipped);
			scheduler.set_begin_index(begin)?;
			debug!(skipped, begin, "truncated schedule for image-to-image");
		}

		Ok(ValidatedRun {
			latent_dims,
			prior_dims,
			scheduler,
			prior_scheduler,
			controlnet
		})
	}

	async fn generate(&mut self, options: &GenerateOptions, run: ValidatedRun, state: &mut RunState<'_>, token: &CancellationToken) -> Result<ArrayD<f32>> {
		let ValidatedRun {
			latent_dims,
			prior_dims,
			mut scheduler,
			prior_scheduler,
			controlnet
		} = run;

		let guidance = guidance::is_guidance_enabled(options.guidance_scale) || (prior_scheduler.is_some() && guidance::is_guidance_enabled(options.prior_guidance_scale));
		let prompts = self.encode_prompts(options, guidance, state, token).await?;

		let source = match &options.input_image {
			Some(image) => {
				self.sessions.reconcile(&state.plan, Phase::Encode);
				if !self.codec.is_cached(image.view()) {
					self.sessions.ensure(Component::VaeEncoder, token, &mut state.loaded).await?;
				}
				let (encoder, optimization) = self.sessions.session_and_optimization(Component::VaeEncoder)?;
				let latent = self.codec.encode(encoder, optimization, image.view(), token).await?;
				self.sessions.release(&state.plan, Phase::Encode);
				Some(latent)
			}
			None => None
		};

		let prior = match (prior_scheduler, prior_dims) {
			(Some(mut prior_scheduler), Some(dims)) => {
				self.sessions.reconcile(&state.plan, Phase::Prior);
				self.sessions.ensure(Component::Prior, token, &mut state.loaded).await?;
				let latent = prior_scheduler.create_random_sample(&dims);
				let inputs = LoopInputs {
					prompts: &prompts,
					prior: None,
					control: None,
					guidance_scale: options.prior_guidance_scale
				};
				let latent = self.denoise(Stage::Prior, prior_scheduler.as_mut(), latent, &inputs, state, token).await?;
				self.sessions.release(&state.plan, Phase::Prior);
				Some(latent)
			}
			_ => None
		};

		self.sessions.reconcile(&state.plan, Phase::Denoise);
		// in swap mode each evaluation loads the denoiser after its controlnet pass
		if !state.plan.swap_controlnet() {
			self.sessions.ensure(Component::Denoiser, token, &mut state.loaded).await?;
			if controlnet {
				self.sessions.ensure(Component::ControlNet, token, &mut state.loaded).await?;
			}
		}
		let latent = match source {
			Some(encoded) => {
				let timestep = scheduler
					.timesteps()
					.get(scheduler.begin_index())
					.copied()
					.ok_or_else(|| DiffusionError::scheduler("image-to-image start is past the last timestep"))?;
				let encoded = repeat_frames(encoded, &latent_dims)?;
				let noise = scheduler.create_noise(&latent_dims);
				scheduler.scale_noise(timestep, encoded.view(), noise.view())?
			}
			None => scheduler.create_random_sample(&latent_dims)
		};
		let control = match (&options.control_image, controlnet) {
			(Some(image), true) => Some((image, options.control_scale.unwrap_or(1.0))),
			_ => None
		};
		let inputs = LoopInputs {
			prompts: &prompts,
			prior: prior.as_ref(),
			control,
			guidance_scale: options.guidance_scale
		};
		let latent = self.denoise(Stage::Main, scheduler.as_mut(), latent, &inputs, state, token).await?;
		self.sessions.release(&state.plan, Phase::Denoise);

		self.sessions.reconcile(&state.plan, Phase::Decode);
		self.sessions.ensure(Component::VaeDecoder, token, &mut state.loaded).await?;
		let (decoder, optimization) = self.sessions.session_and_optimization(Component::VaeDecoder)?;
		let output = self.codec.decode(decoder, optimization, latent, options.vae_tiling, token).await?;
		self.sessions.release(&state.plan, Phase::Decode);

		state.notify(DiffusionProgress {
			phase: RunPhase::Decode,
			step: 1,
			total_steps: 1,
			timestep: None,
			latent: None
		});
		Ok(output)
	}

	async fn encode_prompts(&mut self, options: &GenerateOptions, guidance: bool, state: &mut RunState<'_>, token: &CancellationToken) -> Result<Arc<PromptResult>> {
		self.sessions.reconcile(&state.plan, Phase::TextEncode);
		if let Some(cached) = self.prompts.cached(&options.prompt, &options.negative_prompt, guidance) {
			return Ok(cached);
		}
		self.sessions.ensure(Component::TextEncoder, token, &mut state.loaded).await?;
		let encoder = self.sessions.get(Component::TextEncoder)?;
		let prompts = self.prompts.encode(encoder, &options.prompt, &options.negative_prompt, guidance, token).await?;
		self.sessions.release(&state.plan, Phase::TextEncode);
		Ok(prompts)
	}

	async fn denoise(
		&mut self,
		stage: Stage,
		scheduler: &mut dyn DiffusionScheduler,
		mut latent: ArrayD<f32>,
		inputs: &LoopInputs<'_>,
		state: &mut RunState<'_>,
		token: &CancellationToken
	) -> Result<ArrayD<f32>> {
		let names = match (stage, &self.config.prior) {
			(Stage::Prior, Some(prior)) => prior.inputs.clone(),
			_ => self.config.unet.inputs.clone()
		};
		let guidance = guidance::is_guidance_enabled(inputs.guidance_scale);
		let uncond = if guidance {
			let hidden = inputs.prompts.uncond.as_ref().ok_or_else(|| DiffusionError::scheduler("guidance enabled without unconditional embeddings"))?;
			Some((hidden, inputs.prompts.uncond_pooled.as_ref()))
		} else {
			None
		};

		let timesteps = scheduler.timesteps()[scheduler.begin_index()..].to_vec();
		let total_steps = (timesteps.len() + scheduler.order() - 1) / scheduler.order();
		let mut completed = 0;
		for timestep in timesteps {
			token.check()?;
			trace!(?stage, timestep, "evaluating");

			let sample = scheduler.scale_input(timestep, latent.view())?;
			let cond = self
				.predict(stage, &names, &sample, timestep, (&inputs.prompts.cond, inputs.prompts.cond_pooled.as_ref()), inputs, state, token)
				.await?;
			let prediction = match uncond {
				Some(embeddings) => {
					let uncond = self.predict(stage, &names, &sample, timestep, embeddings, inputs, state, token).await?;
					guidance::combine(cond.view(), uncond.view(), inputs.guidance_scale)?
				}
				None => cond
			};

			let output = scheduler.step(timestep, prediction.view(), latent.view())?;
			let is_final_order = output.is_final_order();
			latent = output.into_sample();
			if is_final_order {
				completed += 1;
				let latent = state.report_latents.then(|| latent.clone());
				state.notify(DiffusionProgress {
					phase: stage.phase(),
					step: completed,
					total_steps,
					timestep: Some(timestep),
					latent
				});
			}
		}
		Ok(latent)
	}

	/// One forward pass of the stage's model, preceded by the secondary conditioner when it is active.
	#[allow(clippy::too_many_arguments)]
	async fn predict(
		&mut self,
		stage: Stage,
		names: &ModelInputNames,
		sample: &ArrayD<f32>,
		timestep: i64,
		(hidden, pooled): (&ArrayD<f32>, Option<&ArrayD<f32>>),
		inputs: &LoopInputs<'_>,
		state: &mut RunState<'_>,
		token: &CancellationToken
	) -> Result<ArrayD<f32>> {
		let mut model_inputs = SessionInputs::new()
			.with(names.sample.as_str(), sample.clone())
			.with(names.timestep.as_str(), arr1(&[timestep]).into_dyn())
			.with(names.encoder_hidden_states.as_str(), hidden.clone());
		if let Some(pooled) = pooled {
			model_inputs.insert(names.pooled.as_str(), pooled.clone());
		}
		if let Some(prior) = inputs.prior {
			model_inputs.insert(names.prior.as_str(), prior.clone());
		}

		if let (Stage::Main, Some((image, scale)), Some(conditioner)) = (stage, inputs.control, &self.controlnet) {
			let control_inputs = conditioner.inputs(sample, timestep, hidden, image, scale);
			let swap = state.plan.swap_controlnet();
			if swap {
				self.sessions.unload(Component::Denoiser);
				self.sessions.ensure(Component::ControlNet, token, &mut state.loaded).await?;
			}
			let residuals = conditioner.run(self.sessions.get(Component::ControlNet)?, control_inputs, token).await?;
			if swap {
				self.sessions.unload(Component::ControlNet);
				self.sessions.ensure(Component::Denoiser, token, &mut state.loaded).await?;
			}
			SecondaryConditioner::inject(residuals, &mut model_inputs);
		}

		self.sessions.get(stage.component())?.run(model_inputs, token).await?.into_first()
	}
}

/// Repeats a single encoded frame along the frame axis of a video latent. Other sources pass through unchanged.
fn repeat_frames(encoded: ArrayD<f32>, latent_dims: &[usize]) -> Result<ArrayD<f32>> {
	if latent_dims.len() != 5 {
		return Ok(encoded);
	}
	let encoded = if encoded.ndim() == 4 { encoded.insert_axis(Axis(2)) } else { encoded };
	if encoded.ndim() != 5 || encoded.shape()[2] != 1 {
		return Ok(encoded);
	}
	let repeated = encoded.broadcast(IxDyn(latent_dims)).ok_or_else(|| {
		DiffusionError::scheduler(format!("encoded frame {:?} cannot fill a video latent of {latent_dims:?}", encoded.shape()))
	})?;
	Ok(repeated.to_owned())
}

fn check_image(what: &str, image: &ArrayD<f32>, width: usize, height: usize) -> Result<()> {
	let shape = image.shape();
	if shape.len() < 4 || shape[1] != 3 || shape[shape.len() - 2..] != [height, width] {
		return Err(DiffusionError::config(format!("{what} must be [1, 3, {height}, {width}], got {shape:?}")));
	}
	Ok(())
}
