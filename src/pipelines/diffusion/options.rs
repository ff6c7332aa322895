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

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{tiling::TileOptions, Component, DiffusionDeviceControl, LowMemoryOptions, ModelOptimization, SchedulerOptions, SchedulerType};

/// How aggressively a pipeline trades reload latency for memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMode {
	/// Keep every model resident between phases & runs.
	#[default]
	Maximum,
	/// Unload every model as soon as its phase completes.
	Minimum
}

impl MemoryMode {
	/// The low-memory flags this mode implies.
	pub fn low_memory(&self) -> LowMemoryOptions {
		match self {
			MemoryMode::Maximum => LowMemoryOptions::default(),
			MemoryMode::Minimum => LowMemoryOptions::all()
		}
	}
}

/// Options for a [`super::DiffusionPipeline`]: device placement, memory mode & per-model optimization profiles.
#[derive(Default, Debug, Clone)]
pub struct PipelineOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl,
	/// Default residency policy of runs that don't override it.
	pub memory_mode: MemoryMode,
	/// Optimization profile each model is loaded with.
	pub optimizations: BTreeMap<Component, ModelOptimization>
}

impl PipelineOptions {
	/// Places models according to `devices`.
	pub fn with_devices(mut self, devices: DiffusionDeviceControl) -> Self {
		self.devices = devices;
		self
	}

	/// Sets the memory mode.
	pub fn with_memory_mode(mut self, memory_mode: MemoryMode) -> Self {
		self.memory_mode = memory_mode;
		self
	}

	/// Loads `component` with the given optimization profile.
	pub fn with_optimization(mut self, component: Component, optimization: ModelOptimization) -> Self {
		self.optimizations.insert(component, optimization);
		self
	}
}

/// Options for one run of a [`super::DiffusionPipeline`].
///
/// Image tensors are `[1, 3, height, width]` in `[-1, 1]`; see [`crate::util::image_to_tensor`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
	/// The prompt.
	pub prompt: String,
	/// The negative prompt, used for the unconditional pass when guidance is enabled.
	pub negative_prompt: String,
	/// Seed of the initial noise; a random seed is drawn when `None`.
	pub seed: Option<u64>,
	/// Output width, rounded down to a multiple of the VAE scale factor.
	pub width: u32,
	/// Output height, rounded down to a multiple of the VAE scale factor.
	pub height: u32,
	/// Output frames of video families.
	pub frames: usize,
	/// Steps of the main denoising loop.
	pub steps: usize,
	/// Guidance scale of the main loop.
	pub guidance_scale: f32,
	/// Steps of the prior loop of cascaded families.
	pub prior_steps: usize,
	/// Guidance scale of the prior loop.
	pub prior_guidance_scale: f32,
	/// Solver of the main loop. The prior loop of cascaded families uses the same solver.
	pub scheduler: SchedulerType,
	/// Overrides the pipeline's noise schedule.
	pub scheduler_options: Option<SchedulerOptions>,
	/// Source image for image-to-image.
	pub input_image: Option<ArrayD<f32>>,
	/// Fraction of the schedule applied to `input_image`; `1` discards the source entirely.
	pub strength: f32,
	/// Conditioning image for the secondary conditioner.
	pub control_image: Option<ArrayD<f32>>,
	/// Weight of the secondary conditioner's residuals. Setting it requests secondary conditioning.
	pub control_scale: Option<f32>,
	/// Overrides the pipeline's memory mode for this run.
	pub low_memory: Option<LowMemoryOptions>,
	/// Overrides the pipeline's optimization profiles for this run.
	pub optimizations: BTreeMap<Component, ModelOptimization>,
	/// Decode in tiles of at most this many latent pixels.
	pub vae_tiling: Option<TileOptions>,
	/// Attach a copy of the latent to each step's progress notification.
	pub report_latents: bool
}

impl Default for GenerateOptions {
	fn default() -> Self {
		Self {
			prompt: String::new(),
			negative_prompt: String::new(),
			seed: None,
			width: 512,
			height: 512,
			frames: 1,
			steps: 25,
			guidance_scale: 7.5,
			prior_steps: 20,
			prior_guidance_scale: 4.0,
			scheduler: SchedulerType::Euler,
			scheduler_options: None,
			input_image: None,
			strength: 0.8,
			control_image: None,
			control_scale: None,
			low_memory: None,
			optimizations: BTreeMap::new(),
			vae_tiling: None,
			report_latents: false
		}
	}
}

// builder for options
impl GenerateOptions {
	/// Set the prompt.
	pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
		self.prompt = prompt.into();
		self
	}
	/// Set the negative prompt.
	pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
		self.negative_prompt = negative_prompt.into();
		self
	}
	/// Set the seed to use when first generating noise.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// Set the size of the output.
	pub fn with_size(mut self, width: u32, height: u32) -> Self {
		self.width = width;
		self.height = height;
		self
	}
	/// Set the number of frames (video families).
	pub fn with_frames(mut self, frames: usize) -> Self {
		self.frames = frames;
		self
	}
	/// The number of steps to take. More steps typically yields higher quality output.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. Scales of `1` or below skip the unconditional pass.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// Steps & guidance scale of the prior loop of cascaded families.
	pub fn with_prior(mut self, steps: usize, guidance_scale: f32) -> Self {
		self.prior_steps = steps;
		self.prior_guidance_scale = guidance_scale;
		self
	}
	/// Select the solver.
	pub fn with_scheduler(mut self, scheduler: SchedulerType) -> Self {
		self.scheduler = scheduler;
		self
	}
	/// Override the pipeline's noise schedule.
	pub fn with_scheduler_options(mut self, options: SchedulerOptions) -> Self {
		self.scheduler_options = Some(options);
		self
	}
	/// Start from an encoded source image instead of pure noise.
	pub fn with_input_image(mut self, image: ArrayD<f32>, strength: f32) -> Self {
		self.input_image = Some(image);
		self.strength = strength;
		self
	}
	/// Condition the primary model on `image` through the secondary conditioner.
	pub fn with_controlnet(mut self, image: ArrayD<f32>, scale: f32) -> Self {
		self.control_image = Some(image);
		self.control_scale = Some(scale);
		self
	}
	/// Override the pipeline's memory mode for this run.
	pub fn with_low_memory(mut self, low_memory: LowMemoryOptions) -> Self {
		self.low_memory = Some(low_memory);
		self
	}
	/// Load `component` with the given optimization profile for this run.
	pub fn with_optimization(mut self, component: Component, optimization: ModelOptimization) -> Self {
		self.optimizations.insert(component, optimization);
		self
	}
	/// Decode in tiles.
	pub fn with_vae_tiling(mut self, tiling: TileOptions) -> Self {
		self.vae_tiling = Some(tiling);
		self
	}
	/// Attach the latent to each step's progress notification.
	pub fn with_latent_reporting(mut self, report: bool) -> Self {
		self.report_latents = report;
		self
	}
}
