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

use ndarray::ArrayD;

mod impl_generate;
mod impl_main;
mod options;

pub use self::impl_main::DiffusionPipeline;
pub use self::options::{GenerateOptions, MemoryMode, PipelineOptions};

/// The stage a progress notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
	/// A step of the prior loop of a cascaded family.
	Prior,
	/// A step of the main denoising loop.
	Denoise,
	/// The final latent was decoded. Always the last notification of a run.
	Decode
}

/// A progress notification, emitted once per completed step and once after decoding.
#[derive(Debug, Clone)]
pub struct DiffusionProgress {
	/// Which loop the step belongs to.
	pub phase: RunPhase,
	/// 1-based index of the completed step within its loop.
	pub step: usize,
	/// Number of steps the loop will complete.
	pub total_steps: usize,
	/// Timestep of the evaluation that completed the step. `None` for [`RunPhase::Decode`].
	pub timestep: Option<i64>,
	/// Copy of the latent after the step, if step-latent reporting was requested.
	pub latent: Option<ArrayD<f32>>
}

/// Receives progress notifications during a run.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(DiffusionProgress) + Send);
