//! The schedule functions, denoted Schedulers in the library take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! * Schedulers define the methodology for iteratively adding noise to an image or for updating a sample based on model
//! outputs.
//!   - adding noise in different manners represent the algorithmic processes to train a diffusion model by adding noise
//!     to images.
//!   - for inference, the scheduler defines how to update a sample based on an output from a pretrained model.
//! * Schedulers are often defined by a noise schedule and an update rule to solve the differential equation
//! solution.
//!
//! Every solver implements [`DiffusionScheduler`] and is selected at runtime through [`SchedulerType`] &
//! [`create_scheduler`]. A scheduler is created for one run with its step count & seed and walks its timesteps with an
//! internal cursor; multi-evaluation solvers (order > 1) report [`SchedulerStepOutput::is_final_order`] only on the
//! evaluation that completes a visible step.

use std::fmt;

use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{util::interpolation::LinearInterpolatorAccelerated, DiffusionError, Result};

cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-lms")] {
		mod lms_discrete;
		pub use self::lms_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-euler")] {
		mod euler_discrete;
		pub use self::euler_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-euler-ancestral")] {
		mod euler_ancestral_discrete;
		pub use self::euler_ancestral_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-ddim")] {
		mod ddim;
		pub use self::ddim::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-ddpm")] {
		mod ddpm;
		pub use self::ddpm::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-dpm-solver")] {
		mod dpm_solver_multistep;
		pub use self::dpm_solver_multistep::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-heun")] {
		mod heun_discrete;
		pub use self::heun_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-kdpm2")] {
		mod kdpm2_discrete;
		pub use self::kdpm2_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-lcm")] {
		mod lcm;
		pub use self::lcm::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-flow-match")] {
		mod flow_match_euler_discrete;
		pub use self::flow_match_euler_discrete::*;
	}
}

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule. **This is the default**, and the schedule Stable Diffusion was trained with.
	ScaledLinear,
	/// Glide cosine schedule.
	SquaredcosCapV2,
	/// Pre-trained betas.
	TrainedBetas(Vec<f32>)
}

impl Default for BetaSchedule {
	fn default() -> Self {
		Self::ScaledLinear
	}
}

/// What the denoising model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionType {
	/// Predicts the noise of the diffusion process.
	Epsilon,
	/// Directly predicts the noisy sample.
	Sample,
	/// Velocity prediction; see section 2.4 of <https://imagen.research.google/video/paper.pdf>.
	VPrediction
}

impl Default for PredictionType {
	fn default() -> Self {
		Self::Epsilon
	}
}

/// How inference timesteps are spread over the training timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestepSpacing {
	/// Evenly spaced from the last training timestep down to 0.
	Linspace,
	/// Integer multiples of `train / steps`, offset by `steps_offset`.
	Leading,
	/// Evenly spaced, counted back from the last training timestep.
	Trailing
}

impl Default for TimestepSpacing {
	fn default() -> Self {
		Self::Linspace
	}
}

/// Variance model used by [`SchedulerType::Ddpm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DDPMVarianceType {
	/// Posterior variance, clamped away from zero. **This is the default.**
	FixedSmall,
	/// Log of the clamped posterior variance.
	FixedSmallLog,
	/// `beta_t`.
	FixedLarge,
	/// Log of `beta_t`.
	FixedLargeLog
}

impl Default for DDPMVarianceType {
	fn default() -> Self {
		Self::FixedSmall
	}
}

/// The solver to use for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerType {
	/// Linear multistep.
	Lms,
	/// Euler discrete.
	Euler,
	/// Euler ancestral discrete.
	EulerAncestral,
	/// Denoising diffusion probabilistic models.
	Ddpm,
	/// Denoising diffusion implicit models.
	Ddim,
	/// DPM-Solver++ multistep.
	DpmSolverMultistep,
	/// Heun's second-order method.
	Heun,
	/// DPM-Solver-2 with Karras' discretization.
	Kdpm2,
	/// Latent consistency models.
	Lcm,
	/// Euler steps along a flow-matching trajectory, with fixed or resolution-dependent shift.
	FlowMatchEuler
}

impl SchedulerType {
	/// Every scheduler type, whether or not it was compiled in.
	pub const ALL: [SchedulerType; 10] = [
		SchedulerType::Lms,
		SchedulerType::Euler,
		SchedulerType::EulerAncestral,
		SchedulerType::Ddpm,
		SchedulerType::Ddim,
		SchedulerType::DpmSolverMultistep,
		SchedulerType::Heun,
		SchedulerType::Kdpm2,
		SchedulerType::Lcm,
		SchedulerType::FlowMatchEuler
	];

	/// Returns `true` if this scheduler's cargo feature is enabled.
	pub fn is_available(&self) -> bool {
		match self {
			SchedulerType::Lms => cfg!(feature = "scheduler-lms"),
			SchedulerType::Euler => cfg!(feature = "scheduler-euler"),
			SchedulerType::EulerAncestral => cfg!(feature = "scheduler-euler-ancestral"),
			SchedulerType::Ddpm => cfg!(feature = "scheduler-ddpm"),
			SchedulerType::Ddim => cfg!(feature = "scheduler-ddim"),
			SchedulerType::DpmSolverMultistep => cfg!(feature = "scheduler-dpm-solver"),
			SchedulerType::Heun => cfg!(feature = "scheduler-heun"),
			SchedulerType::Kdpm2 => cfg!(feature = "scheduler-kdpm2"),
			SchedulerType::Lcm => cfg!(feature = "scheduler-lcm"),
			SchedulerType::FlowMatchEuler => cfg!(feature = "scheduler-flow-match")
		}
	}

	/// Returns `true` for solvers that integrate a flow-matching velocity rather than a noise prediction.
	pub fn is_flow_matching(&self) -> bool {
		matches!(self, SchedulerType::FlowMatchEuler)
	}
}

impl fmt::Display for SchedulerType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			SchedulerType::Lms => "lms",
			SchedulerType::Euler => "euler",
			SchedulerType::EulerAncestral => "euler-ancestral",
			SchedulerType::Ddpm => "ddpm",
			SchedulerType::Ddim => "ddim",
			SchedulerType::DpmSolverMultistep => "dpm-solver-multistep",
			SchedulerType::Heun => "heun",
			SchedulerType::Kdpm2 => "kdpm2",
			SchedulerType::Lcm => "lcm",
			SchedulerType::FlowMatchEuler => "flow-match-euler"
		})
	}
}

/// Noise schedule & solver parameters shared by every scheduler. Parameters a solver does not use are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerOptions {
	/// Number of diffusion steps used to train the model.
	pub num_train_timesteps: usize,
	/// The starting `beta` value of inference.
	pub beta_start: f32,
	/// The final `beta` value.
	pub beta_end: f32,
	/// See [`BetaSchedule`].
	pub beta_schedule: BetaSchedule,
	/// See [`PredictionType`].
	pub prediction_type: PredictionType,
	/// See [`TimestepSpacing`].
	pub timestep_spacing: TimestepSpacing,
	/// Offset added to leading-spaced timesteps.
	pub steps_offset: usize,
	/// Clip the predicted original sample to `[-clip_sample_range, clip_sample_range]` (DDIM, DDPM).
	pub clip_sample: bool,
	/// See `clip_sample`.
	pub clip_sample_range: f32,
	/// Use `alpha_cumprod = 1` for the step after the last timestep instead of the first training alpha (DDIM).
	pub set_alpha_to_one: bool,
	/// Replace the sigma schedule with the one from Karras et al. (2022) (sigma-based solvers).
	pub use_karras_sigmas: bool,
	/// Weight of the stochastic noise added per step (DDIM).
	pub eta: f32,
	/// Amount of stochasticity added per Euler step.
	pub s_churn: f32,
	/// Lower sigma bound for churn.
	pub s_tmin: f32,
	/// Upper sigma bound for churn.
	pub s_tmax: f32,
	/// Scale of the churn noise.
	pub s_noise: f32,
	/// Solver order of multistep methods (DPM-Solver++), 1 to 3.
	pub solver_order: usize,
	/// Use lower-order updates for the final steps (DPM-Solver++).
	pub lower_order_final: bool,
	/// See [`DDPMVarianceType`].
	pub variance_type: DDPMVarianceType,
	/// Fixed shift of the flow-matching sigma schedule.
	pub shift: f32,
	/// Derive the flow-matching shift from the latent sequence length instead of `shift`.
	pub use_dynamic_shifting: bool,
	/// Shift at `base_image_seq_len`.
	pub base_shift: f32,
	/// Shift at `max_image_seq_len`.
	pub max_shift: f32,
	/// Sequence length at which `base_shift` applies.
	pub base_image_seq_len: usize,
	/// Sequence length at which `max_shift` applies.
	pub max_image_seq_len: usize,
	/// Latent sequence length of the run, required for dynamic shifting. Usually filled in by the pipeline.
	pub image_seq_len: Option<usize>,
	/// Number of steps of the distillation schedule (LCM).
	pub original_inference_steps: usize,
	/// Timestep scale of the consistency boundary conditions (LCM).
	pub timestep_scaling: f32
}

impl Default for SchedulerOptions {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012,
			beta_schedule: BetaSchedule::ScaledLinear,
			prediction_type: PredictionType::Epsilon,
			timestep_spacing: TimestepSpacing::Linspace,
			steps_offset: 0,
			clip_sample: false,
			clip_sample_range: 1.0,
			set_alpha_to_one: false,
			use_karras_sigmas: false,
			eta: 0.0,
			s_churn: 0.0,
			s_tmin: 0.0,
			s_tmax: f32::INFINITY,
			s_noise: 1.0,
			solver_order: 2,
			lower_order_final: true,
			variance_type: DDPMVarianceType::FixedSmall,
			shift: 1.0,
			use_dynamic_shifting: false,
			base_shift: 0.5,
			max_shift: 1.15,
			base_image_seq_len: 256,
			max_image_seq_len: 4096,
			image_seq_len: None,
			original_inference_steps: 50,
			timestep_scaling: 10.0
		}
	}
}

/// The output returned by a scheduler's `step` function.
#[derive(Debug, Clone)]
pub struct SchedulerStepOutput {
	pub(crate) sample: ArrayD<f32>,
	pub(crate) pred_original_sample: Option<ArrayD<f32>>,
	pub(crate) is_final_order: bool
}

impl SchedulerStepOutput {
	/// The next sample, to be used as the next model input in the denoising loop.
	pub fn sample(&self) -> ArrayViewD<'_, f32> {
		self.sample.view()
	}

	/// Consumes the output, returning the next sample.
	pub fn into_sample(self) -> ArrayD<f32> {
		self.sample
	}

	/// The predicted denoised sample (`x_0`) based on the model output from the current timestep.
	pub fn pred_original_sample(&self) -> Option<ArrayViewD<'_, f32>> {
		self.pred_original_sample.as_ref().map(|s| s.view())
	}

	/// `true` if this evaluation completed a visible step. Always `true` for single-evaluation solvers.
	pub fn is_final_order(&self) -> bool {
		self.is_final_order
	}
}

/// A scheduler to be used in diffusion pipelines.
pub trait DiffusionScheduler: Send {
	/// Which solver this is.
	fn scheduler_type(&self) -> SchedulerType;

	/// Number of model evaluations per visible step.
	fn order(&self) -> usize {
		1
	}

	/// The timestep of every model evaluation of the run, in order.
	fn timesteps(&self) -> &[i64];

	/// Standard deviation of the initial noise distribution.
	fn init_noise_sigma(&self) -> f32;

	/// Index of the next evaluation into [`DiffusionScheduler::timesteps`].
	fn step_index(&self) -> usize;

	/// Index of the first evaluation of the run.
	fn begin_index(&self) -> usize;

	/// Starts the run at evaluation `index` instead of the first one (image-to-image strength).
	fn set_begin_index(&mut self, index: usize) -> Result<()>;

	/// The seeded generator used for initial latents & ancestral noise.
	fn rng(&mut self) -> &mut StdRng;

	/// Generates a standard normal tensor with the scheduler's seeded generator.
	fn create_noise(&mut self, dims: &[usize]) -> ArrayD<f32> {
		ArrayD::random_using(IxDyn(dims), StandardNormal, self.rng())
	}

	/// Generates the initial latent: standard normal noise scaled by [`DiffusionScheduler::init_noise_sigma`].
	fn create_random_sample(&mut self, dims: &[usize]) -> ArrayD<f32> {
		let sigma = self.init_noise_sigma();
		self.create_noise(dims) * sigma
	}

	/// Applies the solver's input pre-conditioning for the evaluation at `timestep`.
	fn scale_input(&self, timestep: i64, sample: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>>;

	/// Blends an encoded source with `noise` to the noise level of `timestep`.
	fn scale_noise(&self, timestep: i64, original: ArrayViewD<'_, f32>, noise: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>>;

	/// Consumes one model evaluation & advances the cursor.
	fn step(&mut self, timestep: i64, model_output: ArrayViewD<'_, f32>, sample: ArrayViewD<'_, f32>) -> Result<SchedulerStepOutput>;

	/// Index of the first evaluation belonging to visible step `step`.
	fn begin_index_for_step(&self, step: usize) -> usize {
		step * self.order()
	}
}

/// Creates a scheduler for one run.
///
/// # Errors
/// Returns a configuration error if `kind` was not compiled in or if `options` are invalid for the solver.
pub fn create_scheduler(kind: SchedulerType, options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Box<dyn DiffusionScheduler>> {
	#[allow(unreachable_patterns)]
	Ok(match kind {
		#[cfg(feature = "scheduler-lms")]
		SchedulerType::Lms => Box::new(LMSDiscreteScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-euler")]
		SchedulerType::Euler => Box::new(EulerDiscreteScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-euler-ancestral")]
		SchedulerType::EulerAncestral => Box::new(EulerAncestralDiscreteScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-ddpm")]
		SchedulerType::Ddpm => Box::new(DDPMScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-ddim")]
		SchedulerType::Ddim => Box::new(DDIMScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-dpm-solver")]
		SchedulerType::DpmSolverMultistep => Box::new(DPMSolverMultistepScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-heun")]
		SchedulerType::Heun => Box::new(HeunDiscreteScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-kdpm2")]
		SchedulerType::Kdpm2 => Box::new(KDPM2DiscreteScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-lcm")]
		SchedulerType::Lcm => Box::new(LCMScheduler::new(options, steps, seed)?),
		#[cfg(feature = "scheduler-flow-match")]
		SchedulerType::FlowMatchEuler => Box::new(FlowMatchEulerDiscreteScheduler::new(options, steps, seed)?),
		kind => return Err(DiffusionError::config(format!("scheduler `{kind}` is not available in this build")))
	})
}

/// The timestep cursor shared by every solver.
#[derive(Debug, Clone)]
pub(crate) struct ScheduleCursor {
	timesteps: Vec<i64>,
	step_index: usize,
	begin_index: usize
}

#[allow(dead_code)]
impl ScheduleCursor {
	pub(crate) fn new(timesteps: Vec<i64>) -> Self {
		Self { timesteps, step_index: 0, begin_index: 0 }
	}

	pub(crate) fn timesteps(&self) -> &[i64] {
		&self.timesteps
	}

	pub(crate) fn step_index(&self) -> usize {
		self.step_index
	}

	pub(crate) fn begin_index(&self) -> usize {
		self.begin_index
	}

	pub(crate) fn len(&self) -> usize {
		self.timesteps.len()
	}

	pub(crate) fn is_last(&self) -> bool {
		self.step_index + 1 >= self.timesteps.len()
	}

	pub(crate) fn set_begin_index(&mut self, index: usize) -> Result<()> {
		if index >= self.timesteps.len() {
			return Err(DiffusionError::scheduler(format!("begin index {index} is past the last of {} timesteps", self.timesteps.len())));
		}
		self.begin_index = index;
		self.step_index = index;
		Ok(())
	}

	/// Verifies `timestep` is the next evaluation and returns its index.
	pub(crate) fn current(&self, timestep: i64) -> Result<usize> {
		match self.timesteps.get(self.step_index) {
			Some(&t) if t == timestep => Ok(self.step_index),
			Some(&t) => Err(DiffusionError::scheduler(format!("expected timestep {t} at step {}, got {timestep}", self.step_index))),
			None => Err(DiffusionError::scheduler(format!("stepped past the last of {} timesteps", self.timesteps.len())))
		}
	}

	/// Index of the first evaluation at `timestep`.
	pub(crate) fn position(&self, timestep: i64) -> Result<usize> {
		self.timesteps
			.iter()
			.position(|&t| t == timestep)
			.ok_or_else(|| DiffusionError::scheduler(format!("timestep out of this schedulers bounds: {timestep}")))
	}

	pub(crate) fn advance(&mut self) {
		self.step_index += 1;
	}
}

pub(crate) fn validate_steps(options: &SchedulerOptions, steps: usize) -> Result<()> {
	if steps == 0 {
		return Err(DiffusionError::config("step count must be >0"));
	}
	if steps > options.num_train_timesteps {
		return Err(DiffusionError::config(format!(
			"step count ({steps}) cannot exceed num_train_timesteps ({})",
			options.num_train_timesteps
		)));
	}
	Ok(())
}

/// Builds the training betas for `options`.
pub(crate) fn betas(options: &SchedulerOptions) -> Result<Array1<f32>> {
	let n = options.num_train_timesteps;
	let (beta_start, beta_end) = (options.beta_start, options.beta_end);
	if n == 0 {
		return Err(DiffusionError::config(format!("num_train_timesteps ({n}) must be >0")));
	}
	if !matches!(options.beta_schedule, BetaSchedule::TrainedBetas(_) | BetaSchedule::SquaredcosCapV2) {
		if !beta_start.is_normal() || !beta_end.is_normal() {
			return Err(DiffusionError::config(format!(
				"beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)"
			)));
		}
		if beta_start >= beta_end {
			return Err(DiffusionError::config("beta_start must be < beta_end"));
		}
	}

	Ok(match &options.beta_schedule {
		BetaSchedule::TrainedBetas(betas) => {
			if betas.len() != n {
				return Err(DiffusionError::config(format!("expected {n} trained betas, got {}", betas.len())));
			}
			Array1::from_vec(betas.clone())
		}
		BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, n),
		BetaSchedule::ScaledLinear => {
			let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), n);
			betas.par_map_inplace(|f| *f = f.powi(2));
			betas
		}
		BetaSchedule::SquaredcosCapV2 => {
			let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
			(0..n)
				.map(|i| {
					let t1 = i as f64 / n as f64;
					let t2 = (i + 1) as f64 / n as f64;
					(1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999) as f32
				})
				.collect()
		}
	})
}

pub(crate) fn alphas_cumprod(betas: &Array1<f32>) -> Array1<f32> {
	betas
		.iter()
		.scan(1.0, |prod, beta| {
			*prod *= 1.0 - *beta;
			Some(*prod)
		})
		.collect()
}

/// `sqrt((1 - alpha_cumprod) / alpha_cumprod)` for every training timestep.
pub(crate) fn train_sigmas(alphas_cumprod: &Array1<f32>) -> Array1<f32> {
	let mut sigmas = alphas_cumprod.clone();
	sigmas.par_map_inplace(|f| {
		*f = ((1.0 - *f) / *f).sqrt();
	});
	sigmas
}

/// Inference timesteps as floats in descending order.
pub(crate) fn spaced_timesteps(options: &SchedulerOptions, steps: usize) -> Vec<f32> {
	let n = options.num_train_timesteps;
	match options.timestep_spacing {
		TimestepSpacing::Linspace => Array1::linspace(n as f32 - 1.0, 0.0, steps).to_vec(),
		TimestepSpacing::Leading => {
			let ratio = n / steps;
			(0..steps).rev().map(|i| (i * ratio + options.steps_offset).min(n - 1) as f32).collect()
		}
		TimestepSpacing::Trailing => {
			let ratio = n as f32 / steps as f32;
			(0..steps).map(|i| ((n as f32 - i as f32 * ratio).round() - 1.0).max(0.0)).collect()
		}
	}
}

/// Interpolates training sigmas at fractional timesteps.
pub(crate) fn interpolate_sigmas(train_sigmas: &Array1<f32>, timesteps: &[f32]) -> Vec<f32> {
	let xa = Array1::range(0.0, train_sigmas.len() as f32, 1.0);
	let mut interpolator = LinearInterpolatorAccelerated::new(xa.view(), train_sigmas.view());
	timesteps.iter().map(|t| interpolator.eval(*t)).collect()
}

/// Karras et al. (2022) noise levels between `sigma_max` and `sigma_min`.
pub(crate) fn karras_sigmas(sigma_min: f32, sigma_max: f32, steps: usize) -> Vec<f32> {
	const RHO: f32 = 7.0;
	let min_inv_rho = sigma_min.powf(1.0 / RHO);
	let max_inv_rho = sigma_max.powf(1.0 / RHO);
	Array1::linspace(0.0, 1.0, steps)
		.iter()
		.map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(RHO))
		.collect()
}

/// Maps a noise level back to a fractional training timestep by interpolating in log-sigma space.
pub(crate) fn sigma_to_timestep(train_sigmas: &Array1<f32>, sigma: f32) -> f32 {
	let log_sigma = sigma.max(1e-10).ln();
	let log_sigmas: Vec<f32> = train_sigmas.iter().map(|s| s.ln()).collect();
	let n = log_sigmas.len();
	if n < 2 {
		return 0.0;
	}
	if log_sigma <= log_sigmas[0] {
		return 0.0;
	}
	if log_sigma >= log_sigmas[n - 1] {
		return (n - 1) as f32;
	}
	let high = log_sigmas.iter().position(|&l| l >= log_sigma).unwrap_or(n - 1).max(1);
	let low = high - 1;
	let w = (log_sigmas[high] - log_sigma) / (log_sigmas[high] - log_sigmas[low]);
	(1.0 - w) * high as f32 + w * low as f32
}

/// The noise-level schedule of a sigma-based (k-diffusion style) solver.
pub(crate) struct SigmaSchedule {
	/// Rounded timesteps, one per inference step.
	pub timesteps: Vec<i64>,
	/// Noise levels, one per inference step plus a trailing zero.
	pub sigmas: Vec<f32>,
	pub init_noise_sigma: f32,
	pub train_sigmas: Array1<f32>
}

pub(crate) fn sigma_schedule(options: &SchedulerOptions, steps: usize) -> Result<SigmaSchedule> {
	validate_steps(options, steps)?;
	let alphas_cumprod = alphas_cumprod(&betas(options)?);
	let train_sigmas = train_sigmas(&alphas_cumprod);

	let (timesteps, mut sigmas) = if options.use_karras_sigmas {
		let sigma_min = train_sigmas.iter().copied().fold(f32::INFINITY, f32::min);
		let sigma_max = train_sigmas.iter().copied().fold(0.0, f32::max);
		let sigmas = karras_sigmas(sigma_min, sigma_max, steps);
		let timesteps = sigmas.iter().map(|s| sigma_to_timestep(&train_sigmas, *s)).collect::<Vec<_>>();
		(timesteps, sigmas)
	} else {
		let timesteps = spaced_timesteps(options, steps);
		let sigmas = interpolate_sigmas(&train_sigmas, &timesteps);
		(timesteps, sigmas)
	};
	if sigmas.iter().any(|s| !s.is_finite()) {
		return Err(DiffusionError::config("sigma schedule contains non-finite values"));
	}
	sigmas.push(0.0);

	let max_sigma = sigmas.iter().copied().fold(0.0, f32::max);
	let init_noise_sigma = match options.timestep_spacing {
		TimestepSpacing::Linspace | TimestepSpacing::Trailing => max_sigma,
		TimestepSpacing::Leading => (max_sigma.powi(2) + 1.0).sqrt()
	};

	Ok(SigmaSchedule {
		timesteps: timesteps.iter().map(|t| t.round() as i64).collect(),
		sigmas,
		init_noise_sigma,
		train_sigmas
	})
}

/// Predicted original sample (`x_0`) of a sigma-parameterized model output.
pub(crate) fn sigma_pred_original(
	prediction_type: PredictionType,
	model_output: &ArrayViewD<'_, f32>,
	sample: &ArrayViewD<'_, f32>,
	sigma: f32
) -> ArrayD<f32> {
	match prediction_type {
		PredictionType::Epsilon => sample - &(model_output * sigma),
		PredictionType::VPrediction => {
			let c = sigma.powi(2) + 1.0;
			model_output * (-sigma / c.sqrt()) + sample / c
		}
		PredictionType::Sample => model_output.to_owned()
	}
}

/// Predicted original sample & noise of an alpha-parameterized model output.
pub(crate) fn alpha_pred_original(
	prediction_type: PredictionType,
	model_output: &ArrayViewD<'_, f32>,
	sample: &ArrayViewD<'_, f32>,
	alpha_prod_t: f32
) -> (ArrayD<f32>, ArrayD<f32>) {
	let sqrt_alpha = alpha_prod_t.sqrt();
	let sqrt_beta = (1.0 - alpha_prod_t).sqrt();
	match prediction_type {
		PredictionType::Epsilon => ((sample - &(model_output * sqrt_beta)) / sqrt_alpha, model_output.to_owned()),
		PredictionType::Sample => {
			let x0 = model_output.to_owned();
			let eps = (sample - &(&x0 * sqrt_alpha)) / sqrt_beta;
			(x0, eps)
		}
		PredictionType::VPrediction => (
			sample * sqrt_alpha - model_output * sqrt_beta,
			model_output * sqrt_alpha + sample * sqrt_beta
		)
	}
}

/// Rounded inference timesteps of an alpha-parameterized (DDPM-style) solver.
pub(crate) fn alpha_timesteps(options: &SchedulerOptions, steps: usize) -> Result<Vec<i64>> {
	validate_steps(options, steps)?;
	Ok(spaced_timesteps(options, steps).iter().map(|t| t.round() as i64).collect())
}

/// `alpha_cumprod` at `timestep`, or `final_alpha` for timesteps before the start of the schedule.
pub(crate) fn alpha_at(alphas_cumprod: &Array1<f32>, timestep: i64, final_alpha: f32) -> f32 {
	if timestep >= 0 {
		alphas_cumprod[(timestep as usize).min(alphas_cumprod.len() - 1)]
	} else {
		final_alpha
	}
}

/// Forward diffusion `sqrt(alpha_t) * x_0 + sqrt(1 - alpha_t) * noise`.
pub(crate) fn alpha_scale_noise(
	alphas_cumprod: &Array1<f32>,
	timestep: i64,
	original: ArrayViewD<'_, f32>,
	noise: ArrayViewD<'_, f32>
) -> Result<ArrayD<f32>> {
	check_noise_shapes(&original, &noise)?;
	let alpha_prod = alpha_at(alphas_cumprod, timestep, 1.0);
	Ok(&original * alpha_prod.sqrt() + &noise * (1.0 - alpha_prod).sqrt())
}

pub(crate) fn check_shapes(model_output: &ArrayViewD<'_, f32>, sample: &ArrayViewD<'_, f32>) -> Result<()> {
	if model_output.shape() != sample.shape() {
		return Err(DiffusionError::scheduler(format!(
			"model output shape {:?} does not match sample shape {:?}",
			model_output.shape(),
			sample.shape()
		)));
	}
	Ok(())
}

pub(crate) fn check_noise_shapes(original: &ArrayViewD<'_, f32>, noise: &ArrayViewD<'_, f32>) -> Result<()> {
	if original.shape() != noise.shape() {
		return Err(DiffusionError::scheduler(format!("source shape {:?} does not match noise shape {:?}", original.shape(), noise.shape())));
	}
	Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
	use ndarray::{ArrayD, IxDyn};

	use super::*;

	/// Drives a scheduler through its whole schedule with a constant model output, returning how many evaluations were
	/// final.
	pub(crate) fn drive(scheduler: &mut dyn DiffusionScheduler, dims: &[usize]) -> (usize, ArrayD<f32>) {
		let mut sample = scheduler.create_random_sample(dims);
		let timesteps = scheduler.timesteps().to_vec();
		let mut finals = 0;
		for t in &timesteps[scheduler.begin_index()..] {
			let input = scheduler.scale_input(*t, sample.view()).unwrap();
			let model_output = input.mapv(|v| v * 0.1);
			let out = scheduler.step(*t, model_output.view(), sample.view()).unwrap();
			if out.is_final_order() {
				finals += 1;
			}
			sample = out.into_sample();
		}
		(finals, sample)
	}

	#[test]
	fn test_every_scheduler_reports_one_final_order_per_step() {
		for kind in SchedulerType::ALL.into_iter().filter(SchedulerType::is_available) {
			for steps in [1, 4, 25] {
				let mut scheduler = create_scheduler(kind, &SchedulerOptions::default(), steps, 42).unwrap();
				assert_eq!(scheduler.timesteps().len(), steps * scheduler.order() - (scheduler.order() - 1), "{kind}");
				let (finals, sample) = drive(scheduler.as_mut(), &[1, 4, 8, 8]);
				assert_eq!(finals, steps, "{kind} with {steps} steps");
				assert!(sample.iter().all(|v| v.is_finite()), "{kind} produced non-finite values");
			}
		}
	}

	#[test]
	fn test_single_order_timesteps_strictly_decrease() {
		for kind in SchedulerType::ALL.into_iter().filter(SchedulerType::is_available) {
			let scheduler = create_scheduler(kind, &SchedulerOptions::default(), 30, 0).unwrap();
			if scheduler.order() == 1 {
				let timesteps = scheduler.timesteps();
				assert_eq!(timesteps.len(), 30, "{kind}");
				assert!(timesteps.windows(2).all(|w| w[0] > w[1]), "{kind}: {timesteps:?}");
			}
		}
	}

	#[test]
	fn test_scale_noise_rejects_mismatched_source() {
		for kind in SchedulerType::ALL.into_iter().filter(SchedulerType::is_available) {
			let mut scheduler = create_scheduler(kind, &SchedulerOptions::default(), 10, 0).unwrap();
			let timestep = scheduler.timesteps()[2];
			let noise = scheduler.create_noise(&[1, 4, 3, 8, 8]);
			let source = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 8, 8]));

			let err = scheduler.scale_noise(timestep, source.view(), noise.view()).unwrap_err();
			assert!(matches!(err, DiffusionError::Scheduler(_)), "{kind}: {err}");

			let source = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 3, 8, 8]));
			assert_eq!(scheduler.scale_noise(timestep, source.view(), noise.view()).unwrap().shape(), &[1, 4, 3, 8, 8], "{kind}");
		}
	}

	#[test]
	fn test_random_sample_is_seeded() {
		let mut a = create_scheduler(SchedulerType::Euler, &SchedulerOptions::default(), 10, 7).unwrap();
		let mut b = create_scheduler(SchedulerType::Euler, &SchedulerOptions::default(), 10, 7).unwrap();
		let mut c = create_scheduler(SchedulerType::Euler, &SchedulerOptions::default(), 10, 8).unwrap();
		let dims = [1, 4, 8, 8];
		let sa = a.create_random_sample(&dims);
		assert_eq!(sa, b.create_random_sample(&dims));
		assert_ne!(sa, c.create_random_sample(&dims));
	}

	#[test]
	fn test_step_rejects_out_of_order_timestep() {
		let mut scheduler = create_scheduler(SchedulerType::Euler, &SchedulerOptions::default(), 4, 0).unwrap();
		let sample = ArrayD::zeros(IxDyn(&[1, 4, 2, 2]));
		let wrong = scheduler.timesteps()[1];
		assert!(scheduler.step(wrong, sample.view(), sample.view()).is_err());
	}

	#[test]
	fn test_zero_steps_is_a_configuration_error() {
		let err = create_scheduler(SchedulerType::Ddim, &SchedulerOptions::default(), 0, 0).err().unwrap();
		assert!(matches!(err, DiffusionError::Configuration(_)));
	}

	#[test]
	fn test_invalid_betas() {
		let options = SchedulerOptions {
			beta_start: 0.02,
			beta_end: 0.01,
			..Default::default()
		};
		assert!(betas(&options).is_err());
	}

	#[test]
	fn test_karras_sigmas_are_bounded() {
		let sigmas = karras_sigmas(0.03, 14.6, 10);
		assert!((sigmas[0] - 14.6).abs() < 1e-3);
		assert!((sigmas[9] - 0.03).abs() < 1e-4);
		assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
	}

	#[test]
	fn test_sigma_to_timestep_inverts_interpolation() {
		let options = SchedulerOptions::default();
		let train = train_sigmas(&alphas_cumprod(&betas(&options).unwrap()));
		let sigma = interpolate_sigmas(&train, &[500.0])[0];
		assert!((sigma_to_timestep(&train, sigma) - 500.0).abs() < 0.5);
	}
}
