use ndarray::{Array1, ArrayD, ArrayViewD};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	alpha_at, alpha_pred_original, alpha_scale_noise, alphas_cumprod, betas, check_shapes, validate_steps, DiffusionScheduler,
	ScheduleCursor, SchedulerOptions, SchedulerStepOutput, SchedulerType
};
use crate::{DiffusionError, Result};

const SIGMA_DATA: f32 = 0.5;

/// Multistep sampling for [latent consistency models](https://arxiv.org/abs/2310.04378).
///
/// Timesteps are a subset of the distillation schedule of `original_inference_steps` steps. Each step maps the sample
/// straight to a denoised estimate through the consistency boundary conditions, then re-noises it to the next
/// timestep.
pub struct LCMScheduler {
	options: SchedulerOptions,
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	cursor: ScheduleCursor,
	rng: StdRng
}

impl LCMScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if `steps` is invalid, exceeds `original_inference_steps`, or the beta schedule cannot be built.
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		validate_steps(options, steps)?;
		let origin_steps = options.original_inference_steps;
		if origin_steps == 0 || origin_steps > options.num_train_timesteps {
			return Err(DiffusionError::config(format!("original_inference_steps ({origin_steps}) must be in 1..={}", options.num_train_timesteps)));
		}
		if steps > origin_steps {
			return Err(DiffusionError::config(format!("step count ({steps}) cannot exceed original_inference_steps ({origin_steps})")));
		}

		// LCM training timesteps, then skip evenly through them from the end
		let c = options.num_train_timesteps / origin_steps;
		let origin_timesteps: Vec<i64> = (1..=origin_steps).map(|i| (i * c) as i64 - 1).collect();
		let skipping_step = origin_steps / steps;
		let timesteps: Vec<i64> = origin_timesteps.iter().rev().step_by(skipping_step).take(steps).copied().collect();

		let alphas_cumprod = alphas_cumprod(&betas(options)?);
		let final_alpha_cumprod = if options.set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };
		Ok(Self {
			options: options.clone(),
			alphas_cumprod,
			final_alpha_cumprod,
			cursor: ScheduleCursor::new(timesteps),
			rng: StdRng::seed_from_u64(seed)
		})
	}

	/// Returns `(c_skip, c_out)` of the consistency boundary conditions at `timestep`.
	pub fn boundary_condition_scalings(&self, timestep: i64) -> (f32, f32) {
		let scaled_timestep = timestep as f32 * self.options.timestep_scaling;
		let denom = scaled_timestep.powi(2) + SIGMA_DATA.powi(2);
		(SIGMA_DATA.powi(2) / denom, scaled_timestep / denom.sqrt())
	}
}

impl DiffusionScheduler for LCMScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Lcm
	}

	fn timesteps(&self) -> &[i64] {
		self.cursor.timesteps()
	}

	fn init_noise_sigma(&self) -> f32 {
		1.0
	}

	fn step_index(&self) -> usize {
		self.cursor.step_index()
	}

	fn begin_index(&self) -> usize {
		self.cursor.begin_index()
	}

	fn set_begin_index(&mut self, index: usize) -> Result<()> {
		self.cursor.set_begin_index(index)
	}

	fn rng(&mut self) -> &mut StdRng {
		&mut self.rng
	}

	fn scale_input(&self, timestep: i64, sample: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
		self.cursor.current(timestep)?;
		Ok(sample.to_owned())
	}

	fn scale_noise(&self, timestep: i64, original: ArrayViewD<'_, f32>, noise: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
		alpha_scale_noise(&self.alphas_cumprod, timestep, original, noise)
	}

	fn step(&mut self, timestep: i64, model_output: ArrayViewD<'_, f32>, sample: ArrayViewD<'_, f32>) -> Result<SchedulerStepOutput> {
		check_shapes(&model_output, &sample)?;
		let step_index = self.cursor.current(timestep)?;
		let is_last = self.cursor.is_last();
		let prev_timestep = if is_last { timestep } else { self.cursor.timesteps()[step_index + 1] };

		let alpha_prod_t = alpha_at(&self.alphas_cumprod, timestep, self.final_alpha_cumprod);
		let alpha_prod_t_prev = alpha_at(&self.alphas_cumprod, prev_timestep, self.final_alpha_cumprod);

		let (c_skip, c_out) = self.boundary_condition_scalings(timestep);
		let (pred_original_sample, _) = alpha_pred_original(self.options.prediction_type, &model_output, &sample, alpha_prod_t);
		let mut denoised = pred_original_sample * c_out + &sample * c_skip;
		if self.options.clip_sample {
			let range = self.options.clip_sample_range;
			denoised.mapv_inplace(|f| f.clamp(-range, range));
		}

		let prev_sample = if is_last {
			denoised.clone()
		} else {
			let noise = ArrayD::<f32>::random_using(model_output.raw_dim(), StandardNormal, &mut self.rng);
			&denoised * alpha_prod_t_prev.sqrt() + noise * (1.0 - alpha_prod_t_prev).sqrt()
		};

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(denoised),
			is_final_order: true
		})
	}
}
