use ndarray::{ArrayD, ArrayViewD, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	check_noise_shapes, check_shapes, sigma_pred_original, sigma_schedule, DiffusionScheduler, ScheduleCursor, SchedulerOptions, SchedulerStepOutput,
	SchedulerType
};
use crate::Result;

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
pub struct EulerDiscreteScheduler {
	options: SchedulerOptions,
	cursor: ScheduleCursor,
	sigmas: Vec<f32>,
	init_noise_sigma: f32,
	rng: StdRng
}

impl EulerDiscreteScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if:
	/// - `steps` is 0 or greater than `num_train_timesteps`
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		let schedule = sigma_schedule(options, steps)?;
		Ok(Self {
			options: options.clone(),
			cursor: ScheduleCursor::new(schedule.timesteps),
			sigmas: schedule.sigmas,
			init_noise_sigma: schedule.init_noise_sigma,
			rng: StdRng::seed_from_u64(seed)
		})
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Euler
	}

	fn timesteps(&self) -> &[i64] {
		self.cursor.timesteps()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.init_noise_sigma
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

	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the Euler algorithm.
	fn scale_input(&self, timestep: i64, sample: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
		let sigma = self.sigmas[self.cursor.current(timestep)?];
		Ok(&sample / (sigma.powi(2) + 1.0).sqrt())
	}

	fn scale_noise(&self, timestep: i64, original: ArrayViewD<'_, f32>, noise: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
		check_noise_shapes(&original, &noise)?;
		let sigma = self.sigmas[self.cursor.position(timestep)?];
		let mut noisy_samples = original.to_owned();
		Zip::from(&mut noisy_samples).and(&noise).par_for_each(|f, n| {
			*f += *n * sigma;
		});
		Ok(noisy_samples)
	}

	fn step(&mut self, timestep: i64, model_output: ArrayViewD<'_, f32>, sample: ArrayViewD<'_, f32>) -> Result<SchedulerStepOutput> {
		check_shapes(&model_output, &sample)?;
		let step_index = self.cursor.current(timestep)?;
		let sigma = self.sigmas[step_index];
		let sigma_next = self.sigmas[step_index + 1];

		let SchedulerOptions { s_churn, s_tmin, s_tmax, s_noise, .. } = self.options;
		let gamma = if s_tmin <= sigma && sigma <= s_tmax {
			(s_churn / (self.sigmas.len() as f32 - 1.0)).min(2.0_f32.sqrt() - 1.0)
		} else {
			0.0
		};

		let sigma_hat = sigma * (gamma + 1.0);
		let sample = if gamma > 0.0 {
			let noise = ArrayD::<f32>::random_using(model_output.raw_dim(), StandardNormal, &mut self.rng);
			let eps = noise * s_noise;
			&sample + &(eps * (sigma_hat.powi(2) - sigma.powi(2)).sqrt())
		} else {
			sample.to_owned()
		};

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = sigma_pred_original(self.options.prediction_type, &model_output, &sample.view(), sigma_hat);

		// 2. convert to an ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma_hat;
		let dt = sigma_next - sigma_hat;
		let prev_sample = &sample + &(derivative * dt);

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(pred_original_sample),
			is_final_order: true
		})
	}
}
