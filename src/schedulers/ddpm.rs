use ndarray::{Array1, ArrayD, ArrayViewD};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	alpha_at, alpha_pred_original, alpha_scale_noise, alpha_timesteps, alphas_cumprod, betas, check_shapes, DDPMVarianceType,
	DiffusionScheduler, ScheduleCursor, SchedulerOptions, SchedulerStepOutput, SchedulerType
};
use crate::Result;

/// [Denoising diffusion probabilistic models](https://arxiv.org/abs/2006.11239) (DDPMs) explores the connections
/// between denoising score matching and Langevin dynamics sampling.
pub struct DDPMScheduler {
	options: SchedulerOptions,
	alphas_cumprod: Array1<f32>,
	cursor: ScheduleCursor,
	rng: StdRng
}

impl DDPMScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if `steps` is invalid or the beta schedule cannot be built.
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		Ok(Self {
			options: options.clone(),
			alphas_cumprod: alphas_cumprod(&betas(options)?),
			cursor: ScheduleCursor::new(alpha_timesteps(options, steps)?),
			rng: StdRng::seed_from_u64(seed)
		})
	}

	fn prev_timestep(&self, step_index: usize) -> i64 {
		self.cursor.timesteps().get(step_index + 1).copied().unwrap_or(-1)
	}

	fn get_variance(&self, timestep: i64, prev_timestep: i64) -> f32 {
		let alpha_prod_t = alpha_at(&self.alphas_cumprod, timestep, 1.0);
		let alpha_prod_t_prev = alpha_at(&self.alphas_cumprod, prev_timestep, 1.0);
		let current_beta_t = 1.0 - alpha_prod_t / alpha_prod_t_prev;

		// for t > 0, compute predicted variance βt (see formula (6) and (7) from https://arxiv.org/pdf/2006.11239.pdf)
		// and sample from it to get previous sample
		// x_{t-1} ~ N(pred_prev_sample, variance) == add variance to pred_sample
		let variance = ((1.0 - alpha_prod_t_prev) / (1.0 - alpha_prod_t) * current_beta_t).max(1e-20);

		match self.options.variance_type {
			DDPMVarianceType::FixedSmall => variance,
			// for rl-diffuser https://arxiv.org/abs/2205.09991
			DDPMVarianceType::FixedSmallLog => (0.5 * variance.ln()).exp().powi(2),
			DDPMVarianceType::FixedLarge => current_beta_t,
			DDPMVarianceType::FixedLargeLog => current_beta_t.ln().exp()
		}
	}
}

impl DiffusionScheduler for DDPMScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Ddpm
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
		let prev_timestep = self.prev_timestep(step_index);

		// 1. compute alphas, betas
		let alpha_prod_t = alpha_at(&self.alphas_cumprod, timestep, 1.0);
		let alpha_prod_t_prev = alpha_at(&self.alphas_cumprod, prev_timestep, 1.0);
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;
		let current_alpha_t = alpha_prod_t / alpha_prod_t_prev;
		let current_beta_t = 1.0 - current_alpha_t;

		// 2. compute predicted original sample from predicted noise also called "predicted x_0" of formula (15)
		let (mut pred_original_sample, _) = alpha_pred_original(self.options.prediction_type, &model_output, &sample, alpha_prod_t);

		// 3. clip predicted x_0
		if self.options.clip_sample {
			let range = self.options.clip_sample_range;
			pred_original_sample.mapv_inplace(|f| f.clamp(-range, range));
		}

		// 4. compute coefficients for pred_original_sample x_0 and current sample x_t (formula 7)
		let pred_original_sample_coeff = (alpha_prod_t_prev.sqrt() * current_beta_t) / beta_prod_t;
		let current_sample_coeff = current_alpha_t.sqrt() * beta_prod_t_prev / beta_prod_t;

		// 5. compute predicted previous sample µ_t (formula 7)
		let mut prev_sample = &pred_original_sample * pred_original_sample_coeff + &sample * current_sample_coeff;

		// 6. add noise
		if prev_timestep >= 0 {
			let variance_noise = ArrayD::<f32>::random_using(model_output.raw_dim(), StandardNormal, &mut self.rng);
			prev_sample = prev_sample + variance_noise * self.get_variance(timestep, prev_timestep).sqrt();
		}

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(pred_original_sample),
			is_final_order: true
		})
	}
}
