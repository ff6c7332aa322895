use ndarray::{Array1, ArrayD, ArrayViewD};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	alpha_at, alpha_pred_original, alpha_scale_noise, alpha_timesteps, alphas_cumprod, betas, check_shapes, DiffusionScheduler,
	ScheduleCursor, SchedulerOptions, SchedulerStepOutput, SchedulerType
};
use crate::Result;

/// [Denoising diffusion implicit models](https://arxiv.org/abs/2010.02502) is a scheduler that extends the denoising
/// procedure introduced in denoising diffusion probabilistic models (DDPMs) with non-Markovian guidance.
///
/// With `eta = 0` (the default) sampling is deterministic; `eta = 1` recovers DDPM-like ancestral noise.
pub struct DDIMScheduler {
	options: SchedulerOptions,
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	cursor: ScheduleCursor,
	rng: StdRng
}

impl DDIMScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if `steps` is invalid or the beta schedule cannot be built.
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		let alphas_cumprod = alphas_cumprod(&betas(options)?);
		// at every step in ddim, we are looking into the previous alphas_cumprod. for the final step, there is no
		// previous alphas_cumprod because we are already at 0. `set_alpha_to_one` decides whether we set this
		// parameter simply to one or whether we use the final alpha of the "non-previous" one.
		let final_alpha_cumprod = if options.set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };
		Ok(Self {
			options: options.clone(),
			alphas_cumprod,
			final_alpha_cumprod,
			cursor: ScheduleCursor::new(alpha_timesteps(options, steps)?),
			rng: StdRng::seed_from_u64(seed)
		})
	}

	fn prev_timestep(&self, step_index: usize) -> i64 {
		self.cursor.timesteps().get(step_index + 1).copied().unwrap_or(-1)
	}

	fn get_variance(&self, timestep: i64, prev_timestep: i64) -> f32 {
		let alpha_prod_t = alpha_at(&self.alphas_cumprod, timestep, self.final_alpha_cumprod);
		let alpha_prod_t_prev = alpha_at(&self.alphas_cumprod, prev_timestep, self.final_alpha_cumprod);
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		(beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev)
	}
}

impl DiffusionScheduler for DDIMScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Ddim
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

		// 1. get previous step value (=t-1)
		let prev_timestep = self.prev_timestep(step_index);

		// 2. compute alphas, betas
		let alpha_prod_t = alpha_at(&self.alphas_cumprod, timestep, self.final_alpha_cumprod);
		let alpha_prod_t_prev = alpha_at(&self.alphas_cumprod, prev_timestep, self.final_alpha_cumprod);
		let beta_prod_t = 1.0 - alpha_prod_t;

		// 3. compute predicted original sample from predicted noise - also called "predicted x_0" of formula (12)
		let (mut pred_original_sample, mut pred_epsilon) = alpha_pred_original(self.options.prediction_type, &model_output, &sample, alpha_prod_t);

		// 4. clip predicted x_0
		if self.options.clip_sample {
			let range = self.options.clip_sample_range;
			pred_original_sample.mapv_inplace(|f| f.clamp(-range, range));
			// re-derive the noise from the clipped x_0, as in Glide
			pred_epsilon = (&sample - &(&pred_original_sample * alpha_prod_t.sqrt())) / beta_prod_t.sqrt();
		}

		// 5. compute variance: "sigma_t(η)" -> see formula (16)
		// σ_t = sqrt((1 − α_t−1)/(1 − α_t)) * sqrt(1 − α_t/α_t−1)
		let eta = self.options.eta;
		let variance = self.get_variance(timestep, prev_timestep);
		let std_dev_t = eta * variance.sqrt();

		// 6. compute direction pointing to x_t of formula (12)
		let pred_sample_direction = pred_epsilon * (1.0 - alpha_prod_t_prev - std_dev_t.powi(2)).max(0.0).sqrt();

		// 7. compute x_t without random noise of formula (12)
		let mut prev_sample = &pred_original_sample * alpha_prod_t_prev.sqrt() + pred_sample_direction;

		if eta > 0.0 {
			let variance_noise = ArrayD::<f32>::random_using(model_output.raw_dim(), StandardNormal, &mut self.rng);
			prev_sample = prev_sample + variance_noise * std_dev_t;
		}

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(pred_original_sample),
			is_final_order: true
		})
	}
}
