use ndarray::{Array1, ArrayD, ArrayViewD, Zip};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	check_noise_shapes, check_shapes, validate_steps, DiffusionScheduler, ScheduleCursor, SchedulerOptions, SchedulerStepOutput, SchedulerType
};
use crate::{DiffusionError, Result};

/// Euler integration of a rectified-flow velocity field, as used by Stable Diffusion 3 & Flux.
///
/// The model predicts the velocity `v = noise - x_0`; samples move linearly from `sigma = 1` (pure noise) to
/// `sigma = 0`. The sigma schedule is warped by a fixed `shift`, or by a shift derived from the latent sequence
/// length when `use_dynamic_shifting` is set.
pub struct FlowMatchEulerDiscreteScheduler {
	cursor: ScheduleCursor,
	sigmas: Vec<f32>,
	rng: StdRng
}

impl FlowMatchEulerDiscreteScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if `steps` is invalid, or if dynamic shifting is enabled without
	/// [`SchedulerOptions::image_seq_len`].
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		validate_steps(options, steps)?;
		let n = options.num_train_timesteps as f32;
		let mut sigmas = Array1::linspace(1.0, 1.0 / n, steps).to_vec();

		if options.use_dynamic_shifting {
			let seq_len = options
				.image_seq_len
				.ok_or_else(|| DiffusionError::config("dynamic shifting requires image_seq_len"))?;
			let mu = calculate_shift(options, seq_len);
			sigmas.iter_mut().for_each(|s| *s = time_shift(mu, *s));
		} else {
			let shift = options.shift;
			if !shift.is_normal() || shift < 0.0 {
				return Err(DiffusionError::config(format!("shift ({shift}) must be a positive number")));
			}
			sigmas.iter_mut().for_each(|s| *s = shift * *s / (1.0 + (shift - 1.0) * *s));
		}

		let timesteps = sigmas.iter().map(|s| (s * n).round() as i64).collect();
		sigmas.push(0.0);
		Ok(Self {
			cursor: ScheduleCursor::new(timesteps),
			sigmas,
			rng: StdRng::seed_from_u64(seed)
		})
	}

	/// The noise level of every step, plus a trailing zero.
	pub fn sigmas(&self) -> &[f32] {
		&self.sigmas
	}
}

/// Linearly interpolates the shift exponent between `base_shift` & `max_shift` over the sequence length range.
fn calculate_shift(options: &SchedulerOptions, image_seq_len: usize) -> f32 {
	let (base_len, max_len) = (options.base_image_seq_len as f32, options.max_image_seq_len as f32);
	let m = (options.max_shift - options.base_shift) / (max_len - base_len);
	let b = options.base_shift - m * base_len;
	image_seq_len as f32 * m + b
}

fn time_shift(mu: f32, sigma: f32) -> f32 {
	mu.exp() / (mu.exp() + (1.0 / sigma - 1.0))
}

impl DiffusionScheduler for FlowMatchEulerDiscreteScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::FlowMatchEuler
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
		check_noise_shapes(&original, &noise)?;
		let sigma = self.sigmas[self.cursor.position(timestep)?];
		let mut noisy_samples = original.to_owned();
		Zip::from(&mut noisy_samples).and(&noise).par_for_each(|f, n| {
			*f = sigma * *n + (1.0 - sigma) * *f;
		});
		Ok(noisy_samples)
	}

	fn step(&mut self, timestep: i64, model_output: ArrayViewD<'_, f32>, sample: ArrayViewD<'_, f32>) -> Result<SchedulerStepOutput> {
		check_shapes(&model_output, &sample)?;
		let step_index = self.cursor.current(timestep)?;
		let (sigma, sigma_next) = (self.sigmas[step_index], self.sigmas[step_index + 1]);

		let prev_sample = &sample + &(&model_output * (sigma_next - sigma));
		let pred_original_sample = &sample - &(&model_output * sigma);

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(pred_original_sample),
			is_final_order: true
		})
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{ArrayD, IxDyn};

	use super::FlowMatchEulerDiscreteScheduler;
	use crate::schedulers::{DiffusionScheduler, SchedulerOptions};

	#[test]
	fn test_exact_velocity_recovers_source() {
		let mut scheduler = FlowMatchEulerDiscreteScheduler::new(&SchedulerOptions { shift: 3.0, ..Default::default() }, 8, 0).unwrap();
		let source = ArrayD::from_elem(IxDyn(&[1, 16, 2, 2]), 0.5_f32);
		let noise = ArrayD::from_elem(IxDyn(&[1, 16, 2, 2]), -1.0_f32);
		let velocity = &noise - &source;
		let mut sample = scheduler.scale_noise(scheduler.timesteps()[0], source.view(), noise.view()).unwrap();
		for t in scheduler.timesteps().to_vec() {
			sample = scheduler.step(t, velocity.view(), sample.view()).unwrap().into_sample();
		}
		assert!(sample.iter().all(|v| (v - 0.5).abs() < 1e-4));
	}

	#[test]
	fn test_shift_pushes_sigmas_towards_noise() {
		let plain = FlowMatchEulerDiscreteScheduler::new(&SchedulerOptions::default(), 10, 0).unwrap();
		let shifted = FlowMatchEulerDiscreteScheduler::new(&SchedulerOptions { shift: 3.0, ..Default::default() }, 10, 0).unwrap();
		assert_eq!(plain.sigmas()[0], 1.0);
		for (p, s) in plain.sigmas()[1..10].iter().zip(&shifted.sigmas()[1..10]) {
			assert!(s > p);
		}
	}

	#[test]
	fn test_dynamic_shifting_needs_sequence_length() {
		let options = SchedulerOptions { use_dynamic_shifting: true, ..Default::default() };
		assert!(FlowMatchEulerDiscreteScheduler::new(&options, 10, 0).is_err());
		let options = SchedulerOptions { image_seq_len: Some(4096), ..options };
		let scheduler = FlowMatchEulerDiscreteScheduler::new(&options, 10, 0).unwrap();
		assert!(scheduler.sigmas().windows(2).all(|w| w[0] > w[1]));
	}
}
