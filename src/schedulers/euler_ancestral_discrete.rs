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

use ndarray::{ArrayD, ArrayViewD, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	check_noise_shapes, check_shapes, sigma_pred_original, sigma_schedule, DiffusionScheduler, PredictionType, ScheduleCursor, SchedulerOptions,
	SchedulerStepOutput, SchedulerType
};
use crate::Result;

/// Ancestral sampling with Euler method steps.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
pub struct EulerAncestralDiscreteScheduler {
	prediction_type: PredictionType,
	cursor: ScheduleCursor,
	sigmas: Vec<f32>,
	init_noise_sigma: f32,
	rng: StdRng
}

impl EulerAncestralDiscreteScheduler {
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
			prediction_type: options.prediction_type,
			cursor: ScheduleCursor::new(schedule.timesteps),
			sigmas: schedule.sigmas,
			init_noise_sigma: schedule.init_noise_sigma,
			rng: StdRng::seed_from_u64(seed)
		})
	}
}

impl DiffusionScheduler for EulerAncestralDiscreteScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::EulerAncestral
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

	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the K-LMS algorithm.
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
		let sigma_from = self.sigmas[step_index];
		let sigma_to = self.sigmas[step_index + 1];

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = sigma_pred_original(self.prediction_type, &model_output, &sample, sigma_from);
		let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
		let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

		// 2. convert to a ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma_from;
		let dt = sigma_down - sigma_from;
		let prev_sample = &sample + &(derivative * dt);

		let noise = ArrayD::<f32>::random_using(model_output.raw_dim(), StandardNormal, &mut self.rng);
		let prev_sample = prev_sample + noise * sigma_up;

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
	use super::EulerAncestralDiscreteScheduler;
	use crate::schedulers::{tests::drive, DiffusionScheduler, SchedulerOptions};

	#[test]
	fn test_ancestral_noise_is_seeded() {
		let mut a = EulerAncestralDiscreteScheduler::new(&SchedulerOptions::default(), 8, 3).unwrap();
		let mut b = EulerAncestralDiscreteScheduler::new(&SchedulerOptions::default(), 8, 3).unwrap();
		assert_eq!(drive(&mut a, &[1, 4, 4, 4]).1, drive(&mut b, &[1, 4, 4, 4]).1);
	}

	#[test]
	fn test_last_step_adds_no_noise() {
		let scheduler = EulerAncestralDiscreteScheduler::new(&SchedulerOptions::default(), 5, 0).unwrap();
		assert_eq!(*scheduler.sigmas.last().unwrap(), 0.0);
		assert_eq!(scheduler.timesteps().len(), 5);
	}
}
