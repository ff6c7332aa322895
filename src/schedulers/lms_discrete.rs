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
use rand::{rngs::StdRng, SeedableRng};

use super::{
	check_noise_shapes, check_shapes, sigma_pred_original, sigma_schedule, DiffusionScheduler, PredictionType, ScheduleCursor, SchedulerOptions,
	SchedulerStepOutput, SchedulerType
};
use crate::{util::quadrature::gauss_legendre, Result};

const LMS_ORDER: usize = 4;

/// A linear multistep scheduler for discrete beta schedules. Based on the original [`k-diffusion` implementation by
/// Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L181
pub struct LMSDiscreteScheduler {
	prediction_type: PredictionType,
	cursor: ScheduleCursor,
	sigmas: Vec<f32>,
	init_noise_sigma: f32,
	derivatives: Vec<ArrayD<f32>>,
	rng: StdRng
}

impl LMSDiscreteScheduler {
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
			derivatives: Vec::with_capacity(LMS_ORDER),
			rng: StdRng::seed_from_u64(seed)
		})
	}

	/// Compute a linear multistep coefficient.
	///
	/// The integrand is the Lagrange basis polynomial through the last `order` sigmas, integrated from `sigmas[t]` to
	/// `sigmas[t + 1]`. `t` must be greater than or equal to `current_order`.
	pub fn get_lms_coefficient(&self, order: usize, t: usize, current_order: usize) -> f32 {
		let sigmas = &self.sigmas;
		let basis = |tau: f64| {
			let mut prod = 1.0_f64;
			for k in 0..order {
				if k == current_order {
					continue;
				}
				prod *= (tau - f64::from(sigmas[t - k])) / f64::from(sigmas[t - current_order] - sigmas[t - k]);
			}
			prod
		};
		gauss_legendre(basis, f64::from(sigmas[t]), f64::from(sigmas[t + 1]), 1) as f32
	}
}

impl DiffusionScheduler for LMSDiscreteScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Lms
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
		self.derivatives.clear();
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
		let sigma = self.sigmas[step_index];

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = sigma_pred_original(self.prediction_type, &model_output, &sample, sigma);

		// 2. convert to an ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma;
		self.derivatives.push(derivative);
		if self.derivatives.len() > LMS_ORDER {
			self.derivatives.remove(0);
		}

		// 3. compute linear multistep coefficients
		let order = self.derivatives.len().min(step_index - self.cursor.begin_index() + 1);
		let lms_coeffs: Vec<f32> = (0..order).map(|o| self.get_lms_coefficient(order, step_index, o)).collect();

		// 4. compute previous sample based on the derivatives path
		let mut prev_sample = sample.to_owned();
		for (coeff, derivative) in lms_coeffs.iter().zip(self.derivatives.iter().rev()) {
			prev_sample.scaled_add(*coeff, derivative);
		}

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(pred_original_sample),
			is_final_order: true
		})
	}
}
