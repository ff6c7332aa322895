use ndarray::{ArrayD, ArrayViewD, Zip};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	check_noise_shapes, check_shapes, sigma_pred_original, sigma_schedule, sigma_to_timestep, DiffusionScheduler, PredictionType, ScheduleCursor,
	SchedulerOptions, SchedulerStepOutput, SchedulerType
};
use crate::{DiffusionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kdpm2Eval {
	First(usize),
	Midpoint(usize)
}

/// DPM-Solver-2 (Algorithm 2 of [Karras et al. (2022)](https://arxiv.org/abs/2206.00364)), inspired by the
/// [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// Each step evaluates the model at its noise level & again at the log-space midpoint towards the next level; the
/// final step to `sigma = 0` is a single Euler evaluation.
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/5b3af030dd83e0297272d861c19477735d0317ec/k_diffusion/sampling.py#L188
pub struct KDPM2DiscreteScheduler {
	prediction_type: PredictionType,
	cursor: ScheduleCursor,
	evals: Vec<Kdpm2Eval>,
	sigmas: Vec<f32>,
	sigmas_interpol: Vec<f32>,
	init_noise_sigma: f32,
	sample: Option<ArrayD<f32>>,
	rng: StdRng
}

impl KDPM2DiscreteScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if `steps` is invalid or the beta schedule cannot be built.
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		let schedule = sigma_schedule(options, steps)?;
		let sigmas_interpol: Vec<f32> = schedule.sigmas.windows(2).map(|w| ((w[0].ln() + w[1].max(1e-10).ln()) / 2.0).exp()).collect();

		let mut timesteps = Vec::with_capacity(steps * 2 - 1);
		let mut evals = Vec::with_capacity(steps * 2 - 1);
		for i in 0..steps {
			timesteps.push(schedule.timesteps[i]);
			evals.push(Kdpm2Eval::First(i));
			if i + 1 < steps {
				timesteps.push(sigma_to_timestep(&schedule.train_sigmas, sigmas_interpol[i]).round() as i64);
				evals.push(Kdpm2Eval::Midpoint(i));
			}
		}

		Ok(Self {
			prediction_type: options.prediction_type,
			cursor: ScheduleCursor::new(timesteps),
			evals,
			sigmas: schedule.sigmas,
			sigmas_interpol,
			init_noise_sigma: schedule.init_noise_sigma,
			sample: None,
			rng: StdRng::seed_from_u64(seed)
		})
	}

	fn eval_sigma(&self, index: usize) -> f32 {
		match self.evals[index] {
			Kdpm2Eval::First(i) => self.sigmas[i],
			Kdpm2Eval::Midpoint(i) => self.sigmas_interpol[i]
		}
	}
}

impl DiffusionScheduler for KDPM2DiscreteScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Kdpm2
	}

	fn order(&self) -> usize {
		2
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
		if matches!(self.evals.get(index), Some(Kdpm2Eval::Midpoint(_))) {
			return Err(DiffusionError::scheduler(format!("evaluation {index} is the middle of a step")));
		}
		self.sample = None;
		self.cursor.set_begin_index(index)
	}

	fn rng(&mut self) -> &mut StdRng {
		&mut self.rng
	}

	fn scale_input(&self, timestep: i64, sample: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
		let sigma = self.eval_sigma(self.cursor.current(timestep)?);
		Ok(&sample / (sigma.powi(2) + 1.0).sqrt())
	}

	fn scale_noise(&self, timestep: i64, original: ArrayViewD<'_, f32>, noise: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
		check_noise_shapes(&original, &noise)?;
		let sigma = self.eval_sigma(self.cursor.position(timestep)?);
		let mut noisy_samples = original.to_owned();
		Zip::from(&mut noisy_samples).and(&noise).par_for_each(|f, n| {
			*f += *n * sigma;
		});
		Ok(noisy_samples)
	}

	fn step(&mut self, timestep: i64, model_output: ArrayViewD<'_, f32>, sample: ArrayViewD<'_, f32>) -> Result<SchedulerStepOutput> {
		check_shapes(&model_output, &sample)?;
		let index = self.cursor.current(timestep)?;
		let sigma = self.eval_sigma(index);

		let pred_original_sample = sigma_pred_original(self.prediction_type, &model_output, &sample, sigma);
		let derivative = (&sample - &pred_original_sample) / sigma;

		let (prev_sample, is_final_order) = match self.evals[index] {
			Kdpm2Eval::First(i) if self.sigmas[i + 1] == 0.0 => (&sample + &(derivative * -sigma), true),
			Kdpm2Eval::First(i) => {
				// DPM-Solver-2: step to the midpoint, then take the full step with the midpoint derivative
				let dt = self.sigmas_interpol[i] - sigma;
				self.sample = Some(sample.to_owned());
				(&sample + &(derivative * dt), false)
			}
			Kdpm2Eval::Midpoint(i) => {
				let dt = self.sigmas[i + 1] - self.sigmas[i];
				let sample = self.sample.take().ok_or_else(|| DiffusionError::scheduler("midpoint evaluation without a first-order sample"))?;
				(sample + derivative * dt, true)
			}
		};

		self.cursor.advance();
		Ok(SchedulerStepOutput {
			sample: prev_sample,
			pred_original_sample: Some(pred_original_sample),
			is_final_order
		})
	}
}

#[cfg(test)]
mod tests {
	use super::KDPM2DiscreteScheduler;
	use crate::schedulers::{DiffusionScheduler, SchedulerOptions};

	#[test]
	fn test_midpoint_timesteps_sit_between_steps() {
		let scheduler = KDPM2DiscreteScheduler::new(&SchedulerOptions::default(), 5, 0).unwrap();
		let t = scheduler.timesteps();
		assert_eq!(t.len(), 9);
		for pair in t.windows(2) {
			assert!(pair[0] >= pair[1], "{t:?}");
		}
	}

	#[test]
	fn test_midpoint_sigma_is_geometric_mean() {
		let scheduler = KDPM2DiscreteScheduler::new(&SchedulerOptions::default(), 5, 0).unwrap();
		let expected = (scheduler.sigmas[1] * scheduler.sigmas[2]).sqrt();
		assert!((scheduler.sigmas_interpol[1] - expected).abs() / expected < 1e-4);
	}
}
