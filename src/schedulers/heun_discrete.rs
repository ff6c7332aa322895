use ndarray::{ArrayD, ArrayViewD, Zip};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	check_noise_shapes, check_shapes, sigma_pred_original, sigma_schedule, DiffusionScheduler, PredictionType, ScheduleCursor, SchedulerOptions,
	SchedulerStepOutput, SchedulerType
};
use crate::{DiffusionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeunEval {
	/// Euler predictor of step `i`.
	Predictor(usize),
	/// Trapezoidal corrector of step `i`, evaluated at the noise level of step `i + 1`.
	Corrector(usize)
}

struct PredictorState {
	derivative: ArrayD<f32>,
	dt: f32,
	sample: ArrayD<f32>
}

/// Heun's method (Algorithm 1 of [Karras et al. (2022)](https://arxiv.org/abs/2206.00364)).
///
/// Every step but the last takes two model evaluations: an Euler predictor at the step's noise level, then a
/// corrector at the next noise level that averages both derivatives. The final step to `sigma = 0` is a plain Euler
/// step, so a run of `n` steps evaluates the model `2n - 1` times.
pub struct HeunDiscreteScheduler {
	prediction_type: PredictionType,
	cursor: ScheduleCursor,
	evals: Vec<HeunEval>,
	sigmas: Vec<f32>,
	init_noise_sigma: f32,
	predictor: Option<PredictorState>,
	rng: StdRng
}

impl HeunDiscreteScheduler {
	/// Creates a scheduler for a run of `steps` steps.
	///
	/// # Errors
	/// Can error if `steps` is invalid or the beta schedule cannot be built.
	pub fn new(options: &SchedulerOptions, steps: usize, seed: u64) -> Result<Self> {
		let schedule = sigma_schedule(options, steps)?;
		let mut timesteps = Vec::with_capacity(steps * 2 - 1);
		let mut evals = Vec::with_capacity(steps * 2 - 1);
		for i in 0..steps {
			timesteps.push(schedule.timesteps[i]);
			evals.push(HeunEval::Predictor(i));
			if i + 1 < steps {
				timesteps.push(schedule.timesteps[i + 1]);
				evals.push(HeunEval::Corrector(i));
			}
		}
		Ok(Self {
			prediction_type: options.prediction_type,
			cursor: ScheduleCursor::new(timesteps),
			evals,
			sigmas: schedule.sigmas,
			init_noise_sigma: schedule.init_noise_sigma,
			predictor: None,
			rng: StdRng::seed_from_u64(seed)
		})
	}

	fn eval_sigma(&self, index: usize) -> f32 {
		match self.evals[index] {
			HeunEval::Predictor(i) => self.sigmas[i],
			HeunEval::Corrector(i) => self.sigmas[i + 1]
		}
	}
}

impl DiffusionScheduler for HeunDiscreteScheduler {
	fn scheduler_type(&self) -> SchedulerType {
		SchedulerType::Heun
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
		if matches!(self.evals.get(index), Some(HeunEval::Corrector(_))) {
			return Err(DiffusionError::scheduler(format!("evaluation {index} is the middle of a step")));
		}
		self.predictor = None;
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
			HeunEval::Predictor(i) => {
				let dt = self.sigmas[i + 1] - sigma;
				let prev_sample = &sample + &(&derivative * dt);
				if self.sigmas[i + 1] == 0.0 {
					(prev_sample, true)
				} else {
					self.predictor = Some(PredictorState { derivative, dt, sample: sample.to_owned() });
					(prev_sample, false)
				}
			}
			HeunEval::Corrector(_) => {
				let state = self
					.predictor
					.take()
					.ok_or_else(|| DiffusionError::scheduler("corrector evaluation without a predictor"))?;
				let derivative = (state.derivative + derivative) / 2.0;
				(state.sample + derivative * state.dt, true)
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
	use super::HeunDiscreteScheduler;
	use crate::schedulers::{tests::drive, DiffusionScheduler, SchedulerOptions};

	#[test]
	fn test_evaluations_interleave_timesteps() {
		let scheduler = HeunDiscreteScheduler::new(&SchedulerOptions::default(), 3, 0).unwrap();
		let t = scheduler.timesteps();
		assert_eq!(t.len(), 5);
		assert_eq!(t[1], t[2]);
		assert_eq!(t[3], t[4]);
		assert!(t[0] > t[1] && t[2] > t[3]);
	}

	#[test]
	fn test_begin_index_must_start_a_step() {
		let mut scheduler = HeunDiscreteScheduler::new(&SchedulerOptions::default(), 4, 0).unwrap();
		assert!(scheduler.set_begin_index(1).is_err());
		let begin = scheduler.begin_index_for_step(2);
		scheduler.set_begin_index(begin).unwrap();
		let (finals, _) = drive(&mut scheduler, &[1, 4, 2, 2]);
		assert_eq!(finals, 2);
	}
}
