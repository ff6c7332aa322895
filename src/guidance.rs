//! Classifier-free guidance.
//!
//! ```
//! # use diffusion_orchestrator::guidance;
//! # use ndarray::{ArrayD, IxDyn};
//! let cond = ArrayD::from_elem(IxDyn(&[1, 4, 2, 2]), 1.0_f32);
//! let uncond = ArrayD::from_elem(IxDyn(&[1, 4, 2, 2]), 0.5_f32);
//! let guided = guidance::combine(cond.view(), uncond.view(), 3.0).unwrap();
//! assert!(guided.iter().all(|v| (v - 2.0).abs() < 1e-6));
//! ```

use ndarray::{ArrayD, ArrayViewD, Axis, Zip};

use crate::{DiffusionError, Result};

/// Returns `true` if `guidance_scale` calls for a second, unconditional forward pass.
///
/// Guidance with a scale of `1` or below reduces to the conditional prediction (or moves away from it), so the
/// unconditional pass is skipped entirely.
pub fn is_guidance_enabled(guidance_scale: f32) -> bool {
	guidance_scale > 1.0
}

/// Computes `uncond + guidance_scale * (cond - uncond)` element-wise.
///
/// # Errors
/// Returns a scheduler error if the predictions have different shapes.
pub fn combine(cond: ArrayViewD<'_, f32>, uncond: ArrayViewD<'_, f32>, guidance_scale: f32) -> Result<ArrayD<f32>> {
	if cond.shape() != uncond.shape() {
		return Err(DiffusionError::scheduler(format!(
			"conditional prediction {:?} and unconditional prediction {:?} differ in shape",
			cond.shape(),
			uncond.shape()
		)));
	}
	let mut guided = uncond.to_owned();
	Zip::from(&mut guided).and(&cond).par_for_each(|u, c| {
		*u += guidance_scale * (*c - *u);
	});
	Ok(guided)
}

/// Guides a batched prediction whose first half along the batch axis is unconditional & second half is conditional.
///
/// The returned tensor has half the batch size of `prediction`.
///
/// # Errors
/// Returns a scheduler error if the batch dimension is missing or odd.
pub fn combine_batched(prediction: ArrayViewD<'_, f32>, guidance_scale: f32) -> Result<ArrayD<f32>> {
	let batch = prediction.shape().first().copied().unwrap_or(0);
	if batch == 0 || batch % 2 != 0 {
		return Err(DiffusionError::scheduler(format!("batched guidance needs an even batch, got {:?}", prediction.shape())));
	}
	let (uncond, cond) = prediction.split_at(Axis(0), batch / 2);
	combine(cond, uncond, guidance_scale)
}

#[cfg(test)]
mod tests {
	use ndarray::{concatenate, ArrayD, Axis, IxDyn};
	use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	fn pair() -> (ArrayD<f32>, ArrayD<f32>) {
		let mut rng = StdRng::seed_from_u64(11);
		(
			ArrayD::random_using(IxDyn(&[1, 4, 8, 8]), StandardNormal, &mut rng),
			ArrayD::random_using(IxDyn(&[1, 4, 8, 8]), StandardNormal, &mut rng)
		)
	}

	#[test]
	fn test_unit_scale_returns_conditional() {
		let (cond, uncond) = pair();
		let guided = combine(cond.view(), uncond.view(), 1.0).unwrap();
		assert!(guided.iter().zip(cond.iter()).all(|(g, c)| (g - c).abs() < 1e-5));
	}

	#[test]
	fn test_zero_scale_returns_unconditional() {
		let (cond, uncond) = pair();
		let guided = combine(cond.view(), uncond.view(), 0.0).unwrap();
		assert_eq!(guided, uncond);
	}

	#[test]
	fn test_batched_halves_match_pairwise() {
		let (cond, uncond) = pair();
		let batched = concatenate![Axis(0), uncond, cond];
		let guided = combine_batched(batched.view(), 7.5).unwrap();
		assert_eq!(guided.shape(), &[1, 4, 8, 8]);
		assert_eq!(guided, combine(cond.view(), uncond.view(), 7.5).unwrap());
	}

	#[test]
	fn test_guidance_enabled_range() {
		assert!(!is_guidance_enabled(0.0));
		assert!(!is_guidance_enabled(1.0));
		assert!(is_guidance_enabled(1.01));
		assert!(combine_batched(ArrayD::zeros(IxDyn(&[3, 4])).view(), 2.0).is_err());
	}
}
