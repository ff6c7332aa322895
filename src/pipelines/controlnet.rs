//! ControlNet-style secondary conditioning.

use ndarray::{arr1, ArrayD};

use crate::{
	config::{ControlNetConfig, ModelInputNames},
	session::{SessionInputs, SessionOutputs},
	CancellationToken, ModelSession, Result
};

/// Runs an auxiliary network on a conditioning image and feeds its residuals into the primary model.
///
/// Every output of the auxiliary network is passed to the primary model as an input of the same name (e.g.
/// `down_block_res_samples`, `mid_block_res_sample`); outputs the primary model does not declare are dropped when it
/// is run.
#[derive(Debug, Clone)]
pub struct SecondaryConditioner {
	inputs: ModelInputNames
}

impl SecondaryConditioner {
	/// Creates a conditioner for the network described by `config`.
	pub fn new(config: &ControlNetConfig) -> Self {
		Self { inputs: config.inputs.clone() }
	}

	/// Builds the auxiliary network's inputs for one evaluation.
	pub fn inputs(&self, sample: &ArrayD<f32>, timestep: i64, hidden_states: &ArrayD<f32>, image: &ArrayD<f32>, scale: f32) -> SessionInputs {
		SessionInputs::new()
			.with(self.inputs.sample.as_str(), sample.clone())
			.with(self.inputs.timestep.as_str(), arr1(&[timestep]).into_dyn())
			.with(self.inputs.encoder_hidden_states.as_str(), hidden_states.clone())
			.with(self.inputs.controlnet_cond.as_str(), image.clone())
			.with(self.inputs.conditioning_scale.as_str(), arr1(&[scale]).into_dyn())
	}

	/// Runs the auxiliary network, which must be loaded.
	///
	/// # Errors
	/// Propagates inference errors.
	pub async fn run(&self, session: &ModelSession, inputs: SessionInputs, token: &CancellationToken) -> Result<SessionOutputs> {
		session.run(inputs, token).await
	}

	/// Adds every auxiliary output to the primary model's inputs.
	pub fn inject(outputs: SessionOutputs, primary: &mut SessionInputs) {
		for (name, residual) in outputs {
			primary.insert(name, residual);
		}
	}
}
