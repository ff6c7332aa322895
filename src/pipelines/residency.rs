//! Which sub-models are resident in each phase of a run.

use std::{
	collections::{BTreeMap, BTreeSet},
	fmt
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CancellationToken, DiffusionError, ModelOptimization, ModelSession, Result};

/// A sub-model of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
	/// Prompt encoder.
	TextEncoder,
	/// Prior denoiser of cascaded families.
	Prior,
	/// The primary denoising model.
	Denoiser,
	/// Secondary conditioner.
	ControlNet,
	/// VAE encoder.
	VaeEncoder,
	/// VAE decoder.
	VaeDecoder
}

impl Component {
	/// Every component.
	pub const ALL: [Component; 6] = [
		Component::TextEncoder,
		Component::Prior,
		Component::Denoiser,
		Component::ControlNet,
		Component::VaeEncoder,
		Component::VaeDecoder
	];
}

impl fmt::Display for Component {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Component::TextEncoder => "text-encoder",
			Component::Prior => "prior",
			Component::Denoiser => "denoiser",
			Component::ControlNet => "controlnet",
			Component::VaeEncoder => "vae-encoder",
			Component::VaeDecoder => "vae-decoder"
		})
	}
}

/// A phase of a run. Residency changes only happen at the start & end of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
	/// Prompt encoding.
	TextEncode,
	/// Encoding of the source image.
	Encode,
	/// The prior denoising loop.
	Prior,
	/// The main denoising loop.
	Denoise,
	/// Decoding of the final latent.
	Decode
}

/// Per-phase low-memory flags. A set flag unloads that phase's models as soon as the phase completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LowMemoryOptions {
	/// Unload the text encoder after encoding prompts.
	pub text_encoder: bool,
	/// Unload the prior, denoiser & controlnet after their loops, and never keep the denoiser & controlnet resident
	/// together.
	pub compute: bool,
	/// Unload the VAE encoder & decoder after use.
	pub decode: bool
}

impl LowMemoryOptions {
	/// Every flag set.
	pub fn all() -> Self {
		Self {
			text_encoder: true,
			compute: true,
			decode: true
		}
	}

	/// Whether `component` is unloaded after its phase.
	pub fn applies_to(&self, component: Component) -> bool {
		match component {
			Component::TextEncoder => self.text_encoder,
			Component::Prior | Component::Denoiser | Component::ControlNet => self.compute,
			Component::VaeEncoder | Component::VaeDecoder => self.decode
		}
	}
}

/// The residency policy of one run.
///
/// Computed once per run from the run's low-memory flags and whether secondary conditioning is active, then diffed
/// against the sessions that are actually resident at each phase boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidencyPlan {
	available: BTreeSet<Component>,
	low_memory: LowMemoryOptions,
	controlnet_active: bool
}

impl ResidencyPlan {
	/// Creates the plan for a pipeline with the `available` components.
	pub fn new(available: impl IntoIterator<Item = Component>, low_memory: LowMemoryOptions, controlnet_active: bool) -> Self {
		Self {
			available: available.into_iter().collect(),
			low_memory,
			controlnet_active
		}
	}

	/// The run's low-memory flags.
	pub fn low_memory(&self) -> LowMemoryOptions {
		self.low_memory
	}

	/// Components that must be loaded to run `phase`.
	pub fn required(&self, phase: Phase) -> BTreeSet<Component> {
		let required: &[Component] = match phase {
			Phase::TextEncode => &[Component::TextEncoder],
			Phase::Encode => &[Component::VaeEncoder],
			Phase::Prior => &[Component::Prior],
			Phase::Denoise if self.controlnet_active && !self.swap_controlnet() => &[Component::Denoiser, Component::ControlNet],
			Phase::Denoise => &[Component::Denoiser],
			Phase::Decode => &[Component::VaeDecoder]
		};
		required.iter().copied().filter(|c| self.available.contains(c)).collect()
	}

	/// Components allowed to stay resident while `phase` runs: what the phase requires, plus everything no low-memory
	/// flag applies to.
	pub fn desired(&self, phase: Phase) -> BTreeSet<Component> {
		let mut desired = self.required(phase);
		desired.extend(self.available.iter().copied().filter(|c| !self.low_memory.applies_to(*c)));
		if phase == Phase::Denoise && self.swap_controlnet() {
			desired.insert(Component::Denoiser);
		}
		desired
	}

	/// Components to unload as soon as `phase` completes.
	pub fn release_after(&self, phase: Phase) -> BTreeSet<Component> {
		let mut release: BTreeSet<Component> = self.required(phase).into_iter().filter(|c| self.low_memory.applies_to(*c)).collect();
		if phase == Phase::Denoise && self.controlnet_active && self.low_memory.compute {
			release.insert(Component::ControlNet);
		}
		release
	}

	/// Whether the denoiser & controlnet must take turns being resident within each evaluation.
	pub fn swap_controlnet(&self) -> bool {
		self.controlnet_active && self.low_memory.compute && self.available.contains(&Component::ControlNet)
	}

	/// Components loaded by an explicit pipeline load: everything available that no low-memory flag applies to.
	pub fn preload(&self) -> BTreeSet<Component> {
		self.available.iter().copied().filter(|c| !self.low_memory.applies_to(*c)).collect()
	}
}

/// The sessions of a pipeline, keyed by component, with per-component optimization profiles.
#[derive(Debug, Default)]
pub(crate) struct SessionSet {
	sessions: BTreeMap<Component, ModelSession>,
	optimizations: BTreeMap<Component, ModelOptimization>
}

impl SessionSet {
	pub fn insert(&mut self, component: Component, session: ModelSession) {
		self.sessions.insert(component, session);
	}

	pub fn set_optimizations(&mut self, optimizations: BTreeMap<Component, ModelOptimization>) {
		self.optimizations = optimizations;
	}

	pub fn available(&self) -> impl Iterator<Item = Component> + '_ {
		self.sessions.keys().copied()
	}

	pub fn contains(&self, component: Component) -> bool {
		self.sessions.contains_key(&component)
	}

	pub fn resident(&self) -> BTreeSet<Component> {
		self.sessions.iter().filter(|(_, s)| s.is_loaded()).map(|(c, _)| *c).collect()
	}

	pub fn get(&self, component: Component) -> Result<&ModelSession> {
		self.sessions.get(&component).ok_or_else(|| missing(component))
	}

	/// Returns the session and the optimization profile it should be loaded with.
	pub fn session_and_optimization(&mut self, component: Component) -> Result<(&mut ModelSession, Option<&ModelOptimization>)> {
		let session = self.sessions.get_mut(&component).ok_or_else(|| missing(component))?;
		Ok((session, self.optimizations.get(&component)))
	}

	/// Loads `component` if it is not resident with its profile, recording it in `loaded` if this call loaded it.
	pub async fn ensure(&mut self, component: Component, token: &CancellationToken, loaded: &mut BTreeSet<Component>) -> Result<()> {
		let optimization = self.optimizations.get(&component);
		let session = self.sessions.get_mut(&component).ok_or_else(|| missing(component))?;
		let was_loaded = session.is_loaded();
		session.load(optimization, token).await?;
		if !was_loaded {
			loaded.insert(component);
		}
		Ok(())
	}

	pub fn unload(&mut self, component: Component) {
		if let Some(session) = self.sessions.get_mut(&component) {
			session.unload();
		}
	}

	pub fn unload_all(&mut self) {
		for session in self.sessions.values_mut() {
			session.unload();
		}
	}

	/// Unloads every resident session `plan` does not allow during `phase`.
	pub fn reconcile(&mut self, plan: &ResidencyPlan, phase: Phase) {
		let desired = plan.desired(phase);
		let evict: Vec<Component> = self.resident().difference(&desired).copied().collect();
		if !evict.is_empty() {
			debug!(?phase, ?evict, "reconciling residency");
		}
		for component in evict {
			self.unload(component);
		}
	}

	/// Unloads what `plan` releases once `phase` completes.
	pub fn release(&mut self, plan: &ResidencyPlan, phase: Phase) {
		for component in plan.release_after(phase) {
			if self.sessions.get(&component).map_or(false, ModelSession::is_loaded) {
				debug!(?phase, %component, "releasing after phase");
				self.unload(component);
			}
		}
	}
}

fn missing(component: Component) -> DiffusionError {
	DiffusionError::config(format!("pipeline has no {component} model"))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn plan(low_memory: LowMemoryOptions, controlnet: bool) -> ResidencyPlan {
		ResidencyPlan::new(Component::ALL, low_memory, controlnet)
	}

	#[test]
	fn test_maximum_memory_keeps_everything() {
		let plan = plan(LowMemoryOptions::default(), true);
		assert_eq!(plan.desired(Phase::Decode).len(), Component::ALL.len());
		assert!(plan.release_after(Phase::Denoise).is_empty());
		assert!(!plan.swap_controlnet());
		assert_eq!(plan.required(Phase::Denoise), [Component::Denoiser, Component::ControlNet].into_iter().collect());
	}

	#[test]
	fn test_minimum_memory_holds_only_the_active_phase() {
		let plan = plan(LowMemoryOptions::all(), false);
		assert_eq!(plan.desired(Phase::TextEncode), [Component::TextEncoder].into_iter().collect());
		assert_eq!(plan.desired(Phase::Decode), [Component::VaeDecoder].into_iter().collect());
		assert_eq!(plan.release_after(Phase::Denoise), [Component::Denoiser].into_iter().collect());
		assert!(plan.preload().is_empty());
	}

	#[test]
	fn test_compute_flag_swaps_controlnet() {
		let low_memory = LowMemoryOptions {
			compute: true,
			..LowMemoryOptions::default()
		};
		let plan = plan(low_memory, true);
		assert!(plan.swap_controlnet());
		assert_eq!(plan.required(Phase::Denoise), [Component::Denoiser].into_iter().collect());
		assert!(!plan.desired(Phase::Denoise).contains(&Component::ControlNet));
		assert!(plan.release_after(Phase::Denoise).contains(&Component::ControlNet));
		assert!(plan.desired(Phase::Denoise).contains(&Component::TextEncoder));
	}

	#[test]
	fn test_missing_components_are_never_required() {
		let plan = ResidencyPlan::new([Component::TextEncoder, Component::Denoiser, Component::VaeDecoder], LowMemoryOptions::default(), false);
		assert!(plan.required(Phase::Encode).is_empty());
		assert!(plan.required(Phase::Prior).is_empty());
		assert!(!plan.desired(Phase::Denoise).contains(&Component::ControlNet));
	}
}
