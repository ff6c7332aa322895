use serde::{Deserialize, Serialize};

/// Graph optimization level applied by the execution engine when creating a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationLevel {
	/// Disable all graph optimizations.
	None,
	/// Constant folding & redundant node elimination only.
	Basic,
	/// Basic optimizations plus complex node fusions.
	Extended,
	/// Every available optimization, including layout optimizations. **This is the default.**
	All
}

impl Default for OptimizationLevel {
	fn default() -> Self {
		Self::All
	}
}

/// An optimization profile for a model session: a graph optimization level plus an ordered set of named dimension
/// overrides (e.g. fixing `batch` to 1 and `height`/`width` to the latent size).
///
/// Profiles are compared by their dimension overrides only. A session loaded with no profile is equivalent to one
/// loaded with [`ModelOptimization::default()`], so requesting either again never triggers a reload.
///
/// ```
/// # use diffusion_orchestrator::{ModelOptimization, OptimizationLevel};
/// let a = ModelOptimization::new(OptimizationLevel::All).with_dimension_override("batch", 1);
/// let b = ModelOptimization::new(OptimizationLevel::Basic).with_dimension_override("batch", 1);
/// assert_eq!(a, b);
/// assert_ne!(a, ModelOptimization::default());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelOptimization {
	#[serde(default)]
	level: OptimizationLevel,
	#[serde(default)]
	dimension_overrides: Vec<(String, i64)>
}

impl ModelOptimization {
	/// Creates a profile with the given optimization level and no dimension overrides.
	pub fn new(level: OptimizationLevel) -> Self {
		Self { level, dimension_overrides: Vec::new() }
	}

	/// Returns a copy of this profile with `name` fixed to `value`. Overriding an existing name keeps its position.
	pub fn with_dimension_override(mut self, name: impl Into<String>, value: i64) -> Self {
		let name = name.into();
		match self.dimension_overrides.iter_mut().find(|(n, _)| *n == name) {
			Some((_, v)) => *v = value,
			None => self.dimension_overrides.push((name, value))
		}
		self
	}

	/// The graph optimization level.
	pub fn level(&self) -> OptimizationLevel {
		self.level
	}

	/// Dimension overrides in insertion order.
	pub fn dimension_overrides(&self) -> &[(String, i64)] {
		&self.dimension_overrides
	}

	/// Returns the override for the dimension `name`, if any.
	pub fn dimension_override(&self, name: &str) -> Option<i64> {
		self.dimension_overrides.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
	}
}

impl PartialEq for ModelOptimization {
	fn eq(&self, other: &Self) -> bool {
		self.dimension_overrides == other.dimension_overrides
	}
}

impl Eq for ModelOptimization {}

#[cfg(test)]
mod tests {
	use super::{ModelOptimization, OptimizationLevel};

	#[test]
	fn test_override_order_matters() {
		let a = ModelOptimization::default().with_dimension_override("height", 64).with_dimension_override("width", 64);
		let b = ModelOptimization::default().with_dimension_override("width", 64).with_dimension_override("height", 64);
		assert_ne!(a, b);
		assert_eq!(a.dimension_override("width"), Some(64));
	}

	#[test]
	fn test_override_replaces_in_place() {
		let a = ModelOptimization::new(OptimizationLevel::Extended)
			.with_dimension_override("batch", 2)
			.with_dimension_override("sequence", 77)
			.with_dimension_override("batch", 1);
		assert_eq!(a.dimension_overrides(), &[("batch".to_string(), 1), ("sequence".to_string(), 77)]);
		assert_eq!(a.level(), OptimizationLevel::Extended);
	}

	#[test]
	fn test_level_does_not_affect_equality() {
		assert_eq!(ModelOptimization::new(OptimizationLevel::None), ModelOptimization::default());
	}
}
