//! Errors produced by pipelines, sessions & schedulers.

use std::path::PathBuf;

use thiserror::Error;

/// Shorthand result type used throughout the crate.
pub type Result<T, E = DiffusionError> = std::result::Result<T, E>;

/// An error surfaced while configuring or running a diffusion pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiffusionError {
	/// The run or pipeline configuration is invalid. Raised before any model is loaded.
	#[error("invalid configuration: {0}")]
	Configuration(String),
	/// A model weight file could not be found at load time.
	#[error("model file not found: {}", .0.display())]
	ModelNotFound(PathBuf),
	/// The operation was cancelled through its [`crate::CancellationToken`].
	#[error("operation was cancelled")]
	Cancelled,
	/// A session was run before being loaded.
	#[error("model session `{0}` is not loaded")]
	NotLoaded(String),
	/// A scheduler was driven outside of its contract (stepping past the end of the schedule, mismatched shapes...)
	#[error("scheduler error: {0}")]
	Scheduler(String),
	/// The execution engine failed to create or run a session.
	#[error(transparent)]
	Engine(#[from] ort::OrtError),
	/// A tensor had an unexpected shape.
	#[error(transparent)]
	Shape(#[from] ndarray::ShapeError),
	/// Reading a configuration document or model file failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// The pipeline configuration document is malformed.
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	/// Errors from collaborators without a dedicated variant (tokenizer, image codec, blocking task join).
	#[error(transparent)]
	Other(#[from] anyhow::Error)
}

impl DiffusionError {
	/// Returns `true` if this error represents a cancelled operation rather than a failure.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, DiffusionError::Cancelled)
	}

	pub(crate) fn config(message: impl Into<String>) -> Self {
		DiffusionError::Configuration(message.into())
	}

	pub(crate) fn scheduler(message: impl Into<String>) -> Self {
		DiffusionError::Scheduler(message.into())
	}
}
