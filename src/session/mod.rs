//! Model sessions: the lifecycle of one loaded sub-model on top of an [`ExecutionEngine`].

use std::{
	fmt,
	path::{Path, PathBuf},
	sync::Arc
};

use async_trait::async_trait;
use ndarray::ArrayD;
use tracing::debug;

mod optimization;
mod ort_engine;

pub use self::optimization::{ModelOptimization, OptimizationLevel};
pub use self::ort_engine::OrtEngine;
use crate::{CancellationToken, DiffusionDevice, DiffusionError, Result};

/// Element type of a model input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
	/// 32-bit float.
	Float32,
	/// 32-bit signed integer.
	Int32,
	/// 64-bit signed integer.
	Int64,
	/// Any type this crate does not feed or read directly.
	Other
}

/// Name, element type & shape of one model input or output. Dynamic dimensions are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
	/// Name of the tensor in the model graph.
	pub name: String,
	/// Element type of the tensor.
	pub element_type: ElementType,
	/// Dimensions, `None` for dynamic axes.
	pub dimensions: Vec<Option<i64>>
}

impl TensorInfo {
	/// Creates a new tensor description.
	pub fn new(name: impl Into<String>, element_type: ElementType, dimensions: Vec<Option<i64>>) -> Self {
		Self { name: name.into(), element_type, dimensions }
	}
}

/// Input & output descriptions of a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
	/// Model inputs, in graph order.
	pub inputs: Vec<TensorInfo>,
	/// Model outputs, in graph order.
	pub outputs: Vec<TensorInfo>
}

impl SessionMetadata {
	/// Returns the input named `name`.
	pub fn input(&self, name: &str) -> Option<&TensorInfo> {
		self.inputs.iter().find(|i| i.name == name)
	}

	/// Returns `true` if the model declares an input named `name`.
	pub fn has_input(&self, name: &str) -> bool {
		self.input(name).is_some()
	}

	/// Returns the output named `name`.
	pub fn output(&self, name: &str) -> Option<&TensorInfo> {
		self.outputs.iter().find(|o| o.name == name)
	}
}

/// A tensor fed to a model.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
	/// 32-bit float tensor.
	Float32(ArrayD<f32>),
	/// 32-bit integer tensor.
	Int32(ArrayD<i32>),
	/// 64-bit integer tensor.
	Int64(ArrayD<i64>)
}

impl TensorValue {
	/// The shape of the tensor.
	pub fn shape(&self) -> &[usize] {
		match self {
			TensorValue::Float32(a) => a.shape(),
			TensorValue::Int32(a) => a.shape(),
			TensorValue::Int64(a) => a.shape()
		}
	}

	/// Converts integer tensors to the integer width a model expects. Float tensors are left untouched.
	pub fn cast_for(self, element_type: ElementType) -> Self {
		match (self, element_type) {
			(TensorValue::Int64(a), ElementType::Int32) => TensorValue::Int32(a.mapv(|v| v as i32)),
			(TensorValue::Int32(a), ElementType::Int64) => TensorValue::Int64(a.mapv(i64::from)),
			(TensorValue::Int64(a), ElementType::Float32) => TensorValue::Float32(a.mapv(|v| v as f32)),
			(value, _) => value
		}
	}

	/// Borrows the tensor as `f32`, if it is a float tensor.
	pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
		match self {
			TensorValue::Float32(a) => Some(a),
			_ => None
		}
	}
}

impl From<ArrayD<f32>> for TensorValue {
	fn from(value: ArrayD<f32>) -> Self {
		TensorValue::Float32(value)
	}
}

impl From<ArrayD<i64>> for TensorValue {
	fn from(value: ArrayD<i64>) -> Self {
		TensorValue::Int64(value)
	}
}

impl From<ArrayD<i32>> for TensorValue {
	fn from(value: ArrayD<i32>) -> Self {
		TensorValue::Int32(value)
	}
}

/// Named inputs for one model invocation.
#[derive(Debug, Clone, Default)]
pub struct SessionInputs {
	tensors: Vec<(String, TensorValue)>
}

impl SessionInputs {
	/// Creates an empty input set.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds (or replaces) the input `name`.
	pub fn with(mut self, name: impl Into<String>, value: impl Into<TensorValue>) -> Self {
		self.insert(name, value);
		self
	}

	/// Adds (or replaces) the input `name`.
	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TensorValue>) {
		let name = name.into();
		let value = value.into();
		match self.tensors.iter_mut().find(|(n, _)| *n == name) {
			Some((_, v)) => *v = value,
			None => self.tensors.push((name, value))
		}
	}

	/// Returns the input `name`.
	pub fn get(&self, name: &str) -> Option<&TensorValue> {
		self.tensors.iter().find(|(n, _)| n == name).map(|(_, v)| v)
	}

	/// Removes and returns the input `name`.
	pub fn take(&mut self, name: &str) -> Option<TensorValue> {
		let index = self.tensors.iter().position(|(n, _)| n == name)?;
		Some(self.tensors.remove(index).1)
	}

	/// Drops every input the model does not declare.
	pub fn retain_declared(&mut self, metadata: &SessionMetadata) {
		self.tensors.retain(|(name, _)| metadata.has_input(name));
	}

	/// Iterates over the inputs in insertion order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> {
		self.tensors.iter().map(|(n, v)| (n.as_str(), v))
	}

	/// Number of inputs.
	pub fn len(&self) -> usize {
		self.tensors.len()
	}

	/// Returns `true` if there are no inputs.
	pub fn is_empty(&self) -> bool {
		self.tensors.is_empty()
	}
}

/// Named float outputs of one model invocation, in graph order.
#[derive(Debug, Clone, Default)]
pub struct SessionOutputs {
	tensors: Vec<(String, ArrayD<f32>)>
}

impl SessionOutputs {
	/// Creates an empty output set.
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends an output.
	pub fn push(&mut self, name: impl Into<String>, value: ArrayD<f32>) {
		self.tensors.push((name.into(), value));
	}

	/// Returns the output `name`.
	pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
		self.tensors.iter().find(|(n, _)| n == name).map(|(_, v)| v)
	}

	/// Returns the output at graph position `index`.
	pub fn get_index(&self, index: usize) -> Option<&ArrayD<f32>> {
		self.tensors.get(index).map(|(_, v)| v)
	}

	/// Consumes the outputs, returning the first one.
	pub fn into_first(self) -> Result<ArrayD<f32>> {
		self.tensors
			.into_iter()
			.next()
			.map(|(_, v)| v)
			.ok_or_else(|| DiffusionError::Other(anyhow::anyhow!("model produced no outputs")))
	}

	/// Iterates over the outputs in graph order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
		self.tensors.iter().map(|(n, v)| (n.as_str(), v))
	}

	/// Number of outputs.
	pub fn len(&self) -> usize {
		self.tensors.len()
	}

	/// Returns `true` if there are no outputs.
	pub fn is_empty(&self) -> bool {
		self.tensors.is_empty()
	}
}

impl IntoIterator for SessionOutputs {
	type Item = (String, ArrayD<f32>);
	type IntoIter = std::vec::IntoIter<(String, ArrayD<f32>)>;

	fn into_iter(self) -> Self::IntoIter {
		self.tensors.into_iter()
	}
}

/// Options passed to the engine when creating a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
	/// Execution target.
	pub device: DiffusionDevice,
	/// Graph optimization profile.
	pub optimization: ModelOptimization
}

/// The external execution engine that turns model files into runnable sessions.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
	/// Creates a native session for the model at `path`.
	async fn create_session(&self, path: &Path, options: &SessionOptions) -> Result<Box<dyn NativeSession>>;
}

/// A live native session. Dropping it releases the native handle.
#[async_trait]
pub trait NativeSession: Send + Sync {
	/// Describes the model's inputs & outputs.
	fn metadata(&self) -> SessionMetadata;

	/// Runs the model. Inputs the model does not declare must already have been removed.
	async fn run(&self, inputs: SessionInputs) -> Result<SessionOutputs>;
}

/// Lifecycle state of a [`ModelSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// No native handle is held.
	Unloaded,
	/// A native handle is being created.
	Loading,
	/// The session can be run.
	Loaded
}

/// Owns one sub-model: its configuration, its native handle once loaded, the cached metadata & the optimization profile
/// it was loaded with.
///
/// Sessions are owned by exactly one pipeline. The native handle is released on [`ModelSession::unload`] or when the
/// session is dropped.
pub struct ModelSession {
	name: String,
	path: PathBuf,
	device: DiffusionDevice,
	engine: Arc<dyn ExecutionEngine>,
	state: SessionState,
	handle: Option<Box<dyn NativeSession>>,
	metadata: Option<Arc<SessionMetadata>>,
	optimization: ModelOptimization
}

impl fmt::Debug for ModelSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ModelSession")
			.field("name", &self.name)
			.field("path", &self.path)
			.field("device", &self.device)
			.field("state", &self.state)
			.field("optimization", &self.optimization)
			.finish()
	}
}

impl ModelSession {
	/// Creates an unloaded session for the model file at `path`.
	pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, device: DiffusionDevice, engine: Arc<dyn ExecutionEngine>) -> Self {
		Self {
			name: name.into(),
			path: path.into(),
			device,
			engine,
			state: SessionState::Unloaded,
			handle: None,
			metadata: None,
			optimization: ModelOptimization::default()
		}
	}

	/// Name used in logs & errors.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Path to the model file.
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Current lifecycle state.
	pub fn state(&self) -> SessionState {
		self.state
	}

	/// Returns `true` if the session can be run.
	pub fn is_loaded(&self) -> bool {
		self.state == SessionState::Loaded
	}

	/// Cached metadata, if loaded.
	pub fn metadata(&self) -> Option<&Arc<SessionMetadata>> {
		self.metadata.as_ref()
	}

	/// Loads the model with the given optimization profile and returns its metadata.
	///
	/// If the session is already loaded with an equal profile, the cached metadata is returned without touching the
	/// engine. A different profile unloads the session and loads it again. If loading fails or is cancelled, the session
	/// is left unloaded.
	pub async fn load(&mut self, optimization: Option<&ModelOptimization>, token: &CancellationToken) -> Result<Arc<SessionMetadata>> {
		let requested = optimization.cloned().unwrap_or_default();
		if self.state == SessionState::Loaded {
			if let Some(metadata) = &self.metadata {
				if self.optimization == requested {
					return Ok(Arc::clone(metadata));
				}
			}
			debug!(session = %self.name, "optimization profile changed, reloading");
			self.unload();
		}

		token.check()?;
		if !self.path.exists() {
			return Err(DiffusionError::ModelNotFound(self.path.clone()));
		}

		self.state = SessionState::Loading;
		let engine = Arc::clone(&self.engine);
		let options = SessionOptions {
			device: self.device.clone(),
			optimization: requested.clone()
		};
		let created = tokio::select! {
			biased;
			_ = token.cancelled() => Err(DiffusionError::Cancelled),
			created = engine.create_session(&self.path, &options) => created
		};
		let handle = match created {
			Ok(handle) => handle,
			Err(e) => {
				self.state = SessionState::Unloaded;
				return Err(e);
			}
		};

		let metadata = Arc::new(handle.metadata());
		debug!(session = %self.name, path = %self.path.display(), device = ?self.device, "loaded session");
		self.handle = Some(handle);
		self.metadata = Some(Arc::clone(&metadata));
		self.optimization = requested;
		self.state = SessionState::Loaded;
		Ok(metadata)
	}

	/// Releases the native handle and clears cached metadata. Does nothing if the session is not loaded.
	pub fn unload(&mut self) {
		if self.handle.take().is_some() {
			debug!(session = %self.name, "unloaded session");
		}
		self.metadata = None;
		self.optimization = ModelOptimization::default();
		self.state = SessionState::Unloaded;
	}

	/// Runs the model. Inputs the model does not declare are dropped before the call.
	///
	/// # Errors
	/// Returns [`DiffusionError::NotLoaded`] if the session is not loaded and [`DiffusionError::Cancelled`] if `token`
	/// is cancelled before or during the call.
	pub async fn run(&self, mut inputs: SessionInputs, token: &CancellationToken) -> Result<SessionOutputs> {
		let (handle, metadata) = match (&self.handle, &self.metadata) {
			(Some(handle), Some(metadata)) => (handle, metadata),
			_ => return Err(DiffusionError::NotLoaded(self.name.clone()))
		};
		token.check()?;
		inputs.retain_declared(metadata);
		tokio::select! {
			biased;
			_ = token.cancelled() => Err(DiffusionError::Cancelled),
			outputs = handle.run(inputs) => outputs
		}
	}
}
