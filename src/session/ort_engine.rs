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

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use ndarray::IxDyn;
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor, TensorElementDataType},
	Environment, ExecutionProvider, GraphOptimizationLevel, Session, SessionBuilder
};
use tracing::debug;

use super::{
	ElementType, ExecutionEngine, NativeSession, OptimizationLevel, SessionInputs, SessionMetadata, SessionOptions,
	SessionOutputs, TensorInfo, TensorValue
};
use crate::{DiffusionError, Result};

/// [`ExecutionEngine`] backed by ONNX Runtime.
///
/// Session creation & inference run on tokio's blocking pool so the awaiting task can observe cancellation while the
/// native call is in flight.
pub struct OrtEngine {
	environment: Arc<Environment>
}

impl OrtEngine {
	/// Creates an engine that builds sessions in `environment`.
	pub fn new(environment: Arc<Environment>) -> Self {
		Self { environment }
	}
}

struct SharedSession(Session);

unsafe impl Send for SharedSession {}
unsafe impl Sync for SharedSession {}

struct OrtSession {
	session: Arc<SharedSession>,
	metadata: SessionMetadata
}

impl From<OptimizationLevel> for GraphOptimizationLevel {
	fn from(value: OptimizationLevel) -> Self {
		match value {
			OptimizationLevel::None => GraphOptimizationLevel::Disable,
			OptimizationLevel::Basic => GraphOptimizationLevel::Level1,
			OptimizationLevel::Extended => GraphOptimizationLevel::Level2,
			OptimizationLevel::All => GraphOptimizationLevel::Level3
		}
	}
}

fn element_type(ty: &TensorElementDataType) -> ElementType {
	match ty {
		TensorElementDataType::Float32 => ElementType::Float32,
		TensorElementDataType::Int32 => ElementType::Int32,
		TensorElementDataType::Int64 => ElementType::Int64,
		_ => ElementType::Other
	}
}

fn session_metadata(session: &Session) -> SessionMetadata {
	SessionMetadata {
		inputs: session
			.inputs
			.iter()
			.map(|i| TensorInfo::new(i.name.clone(), element_type(&i.input_type), i.dimensions.iter().map(|d| d.map(i64::from)).collect()))
			.collect(),
		outputs: session
			.outputs
			.iter()
			.map(|o| TensorInfo::new(o.name.clone(), element_type(&o.output_type), o.dimensions.iter().map(|d| d.map(i64::from)).collect()))
			.collect()
	}
}

#[async_trait]
impl ExecutionEngine for OrtEngine {
	async fn create_session(&self, path: &Path, options: &SessionOptions) -> Result<Box<dyn NativeSession>> {
		let environment = Arc::clone(&self.environment);
		let path = path.to_path_buf();
		let options = options.clone();
		let session = tokio::task::spawn_blocking(move || -> Result<Session> {
			if !options.optimization.dimension_overrides().is_empty() {
				debug!(overrides = ?options.optimization.dimension_overrides(), "dimension overrides are resolved by the model export, not applied at session creation");
			}
			Ok(SessionBuilder::new(&environment)?
				.with_optimization_level(options.optimization.level().into())?
				.with_execution_providers([ExecutionProvider::from(options.device)])?
				.with_model_from_file(&path)?)
		})
		.await
		.map_err(anyhow::Error::from)??;

		let metadata = session_metadata(&session);
		Ok(Box::new(OrtSession {
			session: Arc::new(SharedSession(session)),
			metadata
		}))
	}
}

#[async_trait]
impl NativeSession for OrtSession {
	fn metadata(&self) -> SessionMetadata {
		self.metadata.clone()
	}

	async fn run(&self, mut inputs: SessionInputs) -> Result<SessionOutputs> {
		let session = Arc::clone(&self.session);
		let metadata = self.metadata.clone();
		tokio::task::spawn_blocking(move || -> Result<SessionOutputs> {
			let mut tensors = Vec::with_capacity(metadata.inputs.len());
			for info in &metadata.inputs {
				let value = inputs
					.take(&info.name)
					.ok_or_else(|| DiffusionError::config(format!("missing model input `{}`", info.name)))?;
				tensors.push(match value.cast_for(info.element_type) {
					TensorValue::Float32(a) => InputTensor::from_array(a),
					TensorValue::Int32(a) => InputTensor::from_array(a),
					TensorValue::Int64(a) => InputTensor::from_array(a)
				});
			}

			let outputs = session.0.run(tensors)?;
			let mut result = SessionOutputs::new();
			for (info, output) in metadata.outputs.iter().zip(outputs.iter()) {
				let tensor: OrtOwnedTensor<'_, f32, IxDyn> = output.try_extract()?;
				result.push(info.name.clone(), tensor.view().to_owned());
			}
			Ok(result)
		})
		.await
		.map_err(anyhow::Error::from)?
	}
}
