//! `diffusion-orchestrator` drives pretrained diffusion models through [ONNX Runtime]: it owns the denoising loop,
//! the scheduler family, classifier-free guidance, ControlNet-style secondary conditioning & the lifecycle of every
//! sub-model under a memory budget.
//!
//! Devices are discovered once through a caller-owned [`DeviceCatalog`], which is then handed to each pipeline:
//! ```ignore
//! use std::sync::Arc;
//!
//! use diffusion_orchestrator::{
//! 	CancellationToken, DeviceCatalog, DiffusionPipeline, GenerateOptions, OrtEnvironment, PipelineOptions, SchedulerType
//! };
//!
//! let catalog = DeviceCatalog::new(Arc::new(OrtEnvironment::builder().build()?));
//! let mut pipeline = DiffusionPipeline::new(&catalog, "./stable-diffusion-v1-5/", PipelineOptions::default())?;
//!
//! let token = CancellationToken::new();
//! pipeline.load(&token).await?;
//! let options = GenerateOptions::default()
//! 	.with_prompt("photo of a red fox")
//! 	.with_scheduler(SchedulerType::EulerAncestral)
//! 	.with_steps(20);
//! let output = pipeline.run(&options, None, &token).await?;
//! let images = diffusion_orchestrator::util::tensor_to_images(output.view())?;
//! ```
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

use std::sync::Arc;

mod cancel;
#[cfg(feature = "tokenizers")]
#[doc(hidden)]
pub mod clip;
pub mod config;
mod error;
pub mod guidance;
pub mod pipelines;
pub mod schedulers;
pub mod session;
pub mod tiling;
pub mod util;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;
use tracing::debug;

pub use self::cancel::CancellationToken;
pub use self::error::{DiffusionError, Result};
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::session::{ExecutionEngine, ModelOptimization, ModelSession, OptimizationLevel, OrtEngine, SessionMetadata};

/// The strategy to use for extending the device memory arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl Default for ArenaExtendStrategy {
	fn default() -> Self {
		Self::PowerOfTwo
	}
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		match val {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// The type of search done for cuDNN convolution algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CuDNNConvolutionAlgorithmSearch {
	/// Exhaustive kernel search. Will spend more time and memory to find the most optimal kernel for this GPU.
	/// This is the **default** value set by ONNX Runtime.
	Exhaustive,
	/// Heuristic kernel search. Will spend a small amount of time and memory to find an optimal kernel for this
	/// GPU.
	Heuristic,
	/// Uses the default cuDNN kernels that may not be optimized for this GPU. **This is NOT the actual default
	/// value set by ONNX Runtime, the default is set to `Exhaustive`.**
	Default
}

impl Default for CuDNNConvolutionAlgorithmSearch {
	fn default() -> Self {
		Self::Exhaustive
	}
}

impl From<CuDNNConvolutionAlgorithmSearch> for String {
	fn from(val: CuDNNConvolutionAlgorithmSearch) -> Self {
		match val {
			CuDNNConvolutionAlgorithmSearch::Exhaustive => "EXHAUSTIVE".to_string(),
			CuDNNConvolutionAlgorithmSearch::Heuristic => "HEURISTIC".to_string(),
			CuDNNConvolutionAlgorithmSearch::Default => "DEFAULT".to_string()
		}
	}
}

/// Device options for the CUDA execution provider.
///
/// For low-VRAM devices running Stable Diffusion v1, it's best to use a float16 model with the following parameters:
/// ```ignore
/// CUDADeviceOptions {
/// 	memory_limit: Some(3000000000),
/// 	arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested),
/// 	..Default::default()
/// }
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit. Models may use all available VRAM if a memory limit is not set.
	/// VRAM usage may be higher than the memory limit (though typically not by much).
	pub memory_limit: Option<usize>,
	/// The type of search done for cuDNN convolution algorithms. See [`CuDNNConvolutionAlgorithmSearch`] for
	/// more info.
	///
	/// **NOTE**: Setting this to any value other than `Exhaustive` seems to break float16 models!
	pub cudnn_conv_algorithm_search: Option<CuDNNConvolutionAlgorithmSearch>
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(val: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		if let Some(cudnn_conv_algorithm_search) = val.cudnn_conv_algorithm_search {
			ep = ep.with("cudnn_conv_algo_search", cudnn_conv_algorithm_search);
		}
		ep
	}
}

/// A device on which to place a diffusion model on.
///
/// If a device is not specified, or a configured execution provider is not available, the model will be placed on the
/// CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	CPU,
	/// Use NVIDIA CUDA as a device. Requires an NVIDIA Kepler GPU or later.
	///
	/// First value is the device ID (which can be set to 0 in most cases). Second value is additional execution
	/// provider parameters; see [`CUDADeviceOptions`].
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Use NVIDIA TensorRT as a device. Requires an NVIDIA Kepler GPU or later.
	TensorRT,
	/// Use Windows DirectML as a device. Requires a DirectX 12 compatible GPU.
	///
	/// First value is the device ID (which can be set to 0 in most cases).
	DirectML(usize),
	/// Custom execution provider w/ options.
	Custom(ExecutionProvider)
}

impl Default for DiffusionDevice {
	fn default() -> Self {
		DiffusionDevice::CPU
	}
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device, options) => {
				let options = options.unwrap_or_default();
				let mut ep: ExecutionProvider = options.into();
				ep = ep.with("device_id", device.to_string());
				ep
			}
			DiffusionDevice::TensorRT => ExecutionProvider::tensorrt(),
			DiffusionDevice::DirectML(device) => ExecutionProvider::directml().with("device_id", device.to_string()),
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Select which device each sub-model should be placed on.
///
/// On GPUs with little VRAM it is often favorable to keep the text encoder & VAE on the CPU so the denoiser gets the
/// whole device:
/// ```ignore
/// DiffusionDeviceControl {
/// 	denoiser: DiffusionDevice::CUDA(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the VAE encoder.
	pub vae_encoder: DiffusionDevice,
	/// The device on which to place the VAE decoder.
	pub vae_decoder: DiffusionDevice,
	/// The device on which to place the text encoder.
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the primary denoising model (UNet or transformer).
	pub denoiser: DiffusionDevice,
	/// The device on which to place the ControlNet, if the pipeline has one.
	pub controlnet: DiffusionDevice,
	/// The device on which to place the prior-stage denoiser of cascaded pipelines.
	pub prior: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all models on the same device.
	///
	/// Note that if you are setting `memory_limit` in [`CUDADeviceOptions`], the memory limit is **per session** (aka
	/// per model), NOT for the entire pipeline.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			vae_encoder: device.clone(),
			vae_decoder: device.clone(),
			text_encoder: device.clone(),
			denoiser: device.clone(),
			controlnet: device.clone(),
			prior: device
		}
	}
}

/// The set of execution targets available to this process.
///
/// Construct one catalog at startup and pass it to every pipeline; it owns the ONNX Runtime environment and the result
/// of execution provider discovery, so nothing is probed again per pipeline.
#[derive(Clone)]
pub struct DeviceCatalog {
	environment: Arc<OrtEnvironment>,
	available: Vec<DiffusionDevice>
}

impl DeviceCatalog {
	/// Probes the execution providers compiled into ONNX Runtime.
	pub fn new(environment: Arc<OrtEnvironment>) -> Self {
		let mut available = vec![DiffusionDevice::CPU];
		if ExecutionProvider::cuda().is_available() {
			available.push(DiffusionDevice::CUDA(0, None));
		}
		if ExecutionProvider::tensorrt().is_available() {
			available.push(DiffusionDevice::TensorRT);
		}
		if ExecutionProvider::directml().is_available() {
			available.push(DiffusionDevice::DirectML(0));
		}
		debug!(devices = ?available, "discovered execution providers");
		Self { environment, available }
	}

	/// Returns the ONNX Runtime environment shared by all sessions created from this catalog.
	pub fn environment(&self) -> &Arc<OrtEnvironment> {
		&self.environment
	}

	/// Returns the devices found during discovery. The CPU is always available.
	pub fn devices(&self) -> &[DiffusionDevice] {
		&self.available
	}

	/// Returns `device` if its execution provider was discovered, otherwise [`DiffusionDevice::CPU`].
	pub fn resolve(&self, device: &DiffusionDevice) -> DiffusionDevice {
		let found = match device {
			DiffusionDevice::CPU | DiffusionDevice::Custom(_) => true,
			DiffusionDevice::CUDA(..) => self.available.iter().any(|d| matches!(d, DiffusionDevice::CUDA(..))),
			DiffusionDevice::TensorRT => self.available.iter().any(|d| matches!(d, DiffusionDevice::TensorRT)),
			DiffusionDevice::DirectML(_) => self.available.iter().any(|d| matches!(d, DiffusionDevice::DirectML(_)))
		};
		if found {
			device.clone()
		} else {
			debug!(requested = ?device, "execution provider unavailable, falling back to CPU");
			DiffusionDevice::CPU
		}
	}

	/// Resolves every device in `devices` against this catalog.
	pub fn resolve_all(&self, devices: &DiffusionDeviceControl) -> DiffusionDeviceControl {
		DiffusionDeviceControl {
			vae_encoder: self.resolve(&devices.vae_encoder),
			vae_decoder: self.resolve(&devices.vae_decoder),
			text_encoder: self.resolve(&devices.text_encoder),
			denoiser: self.resolve(&devices.denoiser),
			controlnet: self.resolve(&devices.controlnet),
			prior: self.resolve(&devices.prior)
		}
	}

	/// Creates an [`OrtEngine`] backed by this catalog's environment.
	pub fn engine(&self) -> Arc<OrtEngine> {
		Arc::new(OrtEngine::new(Arc::clone(&self.environment)))
	}
}
