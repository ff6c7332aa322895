#![allow(dead_code)]

use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex
	},
	time::Duration
};

use async_trait::async_trait;
use diffusion_orchestrator::{
	config::PipelineConfig,
	session::{ElementType, NativeSession, SessionInputs, SessionMetadata, SessionOptions, SessionOutputs, TensorInfo, TensorValue},
	DiffusionPipeline, ExecutionEngine, PipelineOptions, PromptTokenizer, Result, TokenizedPrompt
};
use ndarray::{ArrayD, IxDyn};

pub const HIDDEN_SIZE: usize = 32;
pub const TOKENS: usize = 8;

/// Counters for one model file.
#[derive(Debug, Default)]
pub struct ModelStats {
	pub loads: AtomicUsize,
	pub runs: AtomicUsize,
	pub live: AtomicUsize,
	pub inputs: Mutex<Vec<Vec<String>>>
}

#[derive(Debug, Default)]
pub struct Registry {
	models: Mutex<HashMap<String, Arc<ModelStats>>>,
	/// ControlNet evaluations that ran while the U-Net was also resident.
	pub overlaps: AtomicUsize
}

impl Registry {
	pub fn stats(&self, file: &str) -> Arc<ModelStats> {
		let mut models = self.models.lock().unwrap();
		Arc::clone(models.entry(file.to_owned()).or_default())
	}

	pub fn loads(&self, file: &str) -> usize {
		self.stats(file).loads.load(Ordering::SeqCst)
	}

	pub fn runs(&self, file: &str) -> usize {
		self.stats(file).runs.load(Ordering::SeqCst)
	}

	pub fn live(&self, file: &str) -> usize {
		self.stats(file).live.load(Ordering::SeqCst)
	}

	pub fn total_loads(&self) -> usize {
		self.models.lock().unwrap().values().map(|s| s.loads.load(Ordering::SeqCst)).sum()
	}

	pub fn last_inputs(&self, file: &str) -> Vec<String> {
		self.stats(file).inputs.lock().unwrap().last().cloned().unwrap_or_default()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockKind {
	TextEncoder,
	Denoiser,
	ControlNet,
	VaeEncoder,
	VaeDecoder
}

impl MockKind {
	fn from_file(file: &str) -> Self {
		match file {
			"text_encoder.onnx" => MockKind::TextEncoder,
			"controlnet.onnx" => MockKind::ControlNet,
			"vae_encoder.onnx" => MockKind::VaeEncoder,
			"vae_decoder.onnx" => MockKind::VaeDecoder,
			_ => MockKind::Denoiser
		}
	}

	fn metadata(self) -> SessionMetadata {
		let f32_input = |name: &str| TensorInfo::new(name, ElementType::Float32, vec![None, None, None, None]);
		let (inputs, outputs) = match self {
			MockKind::TextEncoder => (
				vec![TensorInfo::new("input_ids", ElementType::Int32, vec![Some(1), Some(TOKENS as i64)])],
				vec![f32_input("last_hidden_state"), f32_input("pooler_output")]
			),
			MockKind::Denoiser => (
				vec![
					f32_input("sample"),
					TensorInfo::new("timestep", ElementType::Int64, vec![Some(1)]),
					f32_input("encoder_hidden_states"),
					f32_input("text_embeds"),
					f32_input("effnet"),
					f32_input("mid_block_res_sample")
				],
				vec![f32_input("out_sample")]
			),
			MockKind::ControlNet => (
				vec![
					f32_input("sample"),
					TensorInfo::new("timestep", ElementType::Int64, vec![Some(1)]),
					f32_input("encoder_hidden_states"),
					f32_input("controlnet_cond"),
					f32_input("conditioning_scale")
				],
				vec![f32_input("mid_block_res_sample")]
			),
			MockKind::VaeEncoder => (vec![f32_input("sample")], vec![f32_input("latent_sample")]),
			MockKind::VaeDecoder => (vec![f32_input("latent_sample")], vec![f32_input("sample")])
		};
		SessionMetadata { inputs, outputs }
	}
}

/// An execution engine that counts loads & runs per model file and produces tensors of plausible shapes.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
	pub registry: Arc<Registry>,
	pub load_delay: Option<Duration>
}

struct MockSession {
	kind: MockKind,
	stats: Arc<ModelStats>,
	registry: Arc<Registry>
}

impl Drop for MockSession {
	fn drop(&mut self) {
		self.stats.live.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl ExecutionEngine for MockEngine {
	async fn create_session(&self, path: &Path, _options: &SessionOptions) -> Result<Box<dyn NativeSession>> {
		if let Some(delay) = self.load_delay {
			tokio::time::sleep(delay).await;
		}
		let file = path.file_name().and_then(|f| f.to_str()).unwrap_or_default().to_owned();
		let stats = self.registry.stats(&file);
		stats.loads.fetch_add(1, Ordering::SeqCst);
		stats.live.fetch_add(1, Ordering::SeqCst);
		Ok(Box::new(MockSession {
			kind: MockKind::from_file(&file),
			stats,
			registry: Arc::clone(&self.registry)
		}))
	}
}

fn float_input<'a>(inputs: &'a SessionInputs, name: &str) -> &'a ArrayD<f32> {
	inputs.get(name).and_then(|v| v.as_f32()).unwrap_or_else(|| panic!("missing float input `{name}`"))
}

#[async_trait]
impl NativeSession for MockSession {
	fn metadata(&self) -> SessionMetadata {
		self.kind.metadata()
	}

	async fn run(&self, inputs: SessionInputs) -> Result<SessionOutputs> {
		self.stats.runs.fetch_add(1, Ordering::SeqCst);
		self.stats.inputs.lock().unwrap().push(inputs.iter().map(|(name, _)| name.to_owned()).collect());

		let mut outputs = SessionOutputs::new();
		match self.kind {
			MockKind::TextEncoder => {
				let tokens = inputs.get("input_ids").map_or(TOKENS, |ids| ids.shape()[1]);
				let id_sum: i64 = match inputs.get("input_ids") {
					Some(TensorValue::Int32(ids)) => ids.iter().map(|v| i64::from(*v)).sum(),
					Some(TensorValue::Int64(ids)) => ids.sum(),
					_ => 0
				};
				outputs.push("last_hidden_state", ArrayD::from_elem(IxDyn(&[1, tokens, HIDDEN_SIZE]), id_sum as f32 * 0.01));
				outputs.push("pooler_output", ArrayD::zeros(IxDyn(&[1, HIDDEN_SIZE])));
			}
			MockKind::Denoiser => {
				let sample = float_input(&inputs, "sample");
				let hidden = float_input(&inputs, "encoder_hidden_states").mean().unwrap_or(0.0);
				outputs.push("out_sample", sample.mapv(|v| v * 0.1 + hidden));
			}
			MockKind::ControlNet => {
				if self.registry.live("unet.onnx") > 0 {
					self.registry.overlaps.fetch_add(1, Ordering::SeqCst);
				}
				outputs.push("mid_block_res_sample", ArrayD::zeros(IxDyn(&[1, 8, 1, 1])));
			}
			MockKind::VaeEncoder => {
				let image = float_input(&inputs, "sample");
				let shape = image.shape();
				let mut latent = shape.to_vec();
				latent[1] = 4;
				let n = latent.len();
				latent[n - 2] = shape[n - 2] / 8;
				latent[n - 1] = shape[n - 1] / 8;
				outputs.push("latent_sample", ArrayD::from_elem(IxDyn(&latent), 0.25));
			}
			MockKind::VaeDecoder => {
				let latent = float_input(&inputs, "latent_sample");
				let mut shape = latent.shape().to_vec();
				shape[1] = 3;
				let n = shape.len();
				shape[n - 2] *= 8;
				shape[n - 1] *= 8;
				outputs.push("sample", ArrayD::zeros(IxDyn(&shape)));
			}
		}
		Ok(outputs)
	}
}

/// The value the mock text encoder fills its hidden states with for `prompt`. The mock denoiser adds it to its
/// prediction, so conditional & unconditional passes differ.
pub fn hidden_value(prompt: &str) -> f32 {
	prompt.split_whitespace().take(TOKENS).map(str::len).sum::<usize>() as f32 * 0.01
}

/// Splits on whitespace; each word's ID is its length.
pub struct TestTokenizer;

impl PromptTokenizer for TestTokenizer {
	fn max_length(&self) -> usize {
		TOKENS
	}

	fn encode(&self, text: &str) -> Result<TokenizedPrompt> {
		let mut input_ids: Vec<i64> = text.split_whitespace().take(TOKENS).map(|w| w.len() as i64).collect();
		let mut attention_mask = vec![1; input_ids.len()];
		input_ids.resize(TOKENS, 0);
		attention_mask.resize(TOKENS, 0);
		Ok(TokenizedPrompt { input_ids, attention_mask })
	}
}

pub fn stable_diffusion_config() -> serde_json::Value {
	serde_json::json!({
		"pipeline": "stable-diffusion",
		"text-encoder": { "path": "text_encoder.onnx" },
		"unet": { "path": "unet.onnx" },
		"controlnet": { "path": "controlnet.onnx" },
		"vae": { "encoder": "vae_encoder.onnx", "decoder": "vae_decoder.onnx" },
		"schedulers": [ "euler", "euler-ancestral", "heun", "lms", "ddim" ]
	})
}

pub fn cascade_config() -> serde_json::Value {
	serde_json::json!({
		"pipeline": "stable-cascade",
		"text-encoder": { "path": "text_encoder.onnx" },
		"unet": { "path": "decoder.onnx" },
		"prior": { "path": "prior.onnx" },
		"vae": { "decoder": "vae_decoder.onnx" },
		"schedulers": [ "ddpm", "euler" ]
	})
}

pub fn video_config() -> serde_json::Value {
	serde_json::json!({
		"pipeline": "video",
		"text-encoder": { "path": "text_encoder.onnx" },
		"unet": { "path": "transformer.onnx" },
		"vae": { "decoder": "vae_decoder.onnx", "latent-channels": 16, "temporal-scale-factor": 4 },
		"schedulers": [ "flow-match-euler", "euler" ]
	})
}

static FIXTURE_ID: AtomicUsize = AtomicUsize::new(0);

/// A pipeline over [`MockEngine`] with empty model files in a scratch directory.
pub struct Fixture {
	pub registry: Arc<Registry>,
	pub root: PathBuf,
	pub pipeline: DiffusionPipeline
}

impl Fixture {
	pub fn new(config: serde_json::Value, options: PipelineOptions) -> Self {
		Self::with_engine(MockEngine::default(), config, options)
	}

	pub fn with_engine(engine: MockEngine, config: serde_json::Value, options: PipelineOptions) -> Self {
		let root = std::env::temp_dir().join(format!("diffusion-orchestrator-{}-{}", std::process::id(), FIXTURE_ID.fetch_add(1, Ordering::SeqCst)));
		fs::create_dir_all(&root).unwrap();
		let config: PipelineConfig = serde_json::from_value(config).unwrap();
		for file in model_files(&config) {
			fs::write(root.join(file), b"").unwrap();
		}

		let registry = Arc::clone(&engine.registry);
		let pipeline = DiffusionPipeline::with_engine(Arc::new(engine), &root, config, options, Arc::new(TestTokenizer)).unwrap();
		Self { registry, root, pipeline }
	}
}

impl Drop for Fixture {
	fn drop(&mut self) {
		let _ = fs::remove_dir_all(&self.root);
	}
}

fn model_files(config: &PipelineConfig) -> Vec<&str> {
	let mut files = vec![config.text_encoder.path.as_str(), config.unet.path.as_str(), config.vae.decoder.as_str()];
	files.extend(config.vae.encoder.as_deref());
	files.extend(config.controlnet.as_ref().map(|c| c.path.as_str()));
	files.extend(config.prior.as_ref().map(|p| p.path.as_str()));
	files
}

pub fn image(width: usize, height: usize, value: f32) -> ArrayD<f32> {
	ArrayD::from_elem(IxDyn(&[1, 3, height, width]), value)
}
