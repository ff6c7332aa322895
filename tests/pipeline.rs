use std::sync::Mutex;

use diffusion_orchestrator::{
	create_scheduler, tiling::TileOptions, CancellationToken, Component, DiffusionError, DiffusionProgress, DiffusionScheduler, GenerateOptions,
	LowMemoryOptions, MemoryMode, ModelOptimization, OptimizationLevel, PipelineOptions, RunPhase, SchedulerType
};

mod common;
use common::{cascade_config, hidden_value, image, stable_diffusion_config, video_config, Fixture};

fn options(steps: usize, guidance_scale: f32) -> GenerateOptions {
	GenerateOptions::default()
		.with_prompt("photo of a red fox")
		.with_size(64, 64)
		.with_seed(42)
		.with_scheduler(SchedulerType::Euler)
		.with_steps(steps)
		.with_guidance_scale(guidance_scale)
}

/// Every notification as `(phase, step, total_steps)`.
fn record(events: &Mutex<Vec<(RunPhase, usize, usize)>>) -> impl FnMut(DiffusionProgress) + Send + '_ {
	move |progress| events.lock().unwrap().push((progress.phase, progress.step, progress.total_steps))
}

#[tokio::test]
async fn test_guidance_disabled_runs_primary_once_per_step() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let events = Mutex::new(Vec::new());
	let mut callback = record(&events);

	let output = fixture.pipeline.run(&options(4, 0.0), Some(&mut callback), &CancellationToken::new()).await.unwrap();

	assert_eq!(output.shape(), &[1, 3, 64, 64]);
	assert_eq!(fixture.registry.runs("unet.onnx"), 4);
	assert_eq!(fixture.registry.runs("text_encoder.onnx"), 1);
	assert_eq!(
		*events.lock().unwrap(),
		vec![
			(RunPhase::Denoise, 1, 4),
			(RunPhase::Denoise, 2, 4),
			(RunPhase::Denoise, 3, 4),
			(RunPhase::Denoise, 4, 4),
			(RunPhase::Decode, 1, 1)
		]
	);
}

#[tokio::test]
async fn test_guidance_doubles_primary_calls() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let events = Mutex::new(Vec::new());
	let mut callback = record(&events);

	fixture.pipeline.run(&options(4, 7.0), Some(&mut callback), &CancellationToken::new()).await.unwrap();

	assert_eq!(fixture.registry.runs("unet.onnx"), 8);
	// positive & negative prompt
	assert_eq!(fixture.registry.runs("text_encoder.onnx"), 2);
	assert_eq!(events.lock().unwrap().iter().filter(|(phase, ..)| *phase == RunPhase::Denoise).count(), 4);
}

#[tokio::test]
async fn test_guided_prediction_drives_the_first_step() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let latents = Mutex::new(Vec::new());
	let mut callback = |progress: DiffusionProgress| latents.lock().unwrap().extend(progress.latent);
	let options = options(4, 7.5).with_negative_prompt("blurry").with_latent_reporting(true);

	fixture.pipeline.run(&options, Some(&mut callback), &CancellationToken::new()).await.unwrap();

	let (cond, uncond) = (hidden_value("photo of a red fox"), hidden_value("blurry"));
	assert!((cond - uncond).abs() > 0.01);
	let mut scheduler = create_scheduler(SchedulerType::Euler, &fixture.pipeline.config().scheduler, 4, 42).unwrap();
	let sample = scheduler.create_random_sample(&[1, 4, 8, 8]);
	let timestep = scheduler.timesteps()[0];
	let guided = scheduler.scale_input(timestep, sample.view()).unwrap().mapv(|v| v * 0.1 + uncond + 7.5 * (cond - uncond));
	let expected = scheduler.step(timestep, guided.view(), sample.view()).unwrap().into_sample();

	let latents = latents.lock().unwrap();
	assert_eq!(latents.len(), 4);
	assert_eq!(latents[0].shape(), expected.shape());
	assert!(latents[0].iter().zip(expected.iter()).all(|(a, b)| (a - b).abs() < 1e-4));
}

#[tokio::test]
async fn test_cancel_mid_loop_unloads_models_loaded_for_run() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();
	let steps = Mutex::new(Vec::new());
	let cancel = token.clone();
	let mut callback = |progress: DiffusionProgress| {
		steps.lock().unwrap().push(progress.step);
		if progress.step == 2 {
			cancel.cancel();
		}
	};

	let result = fixture.pipeline.run(&options(4, 0.0), Some(&mut callback), &token).await;

	assert!(matches!(result, Err(DiffusionError::Cancelled)));
	assert_eq!(*steps.lock().unwrap(), vec![1, 2]);
	assert_eq!(fixture.registry.runs("unet.onnx"), 2);
	assert!(!fixture.pipeline.session(Component::Denoiser).unwrap().is_loaded());
	assert!(fixture.pipeline.resident().is_empty());
	assert_eq!(fixture.registry.live("unet.onnx"), 0);
	assert_eq!(fixture.registry.runs("vae_decoder.onnx"), 0);
}

#[tokio::test]
async fn test_cancel_keeps_models_loaded_before_run() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();
	fixture.pipeline.load(&token).await.unwrap();

	let cancel = token.clone();
	let mut callback = |progress: DiffusionProgress| {
		if progress.step == 1 {
			cancel.cancel();
		}
	};
	let result = fixture.pipeline.run(&options(4, 0.0), Some(&mut callback), &token).await;

	assert!(result.unwrap_err().is_cancelled());
	assert!(fixture.pipeline.session(Component::Denoiser).unwrap().is_loaded());
	assert_eq!(fixture.registry.loads("unet.onnx"), 1);

	token.reset();
	fixture.pipeline.run(&options(2, 0.0), None, &token).await.unwrap();
	assert_eq!(fixture.registry.loads("unet.onnx"), 1);
}

#[tokio::test]
async fn test_cancelled_load_leaves_nothing_resident() {
	let engine = common::MockEngine {
		load_delay: Some(std::time::Duration::from_secs(5)),
		..Default::default()
	};
	let mut fixture = Fixture::with_engine(engine, stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();
	let cancel = token.clone();
	tokio::spawn(async move {
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		cancel.cancel();
	});

	let result = fixture.pipeline.load(&token).await;

	assert!(result.unwrap_err().is_cancelled());
	assert!(fixture.pipeline.resident().is_empty());
}

#[tokio::test]
async fn test_prompt_cache_skips_text_encoder() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();

	fixture.pipeline.run(&options(1, 0.0), None, &token).await.unwrap();
	fixture.pipeline.run(&options(1, 0.0).with_seed(7), None, &token).await.unwrap();
	assert_eq!(fixture.registry.runs("text_encoder.onnx"), 1);

	fixture.pipeline.run(&options(1, 0.0).with_prompt("photo of a grey wolf"), None, &token).await.unwrap();
	assert_eq!(fixture.registry.runs("text_encoder.onnx"), 2);

	fixture.pipeline.unload();
	fixture.pipeline.run(&options(1, 0.0).with_prompt("photo of a grey wolf"), None, &token).await.unwrap();
	assert_eq!(fixture.registry.runs("text_encoder.onnx"), 3);
}

#[tokio::test]
async fn test_optimization_change_reloads() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();
	let fixed = ModelOptimization::new(OptimizationLevel::All).with_dimension_override("batch", 1);

	fixture.pipeline.run(&options(1, 0.0), None, &token).await.unwrap();
	fixture.pipeline.run(&options(1, 0.0), None, &token).await.unwrap();
	assert_eq!(fixture.registry.loads("unet.onnx"), 1);

	fixture.pipeline.run(&options(1, 0.0).with_optimization(Component::Denoiser, fixed.clone()), None, &token).await.unwrap();
	assert_eq!(fixture.registry.loads("unet.onnx"), 2);

	let relaxed = ModelOptimization::new(OptimizationLevel::Basic).with_dimension_override("batch", 1);
	fixture.pipeline.run(&options(1, 0.0).with_optimization(Component::Denoiser, relaxed), None, &token).await.unwrap();
	assert_eq!(fixture.registry.loads("unet.onnx"), 2);
	assert_eq!(fixture.registry.loads("vae_decoder.onnx"), 1);
}

#[tokio::test]
async fn test_unsupported_scheduler_fails_before_load() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());

	let result = fixture.pipeline.run(&options(4, 0.0).with_scheduler(SchedulerType::Kdpm2), None, &CancellationToken::new()).await;

	assert!(matches!(result, Err(DiffusionError::Configuration(_))));
	assert_eq!(fixture.registry.total_loads(), 0);
}

#[tokio::test]
async fn test_controlnet_without_image_fails_before_load() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let mut options = options(4, 0.0);
	options.control_scale = Some(1.0);

	let result = fixture.pipeline.run(&options, None, &CancellationToken::new()).await;

	assert!(matches!(result, Err(DiffusionError::Configuration(_))));
	assert_eq!(fixture.registry.total_loads(), 0);
}

#[tokio::test]
async fn test_controlnet_unsupported_by_family() {
	let mut fixture = Fixture::new(video_config(), PipelineOptions::default());
	let options = options(2, 0.0).with_scheduler(SchedulerType::FlowMatchEuler).with_controlnet(image(64, 64, 0.0), 1.0);

	let result = fixture.pipeline.run(&options, None, &CancellationToken::new()).await;

	assert!(matches!(result, Err(DiffusionError::Configuration(_))));
	assert_eq!(fixture.registry.total_loads(), 0);
}

#[tokio::test]
async fn test_missing_model_file() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	std::fs::remove_file(fixture.root.join("unet.onnx")).unwrap();

	let result = fixture.pipeline.run(&options(2, 0.0), None, &CancellationToken::new()).await;

	match result {
		Err(DiffusionError::ModelNotFound(path)) => assert!(path.ends_with("unet.onnx")),
		other => panic!("expected a missing model error, got {other:?}")
	}
	assert!(!fixture.pipeline.session(Component::Denoiser).unwrap().is_loaded());
}

#[tokio::test]
async fn test_minimum_memory_unloads_after_each_phase() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default().with_memory_mode(MemoryMode::Minimum));
	let token = CancellationToken::new();

	fixture.pipeline.load(&token).await.unwrap();
	assert_eq!(fixture.registry.total_loads(), 0);

	fixture.pipeline.run(&options(2, 0.0), None, &token).await.unwrap();
	assert!(fixture.pipeline.resident().is_empty());
	assert_eq!(fixture.registry.loads("unet.onnx"), 1);

	fixture.pipeline.run(&options(2, 0.0), None, &token).await.unwrap();
	assert_eq!(fixture.registry.loads("unet.onnx"), 2);
	assert_eq!(fixture.registry.loads("vae_decoder.onnx"), 2);
	// prompt unchanged, so the text encoder is not needed again
	assert_eq!(fixture.registry.loads("text_encoder.onnx"), 1);
}

#[tokio::test]
async fn test_per_run_low_memory_override() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();
	let low_memory = LowMemoryOptions {
		text_encoder: true,
		..LowMemoryOptions::default()
	};

	fixture.pipeline.run(&options(1, 0.0).with_low_memory(low_memory), None, &token).await.unwrap();

	let resident = fixture.pipeline.resident();
	assert!(!resident.contains(&Component::TextEncoder));
	assert!(resident.contains(&Component::Denoiser));
	assert!(resident.contains(&Component::VaeDecoder));
}

#[tokio::test]
async fn test_controlnet_residuals_reach_denoiser() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let options = options(3, 0.0).with_controlnet(image(64, 64, 1.0), 0.8);

	fixture.pipeline.run(&options, None, &CancellationToken::new()).await.unwrap();

	assert_eq!(fixture.registry.runs("controlnet.onnx"), 3);
	assert_eq!(fixture.registry.runs("unet.onnx"), 3);
	assert!(fixture.registry.last_inputs("unet.onnx").contains(&"mid_block_res_sample".to_owned()));
	assert!(fixture.pipeline.resident().contains(&Component::ControlNet));
}

#[tokio::test]
async fn test_low_memory_controlnet_swaps_with_denoiser() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let low_memory = LowMemoryOptions {
		compute: true,
		..LowMemoryOptions::default()
	};
	let options = options(2, 0.0).with_controlnet(image(64, 64, 1.0), 1.0).with_low_memory(low_memory);

	fixture.pipeline.run(&options, None, &CancellationToken::new()).await.unwrap();

	assert_eq!(fixture.registry.overlaps.load(std::sync::atomic::Ordering::SeqCst), 0);
	assert_eq!(fixture.registry.loads("controlnet.onnx"), 2);
	// one load per evaluation, none before the loop
	assert_eq!(fixture.registry.loads("unet.onnx"), 2);
	assert!(!fixture.pipeline.resident().contains(&Component::Denoiser));
	assert!(!fixture.pipeline.resident().contains(&Component::ControlNet));
}

#[tokio::test]
async fn test_img2img_encodes_once_and_truncates_schedule() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let token = CancellationToken::new();
	let events = Mutex::new(Vec::new());
	let options = options(4, 0.0).with_input_image(image(64, 64, 0.5), 0.5);

	let mut callback = record(&events);
	fixture.pipeline.run(&options, Some(&mut callback), &token).await.unwrap();
	assert_eq!(fixture.registry.runs("vae_encoder.onnx"), 1);
	assert_eq!(fixture.registry.runs("unet.onnx"), 2);
	assert_eq!(events.lock().unwrap()[0], (RunPhase::Denoise, 1, 2));

	fixture.pipeline.run(&options, None, &token).await.unwrap();
	assert_eq!(fixture.registry.runs("vae_encoder.onnx"), 1);

	let changed = options.clone().with_input_image(image(64, 64, 0.25), 0.5);
	fixture.pipeline.run(&changed, None, &token).await.unwrap();
	assert_eq!(fixture.registry.runs("vae_encoder.onnx"), 2);
}

#[tokio::test]
async fn test_img2img_rejects_strength_without_steps() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let options = options(4, 0.0).with_input_image(image(64, 64, 0.5), 0.1);

	let result = fixture.pipeline.run(&options, None, &CancellationToken::new()).await;

	assert!(matches!(result, Err(DiffusionError::Configuration(_))));
	assert_eq!(fixture.registry.total_loads(), 0);
}

#[tokio::test]
async fn test_heun_reports_each_visible_step_once() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let events = Mutex::new(Vec::new());
	let mut callback = record(&events);

	fixture.pipeline.run(&options(3, 0.0).with_scheduler(SchedulerType::Heun), Some(&mut callback), &CancellationToken::new()).await.unwrap();

	assert_eq!(fixture.registry.runs("unet.onnx"), 5);
	let steps: Vec<usize> = events.lock().unwrap().iter().filter(|(phase, ..)| *phase == RunPhase::Denoise).map(|(_, step, _)| *step).collect();
	assert_eq!(steps, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_cascaded_prior_feeds_decoder_stage() {
	let mut fixture = Fixture::new(cascade_config(), PipelineOptions::default());
	let events = Mutex::new(Vec::new());
	let mut callback = record(&events);
	let options = options(2, 0.0).with_prior(3, 0.0);

	let output = fixture.pipeline.run(&options, Some(&mut callback), &CancellationToken::new()).await.unwrap();

	assert_eq!(fixture.registry.runs("prior.onnx"), 3);
	assert_eq!(fixture.registry.runs("decoder.onnx"), 2);
	assert!(fixture.registry.last_inputs("decoder.onnx").contains(&"effnet".to_owned()));
	assert!(!fixture.registry.last_inputs("prior.onnx").contains(&"effnet".to_owned()));
	// ceil(64 / 42.67) = 2 prior latent pixels, x10 for the decoder stage, x8 through the VAE
	assert_eq!(output.shape(), &[1, 3, 160, 160]);

	let phases: Vec<RunPhase> = events.lock().unwrap().iter().map(|(phase, ..)| *phase).collect();
	assert_eq!(phases, vec![RunPhase::Prior, RunPhase::Prior, RunPhase::Prior, RunPhase::Denoise, RunPhase::Denoise, RunPhase::Decode]);
}

#[tokio::test]
async fn test_video_latents_compress_frames() {
	let mut fixture = Fixture::new(video_config(), PipelineOptions::default());
	let options = options(2, 0.0).with_scheduler(SchedulerType::FlowMatchEuler).with_frames(9);

	let output = fixture.pipeline.run(&options, None, &CancellationToken::new()).await.unwrap();

	assert_eq!(output.shape(), &[1, 3, 3, 64, 64]);
}

fn video_img2img_config(latent_channels: usize) -> serde_json::Value {
	let mut config = video_config();
	config["vae"]["encoder"] = "vae_encoder.onnx".into();
	config["vae"]["latent-channels"] = latent_channels.into();
	config
}

#[tokio::test]
async fn test_video_img2img_repeats_the_encoded_frame() {
	let mut fixture = Fixture::new(video_img2img_config(4), PipelineOptions::default());
	let options = options(4, 0.0).with_frames(9).with_input_image(image(64, 64, 0.5), 0.5);

	let output = fixture.pipeline.run(&options, None, &CancellationToken::new()).await.unwrap();

	assert_eq!(output.shape(), &[1, 3, 3, 64, 64]);
	assert_eq!(fixture.registry.runs("vae_encoder.onnx"), 1);
	assert_eq!(fixture.registry.runs("transformer.onnx"), 2);
}

#[tokio::test]
async fn test_video_img2img_rejects_mismatched_source() {
	// the mock encoder always produces 4 latent channels
	let mut fixture = Fixture::new(video_img2img_config(16), PipelineOptions::default());
	let options = options(4, 0.0).with_frames(9).with_input_image(image(64, 64, 0.5), 0.5);

	let err = fixture.pipeline.run(&options, None, &CancellationToken::new()).await.unwrap_err();

	assert!(matches!(err, DiffusionError::Scheduler(_)), "{err}");
	assert_eq!(fixture.registry.runs("transformer.onnx"), 0);
}

#[tokio::test]
async fn test_tiled_decode_runs_decoder_per_tile() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let options = options(1, 0.0).with_vae_tiling(TileOptions { max_tile_size: 5, overlap: 1 });

	let output = fixture.pipeline.run(&options, None, &CancellationToken::new()).await.unwrap();

	assert_eq!(fixture.registry.runs("vae_decoder.onnx"), 4);
	assert_eq!(output.shape(), &[1, 3, 64, 64]);
}

#[tokio::test]
async fn test_size_is_rounded_to_vae_scale() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());

	let output = fixture.pipeline.run(&options(1, 0.0).with_size(70, 45), None, &CancellationToken::new()).await.unwrap();

	assert_eq!(output.shape(), &[1, 3, 40, 64]);
}

#[tokio::test]
async fn test_step_latents_are_reported_on_request() {
	let mut fixture = Fixture::new(stable_diffusion_config(), PipelineOptions::default());
	let shapes = Mutex::new(Vec::new());
	let mut callback = |progress: DiffusionProgress| shapes.lock().unwrap().push(progress.latent.map(|l| l.shape().to_vec()));

	fixture.pipeline.run(&options(2, 0.0).with_latent_reporting(true), Some(&mut callback), &CancellationToken::new()).await.unwrap();

	assert_eq!(*shapes.lock().unwrap(), vec![Some(vec![1, 4, 8, 8]), Some(vec![1, 4, 8, 8]), None]);
}
