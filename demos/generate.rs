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

use std::{env, sync::Arc};

use diffusion_orchestrator::{
	util::tensor_to_images, ArenaExtendStrategy, CUDADeviceOptions, CancellationToken, DeviceCatalog, DiffusionDevice, DiffusionDeviceControl,
	DiffusionPipeline, DiffusionProgress, GenerateOptions, MemoryMode, OrtEnvironment, PipelineOptions, RunPhase, SchedulerType
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

	let mut args = env::args().skip(1);
	let root = args.next().ok_or_else(|| anyhow::anyhow!("expected a path to a converted model as the first argument"))?;
	let prompt = args.next().unwrap_or_else(|| "photo of a red fox".to_string());
	let low_memory = args.any(|a| a == "--low-memory");

	let catalog = DeviceCatalog::new(Arc::new(OrtEnvironment::builder().with_name("diffusion-orchestrator").build()?));
	let options = PipelineOptions::default()
		.with_devices(DiffusionDeviceControl {
			denoiser: DiffusionDevice::CUDA(
				0,
				Some(CUDADeviceOptions {
					memory_limit: Some(3000000000),
					arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested),
					..Default::default()
				})
			),
			..Default::default()
		})
		.with_memory_mode(if low_memory { MemoryMode::Minimum } else { MemoryMode::Maximum });
	let mut pipeline = DiffusionPipeline::new(&catalog, root, options)?;

	let token = CancellationToken::new();
	let cancel = token.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			cancel.cancel();
		}
	});

	pipeline.load(&token).await?;

	let scheduler = pipeline.config().schedulers.first().copied().unwrap_or(SchedulerType::Euler);
	let options = GenerateOptions::default().with_prompt(prompt).with_scheduler(scheduler).with_steps(20);
	let mut progress = |progress: DiffusionProgress| match progress.phase {
		RunPhase::Decode => info!("decoded"),
		phase => info!(?phase, "step {}/{}", progress.step, progress.total_steps)
	};
	let output = match pipeline.run(&options, Some(&mut progress), &token).await {
		Ok(output) => output,
		Err(e) if e.is_cancelled() => {
			info!("cancelled");
			return Ok(());
		}
		Err(e) => return Err(e.into())
	};

	tensor_to_images(output.view())?.remove(0).into_rgb8().save("result.png")?;
	info!("saved result.png");
	Ok(())
}
