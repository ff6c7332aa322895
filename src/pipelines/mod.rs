//! Diffusion pipelines & the components they are assembled from.

mod controlnet;
mod diffusion;
mod latent_codec;
mod prompt;
mod residency;

pub use self::controlnet::SecondaryConditioner;
pub use self::diffusion::*;
pub use self::latent_codec::{EncoderCache, LatentCodec};
pub use self::prompt::{PromptConditioner, PromptResult, PromptTokenizer, TokenizedPrompt};
pub use self::residency::{Component, LowMemoryOptions, Phase, ResidencyPlan};
