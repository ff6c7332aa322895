//! Encoding of source media into latent space & decoding of latents back to media.

use ndarray::{ArrayD, ArrayViewD};
use tracing::debug;

use crate::{
	config::VAEConfig,
	session::SessionInputs,
	tiling::{process_tiled, TileOptions},
	CancellationToken, ModelOptimization, ModelSession, Result
};

/// The last image encoded by a [`LatentCodec`], together with its latent.
#[derive(Debug, Clone, Default)]
pub struct EncoderCache {
	entry: Option<(ArrayD<f32>, ArrayD<f32>)>
}

impl EncoderCache {
	/// Returns `true` if `image` is bit-for-bit identical to the cached image.
	pub fn is_valid(&self, image: ArrayViewD<'_, f32>) -> bool {
		match &self.entry {
			Some((cached, _)) => cached.shape() == image.shape() && cached.iter().zip(image.iter()).all(|(a, b)| a.to_bits() == b.to_bits()),
			None => false
		}
	}

	/// Returns the cached latent if it was encoded from `image`.
	pub fn get(&self, image: ArrayViewD<'_, f32>) -> Option<&ArrayD<f32>> {
		if self.is_valid(image) { self.entry.as_ref().map(|(_, latent)| latent) } else { None }
	}

	/// Replaces the cache entry.
	pub fn store(&mut self, image: ArrayD<f32>, latent: ArrayD<f32>) {
		self.entry = Some((image, latent));
	}

	/// Empties the cache.
	pub fn clear(&mut self) {
		self.entry = None;
	}
}

/// Moves tensors between pixel space and the autoencoder's latent space.
///
/// Encoding applies `(latent - shift_factor) * scaling_factor` and decoding the inverse, so the denoising loop always
/// sees unit-variance latents. Sessions are borrowed from the pipeline, which decides their residency; the codec loads
/// them on demand if they are not resident when called.
#[derive(Debug)]
pub struct LatentCodec {
	scaling_factor: f32,
	shift_factor: f32,
	scale_factor: usize,
	encoder_input: String,
	decoder_input: String,
	cache: EncoderCache
}

impl LatentCodec {
	/// Creates a codec for the autoencoder described by `config`.
	pub fn new(config: &VAEConfig) -> Self {
		Self {
			scaling_factor: config.scaling_factor,
			shift_factor: config.shift_factor,
			scale_factor: config.scale_factor,
			encoder_input: config.encoder_input.clone(),
			decoder_input: config.decoder_input.clone(),
			cache: EncoderCache::default()
		}
	}

	/// Spatial downscaling between pixels & latents.
	pub fn scale_factor(&self) -> usize {
		self.scale_factor
	}

	/// The encoder cache.
	pub fn cache(&self) -> &EncoderCache {
		&self.cache
	}

	/// Returns `true` if encoding `image` would be served from the cache.
	pub fn is_cached(&self, image: ArrayViewD<'_, f32>) -> bool {
		self.cache.is_valid(image)
	}

	/// Drops the cached encoding.
	pub fn clear_cache(&mut self) {
		self.cache.clear();
	}

	/// Encodes a `[batch, 3, height, width]` image in `[-1, 1]` to a scaled latent.
	///
	/// # Errors
	/// Propagates load & inference errors from `encoder`.
	pub async fn encode(
		&mut self,
		encoder: &mut ModelSession,
		optimization: Option<&ModelOptimization>,
		image: ArrayViewD<'_, f32>,
		token: &CancellationToken
	) -> Result<ArrayD<f32>> {
		if let Some(latent) = self.cache.get(image.view()) {
			debug!("encoder cache hit");
			return Ok(latent.clone());
		}

		encoder.load(optimization, token).await?;
		let inputs = SessionInputs::new().with(self.encoder_input.as_str(), image.to_owned());
		let mut latent = encoder.run(inputs, token).await?.into_first()?;
		let (shift, scale) = (self.shift_factor, self.scaling_factor);
		latent.par_mapv_inplace(|v| (v - shift) * scale);

		self.cache.store(image.to_owned(), latent.clone());
		Ok(latent)
	}

	/// Decodes a scaled latent back to pixel space, optionally in tiles.
	///
	/// `tiling` is expressed in latent pixels. Each decoded tile is `scale_factor` times larger than its latent tile.
	///
	/// # Errors
	/// Propagates load & inference errors from `decoder` and tiling errors.
	pub async fn decode(
		&self,
		decoder: &mut ModelSession,
		optimization: Option<&ModelOptimization>,
		latent: ArrayD<f32>,
		tiling: Option<TileOptions>,
		token: &CancellationToken
	) -> Result<ArrayD<f32>> {
		decoder.load(optimization, token).await?;

		let mut latent = latent;
		let (shift, scale) = (self.shift_factor, self.scaling_factor);
		latent.par_mapv_inplace(|v| v / scale + shift);

		let decoder: &ModelSession = decoder;
		let input = self.decoder_input.as_str();
		match tiling {
			Some(options) => {
				process_tiled(latent, options, |tile| async move {
					let inputs = SessionInputs::new().with(input, tile);
					decoder.run(inputs, token).await?.into_first()
				})
				.await
			}
			None => decoder.run(SessionInputs::new().with(input, latent), token).await?.into_first()
		}
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{ArrayD, IxDyn};

	use super::EncoderCache;

	#[test]
	fn test_cache_requires_identical_bits() {
		let image = ArrayD::from_shape_fn(IxDyn(&[1, 3, 4, 4]), |d| d[2] as f32 * 0.25 - d[3] as f32 * 0.1);
		let latent = ArrayD::<f32>::ones(IxDyn(&[1, 4, 1, 1]));

		let mut cache = EncoderCache::default();
		assert!(!cache.is_valid(image.view()));
		cache.store(image.clone(), latent.clone());
		assert!(cache.is_valid(image.view()));
		assert_eq!(cache.get(image.view()), Some(&latent));

		let mut changed = image.clone();
		changed[[0, 2, 3, 1]] = f32::from_bits(changed[[0, 2, 3, 1]].to_bits() ^ 1);
		assert!(!cache.is_valid(changed.view()));

		let reshaped = image.clone().into_shape(IxDyn(&[1, 3, 2, 8])).unwrap();
		assert!(!cache.is_valid(reshaped.view()));
	}

	#[test]
	fn test_negative_zero_is_a_different_image() {
		let mut cache = EncoderCache::default();
		cache.store(ArrayD::from_elem(IxDyn(&[1, 1]), 0.0), ArrayD::zeros(IxDyn(&[1])));
		assert!(!cache.is_valid(ArrayD::from_elem(IxDyn(&[1, 1]), -0.0_f32).view()));
		cache.clear();
		assert!(cache.get(ArrayD::from_elem(IxDyn(&[1, 1]), 0.0_f32).view()).is_none());
	}
}
