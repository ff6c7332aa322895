//! Conversion between images & normalized `NCHW` tensors.

use image::{imageops::FilterType, DynamicImage, Rgb32FImage};
use ndarray::{Array4, ArrayViewD, Axis, Ix4};
use serde::{Deserialize, Serialize};

use crate::{DiffusionError, Result};

/// How a source image is fitted to the target resolution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageResize {
	/// Resize to exactly the target size, ignoring aspect ratio.
	Stretch,
	/// Preserve aspect ratio & cover the target, cropping the overflow.
	#[default]
	Crop,
	/// Preserve aspect ratio & fit inside the target, padding the remainder with black.
	Letterbox
}

fn fit(image: &DynamicImage, width: u32, height: u32, resize: ImageResize) -> Rgb32FImage {
	match resize {
		ImageResize::Stretch => image.resize_exact(width, height, FilterType::Lanczos3).to_rgb32f(),
		ImageResize::Crop => image.resize_to_fill(width, height, FilterType::Lanczos3).to_rgb32f(),
		ImageResize::Letterbox => {
			let resized = image.resize(width, height, FilterType::Lanczos3).to_rgb32f();
			let mut canvas = Rgb32FImage::new(width, height);
			let x = (width - resized.width()) / 2;
			let y = (height - resized.height()) / 2;
			image::imageops::overlay(&mut canvas, &resized, i64::from(x), i64::from(y));
			canvas
		}
	}
}

/// Converts an image to a `[1, 3, height, width]` tensor with values in `[-1, 1]`.
pub fn image_to_tensor(image: &DynamicImage, width: u32, height: u32, resize: ImageResize) -> Array4<f32> {
	let image = fit(image, width, height, resize);
	Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| image.get_pixel(x as u32, y as u32).0[c] * 2.0 - 1.0)
}

/// Converts a `[batch, 3, height, width]` tensor with values in `[-1, 1]` into one image per batch entry.
///
/// # Errors
/// Returns a shape error if the tensor is not 4-dimensional, or a configuration error if it does not have 3 channels.
pub fn tensor_to_images(tensor: ArrayViewD<'_, f32>) -> Result<Vec<DynamicImage>> {
	let tensor = tensor.into_dimensionality::<Ix4>()?;
	if tensor.shape()[1] != 3 {
		return Err(DiffusionError::config(format!("expected an RGB tensor, got {} channels", tensor.shape()[1])));
	}
	let (height, width) = (tensor.shape()[2], tensor.shape()[3]);

	let mut images = Vec::with_capacity(tensor.shape()[0]);
	for chunk in tensor.axis_iter(Axis(0)) {
		// chw -> hwc
		let hwc = chunk.permuted_axes([1, 2, 0]);
		let raw = hwc.iter().map(|f| (f / 2.0 + 0.5).clamp(0.0, 1.0)).collect::<Vec<_>>();
		let image = Rgb32FImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| anyhow::anyhow!("failed to construct image"))?;
		images.push(DynamicImage::ImageRgb32F(image));
	}
	Ok(images)
}

#[cfg(test)]
mod tests {
	use image::{DynamicImage, Rgb, RgbImage};

	use super::{image_to_tensor, tensor_to_images, ImageResize};

	fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
		DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
	}

	#[test]
	fn test_tensor_is_normalized_nchw() {
		let tensor = image_to_tensor(&solid(16, 8, 255), 8, 4, ImageResize::Stretch);
		assert_eq!(tensor.shape(), &[1, 3, 4, 8]);
		assert!(tensor.iter().all(|v| (v - 1.0).abs() < 1e-5));
	}

	#[test]
	fn test_letterbox_pads_with_black() {
		let tensor = image_to_tensor(&solid(16, 8, 255), 16, 16, ImageResize::Letterbox);
		assert_eq!(tensor[[0, 0, 0, 8]], -1.0);
		assert!((tensor[[0, 0, 8, 8]] - 1.0).abs() < 1e-5);
	}

	#[test]
	fn test_tensor_to_images_roundtrips_size() {
		let tensor = image_to_tensor(&solid(6, 4, 0), 6, 4, ImageResize::Crop).into_dyn();
		let images = tensor_to_images(tensor.view()).unwrap();
		assert_eq!(images.len(), 1);
		assert_eq!((images[0].width(), images[0].height()), (6, 4));
	}
}
