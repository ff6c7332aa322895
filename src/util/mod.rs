//! Numeric & image helpers shared by the schedulers and pipelines.

pub mod image;
pub(crate) mod interpolation;
pub(crate) mod quadrature;

pub use self::image::{image_to_tensor, tensor_to_images, ImageResize};
