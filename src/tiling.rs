//! Splitting of oversized spatial tensors into overlapping quadrants, and their recomposition.
//!
//! Tensors are laid out with their two spatial axes last (`[..., height, width]`). A processed tile may change every
//! leading axis (e.g. 4 latent channels in, 3 image channels out) and may scale both spatial axes by the same
//! integer factor; [`ImageTiles::join`] infers that factor from the tile shapes.

use std::{future::Future, ops::Range};

use ndarray::{ArrayD, ArrayViewD, IxDyn, SliceInfoElem, Zip};
use tracing::debug;

use crate::{DiffusionError, Result};

/// The source region of one quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
	/// First row.
	pub y: usize,
	/// First column.
	pub x: usize,
	/// Number of rows.
	pub height: usize,
	/// Number of columns.
	pub width: usize
}

/// Overlapping tiles of a tensor in row-major order: four quadrants, or two halves when only one axis is split.
#[derive(Debug, Clone)]
pub struct ImageTiles {
	/// Width of the source tensor.
	pub width: usize,
	/// Height of the source tensor.
	pub height: usize,
	/// Overlap applied towards the interior edges as `(rows, columns)`, after clamping. Zero for an unsplit axis.
	pub overlap: (usize, usize),
	/// Source regions of the tiles.
	pub regions: Vec<TileRegion>,
	/// The tile tensors.
	pub tiles: Vec<ArrayD<f32>>
}

fn spatial_dims(shape: &[usize]) -> Result<(usize, usize)> {
	match shape {
		[.., h, w] if shape.len() >= 2 => Ok((*h, *w)),
		_ => Err(DiffusionError::config(format!("tiling needs a tensor with two spatial axes, got {shape:?}")))
	}
}

fn spatial_slice(ndim: usize, rows: Range<usize>, cols: Range<usize>) -> Vec<SliceInfoElem> {
	let mut info = vec![SliceInfoElem::from(..); ndim - 2];
	info.push(SliceInfoElem::from(rows));
	info.push(SliceInfoElem::from(cols));
	info
}

/// The ranges one axis is cut into, with the overlap clamped to this axis. Axes shorter than 2 are never cut.
fn halves(len: usize, overlap: usize, split: bool) -> (usize, Vec<Range<usize>>) {
	if !split || len < 2 {
		return (0, vec![0..len]);
	}
	let half = len / 2;
	let overlap = overlap.min(half);
	(overlap, vec![0..(half + overlap).min(len), half - overlap..len])
}

impl ImageTiles {
	/// Splits `tensor` into four quadrants, each extended by `overlap` pixels towards the interior edges.
	///
	/// # Errors
	/// Returns a configuration error if `tensor` has fewer than two axes.
	pub fn split(tensor: ArrayViewD<'_, f32>, overlap: usize) -> Result<Self> {
		Self::split_axes(tensor, overlap, true, true)
	}

	/// Splits `tensor` along the selected spatial axes. An axis shorter than 2 is left whole.
	///
	/// # Errors
	/// Returns a configuration error if `tensor` has fewer than two axes.
	pub fn split_axes(tensor: ArrayViewD<'_, f32>, overlap: usize, split_rows: bool, split_cols: bool) -> Result<Self> {
		let (height, width) = spatial_dims(tensor.shape())?;
		let (overlap_y, row_ranges) = halves(height, overlap, split_rows);
		let (overlap_x, col_ranges) = halves(width, overlap, split_cols);

		let mut regions = Vec::with_capacity(row_ranges.len() * col_ranges.len());
		let mut tiles = Vec::with_capacity(regions.capacity());
		for rows in &row_ranges {
			for cols in &col_ranges {
				regions.push(TileRegion {
					y: rows.start,
					x: cols.start,
					height: rows.len(),
					width: cols.len()
				});
				let info = spatial_slice(tensor.ndim(), rows.clone(), cols.clone());
				tiles.push(tensor.slice(info.as_slice()).to_owned());
			}
		}

		Ok(Self {
			width,
			height,
			overlap: (overlap_y, overlap_x),
			regions,
			tiles
		})
	}

	/// Replaces the tile tensors, keeping the source layout.
	pub fn with_tiles(self, tiles: Vec<ArrayD<f32>>) -> Self {
		Self { tiles, ..self }
	}

	fn scale_factor(&self) -> Result<usize> {
		if self.tiles.len() != self.regions.len() {
			return Err(DiffusionError::config(format!("expected {} tiles, got {}", self.regions.len(), self.tiles.len())));
		}
		let mut scale = None;
		for (tile, region) in self.tiles.iter().zip(&self.regions) {
			let (h, w) = spatial_dims(tile.shape())?;
			let valid = region.height > 0 && region.width > 0 && h % region.height == 0 && w % region.width == 0;
			let (sy, sx) = if valid { (h / region.height, w / region.width) } else { (0, 0) };
			if sy == 0 || sy != sx || scale.map_or(false, |s| s != sy) {
				return Err(DiffusionError::config(format!("tile of shape {:?} does not scale its {region:?} source uniformly", tile.shape())));
			}
			scale = Some(sy);
		}
		scale.ok_or_else(|| DiffusionError::config("no tiles to join"))
	}

	/// Recomposes the tiles into one tensor, averaging every contribution in overlap regions.
	///
	/// # Errors
	/// Returns a configuration error if the tiles disagree on their leading axes or on the spatial scale factor.
	pub fn join(&self) -> Result<ArrayD<f32>> {
		let scale = self.scale_factor()?;
		let leading = &self.tiles[0].shape()[..self.tiles[0].ndim() - 2];
		if self.tiles.iter().any(|t| &t.shape()[..t.ndim() - 2] != leading) {
			return Err(DiffusionError::config("tiles disagree on their leading dimensions"));
		}

		let mut shape = leading.to_vec();
		shape.extend([self.height * scale, self.width * scale]);
		let mut sum = ArrayD::<f32>::zeros(IxDyn(&shape));
		let mut count = ArrayD::<f32>::zeros(IxDyn(&shape));
		for (tile, region) in self.tiles.iter().zip(&self.regions) {
			let rows = region.y * scale..(region.y + region.height) * scale;
			let cols = region.x * scale..(region.x + region.width) * scale;
			let info = spatial_slice(shape.len(), rows, cols);
			let mut sum_region = sum.slice_mut(info.as_slice());
			sum_region += tile;
			let mut count_region = count.slice_mut(info.as_slice());
			count_region += 1.0;
		}
		Zip::from(&mut sum).and(&count).par_for_each(|s, c| {
			if *c > 1.0 {
				*s /= *c;
			}
		});
		Ok(sum)
	}
}

/// Limits for recursive tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileOptions {
	/// Maximum height & width of a leaf tile.
	pub max_tile_size: usize,
	/// Overlap of neighbouring quadrants, in source pixels.
	pub overlap: usize
}

enum TileTree {
	Leaf(usize),
	Split(Box<ImageTiles>, Vec<TileTree>)
}

fn plan(tensor: ArrayD<f32>, options: &TileOptions, depth: usize, leaves: &mut Vec<ArrayD<f32>>) -> Result<TileTree> {
	let (height, width) = spatial_dims(tensor.shape())?;
	let (split_rows, split_cols) = (height > options.max_tile_size, width > options.max_tile_size);
	if !split_rows && !split_cols {
		leaves.push(tensor);
		return Ok(TileTree::Leaf(leaves.len() - 1));
	}
	debug!(depth, height, width, "splitting tile");
	let mut tiles = ImageTiles::split_axes(tensor.view(), options.overlap, split_rows, split_cols)?;
	let children = std::mem::take(&mut tiles.tiles)
		.into_iter()
		.map(|tile| plan(tile, options, depth + 1, leaves))
		.collect::<Result<Vec<_>>>()?;
	Ok(TileTree::Split(Box::new(tiles), children))
}

fn assemble(tree: TileTree, outputs: &mut [Option<ArrayD<f32>>]) -> Result<ArrayD<f32>> {
	match tree {
		TileTree::Leaf(index) => outputs
			.get_mut(index)
			.and_then(Option::take)
			.ok_or_else(|| DiffusionError::config(format!("tile {index} has no output"))),
		TileTree::Split(tiles, children) => {
			let joined = children.into_iter().map(|child| assemble(child, outputs)).collect::<Result<Vec<_>>>()?;
			tiles.with_tiles(joined).join()
		}
	}
}

/// Runs `process` over `tensor`, splitting it recursively until every tile fits in `options.max_tile_size`, then
/// joining the processed tiles bottom-up. Tiles are processed one at a time, in order.
///
/// # Errors
/// Returns a configuration error if the overlap leaves no room for splitting to shrink a tile, and propagates any
/// error from `process`.
pub async fn process_tiled<F, Fut>(tensor: ArrayD<f32>, options: TileOptions, mut process: F) -> Result<ArrayD<f32>>
where
	F: FnMut(ArrayD<f32>) -> Fut,
	Fut: Future<Output = Result<ArrayD<f32>>>
{
	if options.max_tile_size <= options.overlap * 2 {
		return Err(DiffusionError::config(format!(
			"tile size ({}) must exceed twice the overlap ({})",
			options.max_tile_size, options.overlap
		)));
	}
	let mut leaves = Vec::new();
	let tree = plan(tensor, &options, 0, &mut leaves)?;
	let mut outputs = Vec::with_capacity(leaves.len());
	for leaf in leaves {
		outputs.push(Some(process(leaf).await?));
	}
	assemble(tree, &mut outputs)
}
