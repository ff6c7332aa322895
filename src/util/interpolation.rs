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

//! Piecewise-linear interpolation over a sorted grid.

use ndarray::ArrayView1;

/// Index of the grid interval containing `x`, searching `[idx_low, idx_high]`.
fn bsearch(xarr: &ArrayView1<'_, f32>, x: f32, idx_low: usize, idx_high: usize) -> usize {
	let mut ilow = idx_low;
	let mut ihigh = idx_high;

	while ihigh > ilow + 1 {
		let i = (ihigh + ilow) / 2;
		if xarr[i] > x {
			ihigh = i;
		} else {
			ilow = i;
		}
	}
	ilow
}

/// Linear interpolator that caches the last interval, so monotone query sequences cost O(1) per lookup.
pub struct LinearInterpolatorAccelerated<'x, 'y> {
	x: ArrayView1<'x, f32>,
	y: ArrayView1<'y, f32>,
	cache: usize
}

impl<'x, 'y> LinearInterpolatorAccelerated<'x, 'y> {
	/// `x` must be sorted ascending and have the same length as `y`.
	pub fn new(x: ArrayView1<'x, f32>, y: ArrayView1<'y, f32>) -> Self {
		Self { x, y, cache: 0 }
	}

	fn find(&mut self, x: f32) -> usize {
		let xidx = self.cache;
		if x < self.x[xidx] {
			self.cache = bsearch(&self.x, x, 0, xidx);
		} else if x >= self.x[xidx + 1] {
			self.cache = bsearch(&self.x, x, xidx, self.x.len() - 1);
		}
		self.cache
	}

	/// Interpolated value at `x`, or `NaN` outside the grid.
	pub fn eval(&mut self, x: f32) -> f32 {
		if self.x.len() < 2 || x < self.x[0] || x > self.x[self.x.len() - 1] {
			return f32::NAN;
		}

		let idx = self.find(x);
		let (x_l, x_h) = (self.x[idx], self.x[idx + 1]);
		let (y_l, y_h) = (self.y[idx], self.y[idx + 1]);
		let dx = x_h - x_l;
		if dx > 0.0 { y_l + (x - x_l) / dx * (y_h - y_l) } else { f32::NAN }
	}
}
