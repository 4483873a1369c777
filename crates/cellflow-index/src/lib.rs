//! Spatial indexing abstractions for rectangle queries over universe positions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by spatial indices.
pub trait SpatialIndex {
    /// Rebuild internal structures from entity positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit every entity whose position lies inside the closed rectangle `[min, max]`.
    fn query_rect(&self, min: (f32, f32), max: (f32, f32), visitor: &mut dyn FnMut(usize));
}

/// Uniform bucket grid covering a `width x height` universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each bucket.
    pub cell_size: f32,
    /// Universe extent along x.
    pub width: f32,
    /// Universe extent along y.
    pub height: f32,
    #[serde(skip)]
    cols: usize,
    #[serde(skip)]
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new grid with the provided bucket size and extents.
    #[must_use]
    pub fn new(cell_size: f32, width: f32, height: f32) -> Self {
        Self {
            cell_size,
            width,
            height,
            cols: 0,
            rows: 0,
            buckets: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Number of positions captured by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn bucket_coord(&self, value: f32, extent_buckets: usize) -> usize {
        if !value.is_finite() || value <= 0.0 {
            return 0;
        }
        let coord = (value / self.cell_size) as usize;
        coord.min(extent_buckets.saturating_sub(1))
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0, 1_000.0, 1_000.0)
    }
}

impl SpatialIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if !(self.width > 0.0 && self.height > 0.0) {
            return Err(IndexError::InvalidConfig("extents must be positive"));
        }
        self.cols = ((self.width / self.cell_size).ceil() as usize).max(1);
        self.rows = ((self.height / self.cell_size).ceil() as usize).max(1);
        let bucket_count = self.cols * self.rows;
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.buckets.resize_with(bucket_count, Vec::new);

        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let col = self.bucket_coord(x, self.cols);
            let row = self.bucket_coord(y, self.rows);
            self.buckets[row * self.cols + col].push(idx);
        }
        Ok(())
    }

    fn query_rect(&self, min: (f32, f32), max: (f32, f32), visitor: &mut dyn FnMut(usize)) {
        if self.buckets.is_empty() || min.0 > max.0 || min.1 > max.1 {
            return;
        }
        let col_lo = self.bucket_coord(min.0, self.cols);
        let col_hi = self.bucket_coord(max.0, self.cols);
        let row_lo = self.bucket_coord(min.1, self.rows);
        let row_hi = self.bucket_coord(max.1, self.rows);
        for row in row_lo..=row_hi {
            for col in col_lo..=col_hi {
                for &idx in &self.buckets[row * self.cols + col] {
                    let (x, y) = self.positions[idx];
                    if x >= min.0 && x <= max.0 && y >= min.1 && y <= max.1 {
                        visitor(idx);
                    }
                }
            }
        }
    }
}
