//! Spatial indexing abstractions for neighborhood queries.
//!
//! Indices are rebuilt from scratch once per tick; per-tick movement
//! invalidates any incremental structure, so there is no removal API.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from entry positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit entries within the squared radius of the stored entry `entry_idx`,
    /// excluding the entry itself.
    fn neighbors_within(
        &self,
        entry_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );

    /// Visit entries within the squared radius of an arbitrary point.
    fn neighbors_near(
        &self,
        x: f32,
        y: f32,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid hashing entries into `floor(p / cell_size)` buckets.
///
/// Queries walk every occupied bucket within a Chebyshev cell radius and
/// yield candidates with their exact squared distance; callers filter or
/// rank as needed. This turns pairwise proximity scans over the whole
/// population into work proportional to local density.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing entries.
    pub cell_size: f32,
    #[serde(skip)]
    buckets: HashMap<(i32, i32), Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            buckets: HashMap::new(),
            positions: Vec::new(),
        }
    }

    /// Number of entries captured by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when the last rebuild captured no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[inline]
    fn cell_of(&self, x: f32, y: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }

    fn visit_cells(
        &self,
        x: f32,
        y: f32,
        radius_sq: f32,
        skip: Option<usize>,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius_sq < 0.0 || self.positions.is_empty() {
            return;
        }
        let radius = radius_sq.sqrt();
        let range = (radius / self.cell_size).ceil() as i32;
        let (cx, cy) = self.cell_of(x, y);
        for dx in -range..=range {
            for dy in -range..=range {
                let Some(bucket) = self.buckets.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &idx in bucket {
                    if skip == Some(idx) {
                        continue;
                    }
                    let (px, py) = self.positions[idx];
                    let dist_sq = (px - x) * (px - x) + (py - y) * (py - y);
                    if dist_sq <= radius_sq {
                        visitor(idx, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(25.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let cell = self.cell_of(x, y);
            self.buckets.entry(cell).or_default().push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        entry_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(&(x, y)) = self.positions.get(entry_idx) else {
            return;
        };
        self.visit_cells(x, y, radius_sq, Some(entry_idx), visitor);
    }

    fn neighbors_near(
        &self,
        x: f32,
        y: f32,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        self.visit_cells(x, y, radius_sq, None, visitor);
    }
}
