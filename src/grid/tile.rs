//! Tile buffers and the grid capability traits the simulation is generic over.

use glam::IVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest tile the simulation accepts. The thermal filter needs at least one
/// interior 2x2 block.
pub const MIN_RESOLUTION: usize = 4;

/// Errors raised while building or resizing a tile.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TileError {
    #[error("Invalid resolution {0}: tiles must be at least {MIN_RESOLUTION} cells wide")]
    InvalidResolution(usize),
    #[error("Buffer length {actual} does not match resolution {resolution} ({expected} cells)")]
    LengthMismatch {
        resolution: usize,
        expected: usize,
        actual: usize,
    },
}

/// Read access to a square grid of cells indexed by `z * resolution + x`.
///
/// Only `resolution` and `height` are required; the water buffers default to
/// dry so plain heightfields can be fed to the pool solver.
pub trait ReadableGrid {
    fn resolution(&self) -> usize;

    fn height(&self, idx: usize) -> f32;

    fn pool(&self, _idx: usize) -> f32 {
        0.0
    }

    fn flow(&self, _idx: usize) -> f32 {
        0.0
    }

    fn track(&self, _idx: usize) -> f32 {
        0.0
    }

    fn plants(&self, _idx: usize) -> f32 {
        0.0
    }

    fn cell_count(&self) -> usize {
        self.resolution() * self.resolution()
    }

    /// Index of an in-bounds coordinate.
    #[inline]
    fn idx(&self, x: i32, z: i32) -> usize {
        debug_assert!(self.in_bounds(x, z));
        z as usize * self.resolution() + x as usize
    }

    /// Coordinate of an index, `x` in `.x` and `z` in `.y`.
    #[inline]
    fn pos(&self, idx: usize) -> IVec2 {
        let res = self.resolution();
        IVec2::new((idx % res) as i32, (idx / res) as i32)
    }

    #[inline]
    fn in_bounds(&self, x: i32, z: i32) -> bool {
        let res = self.resolution() as i32;
        x >= 0 && z >= 0 && x < res && z < res
    }

    /// Index with both coordinates clamped into the tile.
    #[inline]
    fn safe_idx(&self, x: i32, z: i32) -> usize {
        let max = self.resolution() as i32 - 1;
        self.idx(x.clamp(0, max), z.clamp(0, max))
    }

    #[inline]
    fn checked_idx(&self, x: i32, z: i32) -> Option<usize> {
        self.in_bounds(x, z).then(|| self.idx(x, z))
    }

    /// True for cells on the outer ring of the tile.
    #[inline]
    fn on_edge(&self, idx: usize) -> bool {
        let p = self.pos(idx);
        let max = self.resolution() as i32 - 1;
        p.x == 0 || p.y == 0 || p.x == max || p.y == max
    }

    /// Normalized height including standing water.
    #[inline]
    fn water_inclusive(&self, idx: usize) -> f32 {
        self.height(idx) + self.pool(idx)
    }

    #[inline]
    fn standing_water(&self, idx: usize) -> bool {
        self.pool(idx) > 0.0
    }
}

/// Write access to the per-cell buffers.
pub trait WritableGrid {
    fn set_height(&mut self, idx: usize, value: f32);
    fn set_pool(&mut self, idx: usize, value: f32);
    fn set_flow(&mut self, idx: usize, value: f32);
    fn set_track(&mut self, idx: usize, value: f32);
}

/// Grids that can be both read and written, for the single-threaded commit phases.
pub trait ReadWriteGrid: ReadableGrid + WritableGrid {}

impl<T: ReadableGrid + WritableGrid> ReadWriteGrid for T {}

/// A read-only heightfield borrowed from somewhere else.
#[derive(Debug, Clone, Copy)]
pub struct HeightField<'a> {
    resolution: usize,
    heights: &'a [f32],
}

impl<'a> HeightField<'a> {
    pub fn new(resolution: usize, heights: &'a [f32]) -> Result<Self, TileError> {
        check_length(resolution, heights.len())?;
        Ok(Self { resolution, heights })
    }

    pub fn heights(&self) -> &'a [f32] {
        self.heights
    }
}

impl ReadableGrid for HeightField<'_> {
    fn resolution(&self) -> usize {
        self.resolution
    }

    #[inline]
    fn height(&self, idx: usize) -> f32 {
        self.heights[idx]
    }
}

/// One square terrain patch and its water buffers.
///
/// Every buffer has `resolution * resolution` entries in `z * resolution + x` order.
/// Heights, pool depth and flow are normalized against the tile's vertical scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tile {
    /// Width and depth in cells.
    pub resolution: usize,
    /// Terrain height, nominally in `[0, 1]`.
    pub height: Vec<f32>,
    /// Standing water depth.
    pub pool: Vec<f32>,
    /// Smoothed water-surface speed, in `[0, 1]`.
    pub flow: Vec<f32>,
    /// Water that passed through a cell since the last flow update.
    pub track: Vec<f32>,
    /// Vegetation density, if the tile carries one.
    #[serde(skip)]
    pub plants: Option<Vec<f32>>,
}

impl Tile {
    /// Creates a flat, dry tile.
    pub fn new(resolution: usize) -> Result<Self, TileError> {
        check_resolution(resolution)?;
        let size = resolution * resolution;
        Ok(Self {
            resolution,
            height: vec![0.0; size],
            pool: vec![0.0; size],
            flow: vec![0.0; size],
            track: vec![0.0; size],
            plants: None,
        })
    }

    /// Wraps an existing heightmap; the water buffers start empty.
    pub fn from_heights(resolution: usize, heights: Vec<f32>) -> Result<Self, TileError> {
        check_resolution(resolution)?;
        check_length(resolution, heights.len())?;
        let size = heights.len();
        Ok(Self {
            resolution,
            height: heights,
            pool: vec![0.0; size],
            flow: vec![0.0; size],
            track: vec![0.0; size],
            plants: None,
        })
    }

    /// Attaches a vegetation density buffer.
    pub fn with_plants(mut self, plants: Vec<f32>) -> Result<Self, TileError> {
        check_length(self.resolution, plants.len())?;
        self.plants = Some(plants);
        Ok(self)
    }

    /// Drops every buffer and reallocates for a new resolution.
    pub fn resize(&mut self, resolution: usize, heights: Vec<f32>) -> Result<(), TileError> {
        let had_plants = self.plants.is_some();
        *self = Self::from_heights(resolution, heights)?;
        if had_plants {
            self.plants = Some(vec![0.0; resolution * resolution]);
        }
        Ok(())
    }

    /// Clears pool, flow and track.
    pub fn clear_water(&mut self) {
        self.pool.fill(0.0);
        self.flow.fill(0.0);
        self.track.fill(0.0);
    }

    /// Returns (min, max) of the terrain heights.
    pub fn height_range(&self) -> (f32, f32) {
        self.height
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &h| (lo.min(h), hi.max(h)))
    }

    /// Total standing water, in normalized height units.
    pub fn total_pool(&self) -> f32 {
        self.pool.iter().sum()
    }

    pub fn as_height_field(&self) -> HeightField<'_> {
        HeightField {
            resolution: self.resolution,
            heights: &self.height,
        }
    }
}

impl ReadableGrid for Tile {
    fn resolution(&self) -> usize {
        self.resolution
    }

    #[inline]
    fn height(&self, idx: usize) -> f32 {
        self.height[idx]
    }

    #[inline]
    fn pool(&self, idx: usize) -> f32 {
        self.pool[idx]
    }

    #[inline]
    fn flow(&self, idx: usize) -> f32 {
        self.flow[idx]
    }

    #[inline]
    fn track(&self, idx: usize) -> f32 {
        self.track[idx]
    }

    #[inline]
    fn plants(&self, idx: usize) -> f32 {
        self.plants.as_ref().map_or(0.0, |p| p[idx])
    }
}

impl WritableGrid for Tile {
    #[inline]
    fn set_height(&mut self, idx: usize, value: f32) {
        self.height[idx] = value;
    }

    #[inline]
    fn set_pool(&mut self, idx: usize, value: f32) {
        self.pool[idx] = value;
    }

    #[inline]
    fn set_flow(&mut self, idx: usize, value: f32) {
        self.flow[idx] = value;
    }

    #[inline]
    fn set_track(&mut self, idx: usize, value: f32) {
        self.track[idx] = value;
    }
}

fn check_resolution(resolution: usize) -> Result<(), TileError> {
    if resolution < MIN_RESOLUTION {
        return Err(TileError::InvalidResolution(resolution));
    }
    Ok(())
}

fn check_length(resolution: usize, actual: usize) -> Result<(), TileError> {
    let expected = resolution * resolution;
    if actual != expected {
        return Err(TileError::LengthMismatch {
            resolution,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_small_resolution() {
        assert_eq!(Tile::new(3).unwrap_err(), TileError::InvalidResolution(3));
        assert!(Tile::new(0).is_err());
        assert!(Tile::new(4).is_ok());
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let err = Tile::from_heights(8, vec![0.0; 63]).unwrap_err();
        assert_eq!(
            err,
            TileError::LengthMismatch {
                resolution: 8,
                expected: 64,
                actual: 63
            }
        );
    }

    #[test]
    fn test_index_layout_is_row_major_in_z() {
        let tile = Tile::new(8).unwrap();
        assert_eq!(tile.idx(3, 0), 3);
        assert_eq!(tile.idx(0, 2), 16);
        assert_eq!(tile.pos(19), IVec2::new(3, 2));
    }

    #[test]
    fn test_safe_idx_clamps() {
        let tile = Tile::new(6).unwrap();
        assert_eq!(tile.safe_idx(-3, -1), 0);
        assert_eq!(tile.safe_idx(10, 2), tile.idx(5, 2));
        assert_eq!(tile.safe_idx(2, 99), tile.idx(2, 5));
        assert_eq!(tile.checked_idx(6, 0), None);
    }

    #[test]
    fn test_water_inclusive_height() {
        let mut tile = Tile::new(4).unwrap();
        let idx = tile.idx(1, 1);
        tile.set_height(idx, 0.4);
        tile.set_pool(idx, 0.1);
        assert!((tile.water_inclusive(idx) - 0.5).abs() < 1e-6);
        assert!(tile.standing_water(idx));
        assert!(!tile.standing_water(0));
    }

    #[test]
    fn test_resize_reallocates_every_buffer() {
        let mut tile = Tile::from_heights(4, vec![0.5; 16])
            .unwrap()
            .with_plants(vec![0.2; 16])
            .unwrap();
        tile.pool[3] = 1.0;
        tile.resize(6, vec![0.1; 36]).unwrap();
        assert_eq!(tile.resolution, 6);
        assert_eq!(tile.pool.len(), 36);
        assert_eq!(tile.flow.len(), 36);
        assert_eq!(tile.track.len(), 36);
        assert_eq!(tile.plants.as_ref().map(|p| p.len()), Some(36));
        assert!(tile.pool.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_height_field_defaults_to_dry() {
        let heights = vec![0.25; 16];
        let field = HeightField::new(4, &heights).unwrap();
        assert_eq!(field.pool(5), 0.0);
        assert_eq!(field.water_inclusive(5), 0.25);
        assert!(field.on_edge(0));
        assert!(!field.on_edge(field.idx(1, 2)));
    }
}
