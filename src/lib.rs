//! Particle-based hydraulic erosion and standing-water pools for square
//! heightmap tiles.
//!
//! A tile is a dense grid of normalized heights with pool, flow and track
//! buffers beside it. Each erosion cycle rains particles onto the tile, lets
//! them carve and deposit as they descend, commits their summed effect, and
//! relaxes the result with thermal erosion. The pool solver then finds every
//! basin, where it spills, and how basins merge as they fill.

pub mod erosion;
pub mod export;
pub mod grid;
pub mod noise;
pub mod pipeline;
pub mod pools;

pub use erosion::{ErosionMode, ErosionParameters, ErosionSettings};
pub use grid::{ReadWriteGrid, ReadableGrid, Tile, WritableGrid};
pub use noise::FractalNoiseConfig;
pub use pipeline::{CycleReport, ErosionSimulation, PipelineError, TileId};
pub use pools::{Pool, PoolHierarchy, PoolKey};
