//! Tile model: dense per-cell buffers, clamped accessors and neighbor tables.
//!
//! Simulation code is written against the [`ReadableGrid`] / [`WritableGrid`]
//! traits so the same passes run on a full [`Tile`] or a borrowed [`HeightField`].

mod neighbors;
mod tile;

pub use neighbors::{opposite, Cardinal, Heading, NEIGHBORS_4, NEIGHBORS_8};
pub use tile::{
    HeightField, ReadWriteGrid, ReadableGrid, Tile, TileError, WritableGrid, MIN_RESOLUTION,
};
