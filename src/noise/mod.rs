//! Heightmap sources for fresh tiles.
//!
//! Uses simdnoise for SIMD-accelerated fBm.

mod fractal;

pub use fractal::{fractal_heightmap, FractalNoiseConfig};
