//! Fractal Brownian motion heightmaps for fresh tiles.

use serde::{Deserialize, Serialize};
use simdnoise::NoiseBuilder;

/// Configuration for a 2D fBm tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FractalNoiseConfig {
    pub octaves: u8,
    /// Base frequency in cycles per tile.
    pub frequency: f32,
    pub lacunarity: f32,
    pub persistence: f32,
    pub seed: i32,
    /// Lowest output height.
    pub min_height: f32,
    /// Highest output height.
    pub max_height: f32,
}

impl Default for FractalNoiseConfig {
    fn default() -> Self {
        Self {
            octaves: 6,
            frequency: 3.0,
            lacunarity: 2.0,
            persistence: 0.5,
            seed: 42,
            min_height: 0.1,
            max_height: 0.9,
        }
    }
}

impl FractalNoiseConfig {
    pub fn with_seed(seed: i32) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    /// Fewer, broader octaves: wide valleys that collect pools.
    pub fn rolling(seed: i32) -> Self {
        Self {
            octaves: 4,
            frequency: 2.0,
            persistence: 0.4,
            seed,
            ..Default::default()
        }
    }
}

/// Generates a `resolution`² heightmap, row `z` at `z * resolution`, remapped
/// onto `[min_height, max_height]`.
///
/// `offset` shifts the sample window in cells, so neighbouring tiles sample
/// neighbouring noise.
pub fn fractal_heightmap(resolution: usize, offset: (f32, f32), config: &FractalNoiseConfig) -> Vec<f32> {
    if resolution == 0 {
        return Vec::new();
    }
    let (values, lo, hi) = NoiseBuilder::fbm_2d_offset(offset.0, resolution, offset.1, resolution)
        .with_seed(config.seed)
        .with_freq(config.frequency / resolution as f32)
        .with_octaves(config.octaves.max(1))
        .with_lacunarity(config.lacunarity)
        .with_gain(config.persistence)
        .generate();

    let span = config.max_height - config.min_height;
    let range = hi - lo;
    values
        .into_iter()
        .map(|v| {
            let t = if range > f32::EPSILON { (v - lo) / range } else { 0.5 };
            config.min_height + t.clamp(0.0, 1.0) * span
        })
        .collect()
}
