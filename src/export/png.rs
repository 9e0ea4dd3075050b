//! 16-bit grayscale previews of tile buffers.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ImageBuffer, ImageEncoder, Luma};
use thiserror::Error;

use crate::grid::Tile;
use crate::pools::{CatchmentOwner, Catchments};

#[derive(Error, Debug)]
pub enum PngExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid value range: min ({0}) >= max ({1})")]
    InvalidRange(f32, f32),
    #[error("{found} samples do not fill a {resolution}x{resolution} image")]
    LengthMismatch { resolution: usize, found: usize },
}

#[derive(Debug, Clone)]
pub struct PngExportOptions {
    pub min_value: f32,
    pub max_value: f32,
    pub compression: CompressionType,
    pub filter: FilterType,
}

impl Default for PngExportOptions {
    fn default() -> Self {
        Self {
            min_value: 0.0,
            max_value: 1.0,
            compression: CompressionType::Default,
            filter: FilterType::Adaptive,
        }
    }
}

impl PngExportOptions {
    /// Range taken from the data. A constant buffer maps onto `[v, v + 1]`.
    pub fn auto_range(values: &[f32]) -> Self {
        let (min, max) = values
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let (min, max) = if values.is_empty() {
            (0.0, 1.0)
        } else if max > min {
            (min, max)
        } else {
            (min, min + 1.0)
        };
        Self {
            min_value: min,
            max_value: max,
            ..Default::default()
        }
    }
}

fn check_length(resolution: usize, found: usize) -> Result<(), PngExportError> {
    if found != resolution * resolution {
        return Err(PngExportError::LengthMismatch { resolution, found });
    }
    Ok(())
}

/// Writes a scalar buffer as a 16-bit grayscale PNG, row `z` as image row `z`.
pub fn export_scalar_png(
    resolution: usize,
    data: &[f32],
    path: &Path,
    options: &PngExportOptions,
) -> Result<(), PngExportError> {
    let (min, max) = (options.min_value, options.max_value);
    if min >= max {
        return Err(PngExportError::InvalidRange(min, max));
    }
    check_length(resolution, data.len())?;

    let size = resolution as u32;
    let range = max - min;
    let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(size, size, |x, z| {
        let v = data[z as usize * resolution + x as usize];
        Luma([(((v - min) / range).clamp(0.0, 1.0) * 65535.0) as u16])
    });

    let writer = BufWriter::new(File::create(path)?);
    let encoder = PngEncoder::new_with_quality(writer, options.compression, options.filter);
    let bytes: &[u8] = bytemuck::cast_slice(img.as_raw());
    encoder.write_image(bytes, size, size, image::ExtendedColorType::L16)?;
    Ok(())
}

/// Writes an 8-bit mask.
pub fn export_mask_png(resolution: usize, data: &[u8], path: &Path) -> Result<(), PngExportError> {
    check_length(resolution, data.len())?;
    let size = resolution as u32;
    let writer = BufWriter::new(File::create(path)?);
    let encoder = PngEncoder::new_with_quality(writer, CompressionType::Default, FilterType::Adaptive);
    encoder.write_image(data, size, size, image::ExtendedColorType::L8)?;
    Ok(())
}

/// Height (auto range), pool and flow previews as `{stem}_{buffer}.png`.
pub fn export_tile_previews(tile: &Tile, dir: &Path, stem: &str) -> Result<Vec<PathBuf>, PngExportError> {
    std::fs::create_dir_all(dir)?;
    let res = tile.resolution;
    let pool_max = tile.pool.iter().copied().fold(0.0f32, f32::max);
    let buffers = [
        ("height", &tile.height, PngExportOptions::auto_range(&tile.height)),
        (
            "pool",
            &tile.pool,
            PngExportOptions {
                max_value: if pool_max > 0.0 { pool_max } else { 1.0 },
                ..Default::default()
            },
        ),
        ("flow", &tile.flow, PngExportOptions::default()),
    ];

    let mut written = Vec::with_capacity(buffers.len());
    for (name, values, options) in buffers {
        let path = dir.join(format!("{stem}_{name}.png"));
        export_scalar_png(res, values, &path, &options)?;
        written.push(path);
    }
    Ok(written)
}

/// Gray level per catchment: off-tile black, contested white, each minimum
/// its own mid-tone.
pub fn catchment_shades(catchments: &Catchments) -> Vec<u8> {
    catchments
        .owner
        .iter()
        .map(|owner| match owner {
            CatchmentOwner::OffTile => 0,
            CatchmentOwner::Contested(_) => 255,
            CatchmentOwner::Minimum(m) => 32 + ((m.wrapping_mul(2_654_435_761) >> 7) % 192) as u8,
        })
        .collect()
}
