//! Raw little-endian buffer persistence.
//!
//! A raw file is the dense `z * resolution + x` layout with no header, so the
//! resolution is inferred from the length or checked against a caller value.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::grid::{Tile, TileError};

#[derive(Error, Debug)]
pub enum RawIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} bytes is not a whole number of f32 samples")]
    Truncated(usize),
    #[error("{0} samples do not form a square tile")]
    NotSquare(usize),
    #[error("expected {expected} samples for resolution {resolution}, found {found}")]
    LengthMismatch {
        resolution: usize,
        expected: usize,
        found: usize,
    },
    #[error("invalid height range: min ({0}) >= max ({1})")]
    InvalidHeightRange(f32, f32),
    #[error(transparent)]
    Tile(#[from] TileError),
}

/// Sample encoding for written blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawFormat {
    /// 32-bit float, little-endian. The only format read back.
    #[default]
    R32Float,
    /// 16-bit unsigned integer, little-endian, normalized over a height range.
    R16LittleEndian,
}

pub fn expected_file_size(resolution: usize, format: RawFormat) -> u64 {
    let samples = (resolution * resolution) as u64;
    match format {
        RawFormat::R32Float => samples * 4,
        RawFormat::R16LittleEndian => samples * 2,
    }
}

/// Writes `values` as f32 samples.
pub fn write_raw(path: &Path, values: &[f32]) -> Result<(), RawIoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `values` as u16 samples, mapping `[min, max]` onto the full range.
pub fn write_raw_r16(path: &Path, values: &[f32], min: f32, max: f32) -> Result<(), RawIoError> {
    if min >= max {
        return Err(RawIoError::InvalidHeightRange(min, max));
    }
    let range = max - min;
    let mut writer = BufWriter::new(File::create(path)?);
    for &v in values {
        let value = (((v - min) / range).clamp(0.0, 1.0) * 65535.0) as u16;
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads an f32 blob. With `resolution` set, the length must match it;
/// otherwise the length must be a perfect square.
pub fn read_raw(path: &Path, resolution: Option<usize>) -> Result<(usize, Vec<f32>), RawIoError> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    if bytes.len() % 4 != 0 {
        return Err(RawIoError::Truncated(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let res = match resolution {
        Some(res) => {
            if values.len() != res * res {
                return Err(RawIoError::LengthMismatch {
                    resolution: res,
                    expected: res * res,
                    found: values.len(),
                });
            }
            res
        }
        None => infer_resolution(values.len()).ok_or(RawIoError::NotSquare(values.len()))?,
    };
    Ok((res, values))
}

fn infer_resolution(samples: usize) -> Option<usize> {
    let res = (samples as f64).sqrt().round() as usize;
    (res * res == samples && res > 0).then_some(res)
}

/// Reads a height blob straight into a fresh tile.
pub fn read_tile(path: &Path, resolution: Option<usize>) -> Result<Tile, RawIoError> {
    let (res, heights) = read_raw(path, resolution)?;
    Ok(Tile::from_heights(res, heights)?)
}

/// Writes the height, pool and flow buffers of `tile` as `{stem}_{buffer}.raw`
/// under `dir`, returning the paths written.
pub fn save_tile_buffers(tile: &Tile, dir: &Path, stem: &str) -> Result<Vec<PathBuf>, RawIoError> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(3);
    for (name, values) in [("height", &tile.height), ("pool", &tile.pool), ("flow", &tile.flow)] {
        let path = dir.join(format!("{stem}_{name}.raw"));
        write_raw(&path, values)?;
        written.push(path);
    }
    Ok(written)
}
