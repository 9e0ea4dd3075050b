//! File output for tile buffers: raw blobs for round-tripping and PNG previews.

mod png;
mod raw;

pub use png::{
    catchment_shades, export_mask_png, export_scalar_png, export_tile_previews, PngExportError,
    PngExportOptions,
};
pub use raw::{
    expected_file_size, read_raw, read_tile, save_tile_buffers, write_raw, write_raw_r16,
    RawFormat, RawIoError,
};
