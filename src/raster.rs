//! Windowed raster I/O: metadata introspection, block-aligned read/write,
//! and nodata-aware mosaic reduction. Window-list generation mirrors
//! `getWindows()`/`zonalStats()`'s block-sizing rule from the prior
//! implementation: native tile size (or 256 if untiled) times a
//! configurable scale factor.

use crate::error::Result;
use gdal::raster::ResampleAlg;
use gdal::Dataset;
use ndarray::Array2;
use rayon::prelude::*;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub x_off: isize,
    pub y_off: isize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RasterMeta {
    pub width: usize,
    pub height: usize,
    pub block_width: usize,
    pub block_height: usize,
    pub nodata: Option<f64>,
}

pub fn open_meta(path: &Path) -> Result<RasterMeta> {
    let ds = Dataset::open(path)?;
    let band = ds.rasterband(1)?;
    let (width, height) = ds.raster_size();
    let (block_width, block_height) = band.block_size();
    Ok(RasterMeta {
        width,
        height,
        block_width,
        block_height,
        nodata: band.no_data_value(),
    })
}

/// Window list covering the full raster at `native_block * scale`, or
/// `256 * scale` when the source is untiled (native block equal to the
/// full raster width, the GDAL convention for strip-organized files).
pub fn window_list(meta: &RasterMeta, scale: u32) -> Vec<Window> {
    let block = if meta.block_width < meta.width {
        meta.block_width as u32 * scale
    } else {
        256 * scale
    } as usize;
    windows_for(meta.width, meta.height, block)
}

fn windows_for(width: usize, height: usize, block: usize) -> Vec<Window> {
    let mut out = Vec::new();
    let mut x = 0;
    while x < width {
        let w = block.min(width - x);
        let mut y = 0;
        while y < height {
            let h = block.min(height - y);
            out.push(Window {
                x_off: x as isize,
                y_off: y as isize,
                width: w,
                height: h,
            });
            y += block;
        }
        x += block;
    }
    out
}

pub fn read_window_f64(ds: &Dataset, band_index: usize, window: Window) -> Result<Array2<f64>> {
    let band = ds.rasterband(band_index)?;
    let buf = band.read_as::<f64>(
        (window.x_off, window.y_off),
        (window.width, window.height),
        (window.width, window.height),
        Some(ResampleAlg::NearestNeighbour),
    )?;
    Array2::from_shape_vec((window.height, window.width), buf.data)
        .map_err(|e| anyhow::anyhow!("window buffer shape mismatch: {e}").into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MosaicOp {
    Min,
    Mean,
    Max,
}

/// Element-wise reduction across same-shape blocks from distinct source
/// days (the temperature product's five-day mosaic). Nodata pixels are
/// excluded from the reduction at each cell; a cell with no valid
/// observations across all inputs stays nodata in the output. Rows reduce
/// independently, so they're farmed out across a rayon thread pool rather
/// than walked in a single pass.
pub fn mosaic_reduce(blocks: &[Array2<f64>], nodata: f64, op: MosaicOp) -> Array2<f64> {
    assert!(!blocks.is_empty(), "mosaic_reduce requires at least one block");
    let (height, width) = blocks[0].dim();

    let rows: Vec<Vec<f64>> = (0..height)
        .into_par_iter()
        .map(|row| {
            (0..width)
                .map(|col| {
                    let values: Vec<f64> = blocks
                        .iter()
                        .map(|b| b[(row, col)])
                        .filter(|v| *v != nodata && !v.is_nan())
                        .collect();
                    if values.is_empty() {
                        return nodata;
                    }
                    match op {
                        MosaicOp::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
                        MosaicOp::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                        MosaicOp::Mean => values.iter().sum::<f64>() / values.len() as f64,
                    }
                })
                .collect()
        })
        .collect();

    Array2::from_shape_vec((height, width), rows.into_iter().flatten().collect())
        .expect("row-major rebuild matches source block shape")
}

/// Tight bounding box of non-nodata pixels, scanning block-by-block so
/// large admin rasters aren't fully materialized in memory. Mirrors
/// `get_validBounds`'s role of letting later passes skip empty blocks.
pub fn tight_bbox(path: &Path, scale: u32) -> Result<Option<Window>> {
    let ds = Dataset::open(path)?;
    let meta = open_meta(path)?;
    let nodata = meta.nodata.unwrap_or(0.0);
    let mut min_x = meta.width;
    let mut max_x = 0usize;
    let mut min_y = meta.height;
    let mut max_y = 0usize;
    let mut any = false;

    for window in window_list(&meta, scale) {
        let block = read_window_f64(&ds, 1, window)?;
        for ((row, col), v) in block.indexed_iter() {
            if *v != nodata && !v.is_nan() {
                any = true;
                let gx = window.x_off as usize + col;
                let gy = window.y_off as usize + row;
                min_x = min_x.min(gx);
                max_x = max_x.max(gx);
                min_y = min_y.min(gy);
                max_y = max_y.max(gy);
            }
        }
    }

    if !any {
        return Ok(None);
    }
    Ok(Some(Window {
        x_off: min_x as isize,
        y_off: min_y as isize,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_for_cover_exact_tiling() {
        let ws = windows_for(10, 10, 4);
        let total: usize = ws.iter().map(|w| w.width * w.height).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn windows_for_cover_uneven_tiling() {
        let ws = windows_for(9, 5, 4);
        let total: usize = ws.iter().map(|w| w.width * w.height).sum();
        assert_eq!(total, 45);
        assert!(ws.iter().all(|w| w.width <= 4 && w.height <= 4));
    }

    #[test]
    fn mosaic_reduce_min_ignores_nodata() {
        let nodata = -9999.0;
        let a = Array2::from_elem((1, 1), 5.0);
        let b = Array2::from_elem((1, 1), nodata);
        let c = Array2::from_elem((1, 1), 2.0);
        let out = mosaic_reduce(&[a, b, c], nodata, MosaicOp::Min);
        assert_eq!(out[(0, 0)], 2.0);
    }

    #[test]
    fn mosaic_reduce_all_nodata_stays_nodata() {
        let nodata = -9999.0;
        let a = Array2::from_elem((1, 1), nodata);
        let b = Array2::from_elem((1, 1), nodata);
        let out = mosaic_reduce(&[a, b], nodata, MosaicOp::Mean);
        assert_eq!(out[(0, 0)], nodata);
    }
}
