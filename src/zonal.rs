//! Parallel windowed zonal statistics. Reduction is sum-then-divide-once
//! across windows: the prior implementation's `_update()` instead merged
//! partial window means via a running weighted average, which is not
//! associative under arbitrary window partitioning. This redesign sums
//! partials globally and divides exactly once, satisfying property P5.

use crate::error::Result;
use crate::raster::{self, RasterMeta, Window};
use gdal::Dataset;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionResult {
    pub arable_pixels: u64,
    pub observed_pixels: u64,
    pub mean_value: f64,
    pub percent_observed: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RegionPartial {
    arable_pixels: u64,
    observed_pixels: u64,
    sum: f64,
}

/// Per-window partial computed by one worker. `mask` is `None` for the
/// `nomask` identity case (every pixel treated arable).
fn window_partial(
    product: &Dataset,
    region: &Dataset,
    mask: Option<&Dataset>,
    window: Window,
    product_nodata: f64,
) -> Result<HashMap<i64, RegionPartial>> {
    let product_block = raster::read_window_f64(product, 1, window)?;
    let region_block = raster::read_window_f64(region, 1, window)?;
    let mask_block = match mask {
        Some(m) => Some(raster::read_window_f64(m, 1, window)?),
        None => None,
    };

    let mut partials: HashMap<i64, RegionPartial> = HashMap::new();
    for ((row, col), region_val) in region_block.indexed_iter() {
        let region_id = *region_val as i64;
        if region_id == 0 {
            continue;
        }
        let arable = match &mask_block {
            Some(m) => m[(row, col)] != 0.0,
            None => true,
        };
        if !arable {
            continue;
        }
        let entry = partials.entry(region_id).or_default();
        entry.arable_pixels += 1;
        let value = product_block[(row, col)];
        if value != product_nodata && !value.is_nan() {
            entry.observed_pixels += 1;
            entry.sum += value;
        }
    }
    Ok(partials)
}

/// Runs the zonal aggregation for one acquisition's product raster against
/// one region raster and an optional crop mask, fanning window reads out
/// across `n_workers` blocking tasks bounded by a semaphore (the
/// cooperative-runtime case of the parallel execution contract; each task
/// opens its own GDAL dataset handles rather than sharing one across
/// threads).
pub async fn zonal(
    product_path: &Path,
    region_path: &Path,
    mask_path: Option<&Path>,
    n_workers: usize,
    block_scale: u32,
) -> Result<HashMap<i64, RegionResult>> {
    let meta: RasterMeta = raster::open_meta(product_path)?;
    let nodata = meta.nodata.unwrap_or(-9999.0);
    let windows = raster::window_list(&meta, block_scale);

    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(n_workers.max(1)));
    let product_path = product_path.to_path_buf();
    let region_path = region_path.to_path_buf();
    let mask_path = mask_path.map(|p| p.to_path_buf());

    let mut tasks = Vec::with_capacity(windows.len());
    for window in windows {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let product_path = product_path.clone();
        let region_path = region_path.clone();
        let mask_path = mask_path.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let product_ds = Dataset::open(&product_path)?;
            let region_ds = Dataset::open(&region_path)?;
            let mask_ds = match &mask_path {
                Some(p) => Some(Dataset::open(p)?),
                None => None,
            };
            window_partial(&product_ds, &region_ds, mask_ds.as_ref(), window, nodata)
        }));
    }

    let mut totals: HashMap<i64, RegionPartial> = HashMap::new();
    for task in tasks {
        let partials = task
            .await
            .map_err(|e| anyhow::anyhow!("zonal worker panicked: {e}"))??;
        for (region_id, partial) in partials {
            let entry = totals.entry(region_id).or_default();
            entry.arable_pixels += partial.arable_pixels;
            entry.observed_pixels += partial.observed_pixels;
            entry.sum += partial.sum;
        }
    }

    Ok(totals
        .into_iter()
        .map(|(region_id, p)| {
            let mean_value = if p.observed_pixels > 0 {
                p.sum / p.observed_pixels as f64
            } else {
                0.0
            };
            let percent_observed = if p.arable_pixels > 0 {
                (p.observed_pixels as f64 / p.arable_pixels as f64 * 100.0).floor()
            } else {
                0.0
            };
            (
                region_id,
                RegionResult {
                    arable_pixels: p.arable_pixels,
                    observed_pixels: p.observed_pixels,
                    mean_value,
                    percent_observed,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn merge(a: &HashMap<i64, RegionPartial>, b: &HashMap<i64, RegionPartial>) -> HashMap<i64, RegionPartial> {
        let mut out = a.clone();
        for (k, v) in b {
            let entry = out.entry(*k).or_default();
            entry.arable_pixels += v.arable_pixels;
            entry.observed_pixels += v.observed_pixels;
            entry.sum += v.sum;
        }
        out
    }

    fn finalize(totals: &HashMap<i64, RegionPartial>) -> HashMap<i64, f64> {
        totals
            .iter()
            .map(|(k, p)| {
                let mean = if p.observed_pixels > 0 {
                    p.sum / p.observed_pixels as f64
                } else {
                    0.0
                };
                (*k, mean)
            })
            .collect()
    }

    /// Property P5: the aggregate over the union of two disjoint window
    /// partitions equals the two-partition reduction, because partials are
    /// summed (not averaged) before the single final division.
    #[test]
    fn reduction_is_associative_across_partitions() {
        let mut part_a = HashMap::new();
        part_a.insert(
            1,
            RegionPartial {
                arable_pixels: 10,
                observed_pixels: 8,
                sum: 80.0,
            },
        );
        let mut part_b = HashMap::new();
        part_b.insert(
            1,
            RegionPartial {
                arable_pixels: 5,
                observed_pixels: 5,
                sum: 25.0,
            },
        );
        let mut part_c = HashMap::new();
        part_c.insert(
            1,
            RegionPartial {
                arable_pixels: 3,
                observed_pixels: 2,
                sum: 40.0,
            },
        );

        // Partition 1: {a, b, c} combined one at a time.
        let union_one = merge(&merge(&part_a, &part_b), &part_c);
        // Partition 2: {a} combined with {b, c} combined first.
        let union_two = merge(&part_a, &merge(&part_b, &part_c));

        assert_eq!(finalize(&union_one), finalize(&union_two));
    }

    /// Property P6: `nomask` (None) equals an all-ones explicit mask.
    #[test]
    fn nomask_equals_all_ones_mask() {
        let region = Array2::from_elem((2, 2), 1.0);
        let product = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let all_ones_mask = Array2::from_elem((2, 2), 1.0);

        let mut no_mask_totals: HashMap<i64, RegionPartial> = HashMap::new();
        let mut explicit_mask_totals: HashMap<i64, RegionPartial> = HashMap::new();
        for ((row, col), region_val) in region.indexed_iter() {
            let region_id = *region_val as i64;
            let value = product[(row, col)];
            let e1 = no_mask_totals.entry(region_id).or_default();
            e1.arable_pixels += 1;
            e1.observed_pixels += 1;
            e1.sum += value;

            if all_ones_mask[(row, col)] != 0.0 {
                let e2 = explicit_mask_totals.entry(region_id).or_default();
                e2.arable_pixels += 1;
                e2.observed_pixels += 1;
                e2.sum += value;
            }
        }
        assert_eq!(finalize(&no_mask_totals), finalize(&explicit_mask_totals));
    }
}
