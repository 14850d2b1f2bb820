//! Background gap-scan-and-backfill loop: finds `processed` acquisitions
//! whose stats tables are missing columns for their doy, and replays the
//! Zonal Aggregator against only the missing (region, mask) pairs, without
//! re-fetching from upstream. Scheduling is an enabled-gate, a startup
//! settle delay, then an interval tick.

use crate::error::Result;
use crate::materializer::Materializer;
use crate::matchup;
use crate::registry::ProductId;
use crate::state::GlamState;
use crate::zonal;
use chrono::{Datelike, NaiveDate};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Gap {
    pub product: ProductId,
    pub date: NaiveDate,
    pub collection: String,
    pub pairs: Vec<(String, String)>,
}

/// Scans every `processed` acquisition and reports the (region, mask)
/// pairs whose stats table either doesn't exist yet or lacks this
/// acquisition's doy columns.
pub async fn scan(state: &GlamState) -> Result<Vec<Gap>> {
    let mut gaps = Vec::new();
    for (product_name, date, collection) in state.catalog.processed_acquisitions()? {
        let Some(product) = ProductId::parse(&product_name) else {
            tracing::warn!("rectifier: unrecognized product '{product_name}' in catalog, skipping");
            continue;
        };
        let pairs = missing_pairs_for(state, product, date, &collection)?;
        if !pairs.is_empty() {
            gaps.push(Gap { product, date, collection, pairs });
        }
    }
    Ok(gaps)
}

fn missing_pairs_for(
    state: &GlamState,
    product: ProductId,
    date: NaiveDate,
    collection: &str,
) -> Result<Vec<(String, String)>> {
    let doy = date.ordinal();
    let year = date.year();
    let mut missing = Vec::new();

    for &region in state.matchup.regions() {
        for mask in state.matchup.masks_for_region(region) {
            let table_ref = state.catalog.resolve_stats_table(product.as_str(), collection, mask, region, year)?;
            let has_columns = if table_ref.exists {
                let materializer = Materializer::new(&state.catalog, state.catalog.conn());
                materializer.has_doy_columns(&table_ref.name, doy)?
            } else {
                false
            };
            if !has_columns {
                missing.push((region.to_string(), mask.to_string()));
            }
        }
    }
    Ok(missing)
}

/// Re-reads each gapped acquisition's raster from object storage (never
/// from the upstream source), runs the Zonal Aggregator restricted to its
/// missing pairs, materializes the results, and flips `statGen` back to
/// true.
pub async fn rectify(state: &GlamState, gaps: &[Gap]) -> Result<()> {
    for gap in gaps {
        if let Err(e) = rectify_one(state, gap).await {
            tracing::error!("rectifier: {} {}: {e}", gap.product, gap.date);
        }
    }
    Ok(())
}

async fn rectify_one(state: &GlamState, gap: &Gap) -> Result<()> {
    let descriptor = gap.product.descriptor();
    let family = gap.product.raster_family();
    let collection = gap.collection.as_str();
    let doy = gap.date.ordinal();
    let year = gap.date.year();

    let tmp_dir = TempDirGuard::new(format!("glam-rectify-{}-{}-{}", gap.product.as_str(), collection, gap.date))?;
    let raster_key = format!(
        "rasters/{}",
        descriptor.canonical_path(gap.date, if collection.is_empty() { None } else { Some(collection) })
    );
    let product_local = tmp_dir.path().join("product.tif");
    state.object_store.get(&raster_key, &product_local).await?;

    for (region, mask) in &gap.pairs {
        let region_key = format!("regions/{family}.{region}.tif");
        let region_local = tmp_dir.path().join(format!("region-{region}.tif"));
        if state.object_store.get(&region_key, &region_local).await.is_err() {
            continue;
        }
        let mask_local = if mask == matchup::NOMASK {
            None
        } else {
            let mask_key = format!("masks/{family}.{mask}.tif");
            let local = tmp_dir.path().join(format!("mask-{mask}.tif"));
            match state.object_store.get(&mask_key, &local).await {
                Ok(()) => Some(local),
                Err(_) => continue,
            }
        };

        let results = zonal::zonal(
            &product_local,
            &region_local,
            mask_local.as_deref(),
            state.config.concurrency.zonal_workers,
            state.config.concurrency.block_scale,
        )
        .await?;

        let table_ref = state.catalog.resolve_stats_table(gap.product.as_str(), collection, mask, region, year)?;
        let materializer = Materializer::new(&state.catalog, state.catalog.conn());
        materializer.materialize(&table_ref, doy, &results)?;
    }

    state
        .catalog
        .set_flag(gap.product.as_str(), gap.date, collection, "stat_gen", true)?;
    Ok(())
}

/// Owns one rectify pass's scratch directory; removed on drop regardless
/// of whether the pass succeeded. Mirrors the orchestrator's guard of the
/// same name.
struct TempDirGuard(std::path::PathBuf);

impl TempDirGuard {
    fn new(tag: impl AsRef<str>) -> Result<Self> {
        let path = std::env::temp_dir().join(tag.as_ref());
        std::fs::create_dir_all(&path).map_err(anyhow::Error::from)?;
        Ok(Self(path))
    }

    fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Spawns the Rectifier as a background task, gated by
/// `config.rectifier.enabled`, with a startup-delay-then-tick shape.
pub fn spawn_rectifier(state: GlamState) {
    if !state.config.rectifier.enabled {
        tracing::info!("rectifier: disabled by config");
        return;
    }

    let interval_secs = state.config.rectifier.interval_secs;
    let dry_run = state.config.rectifier.dry_run;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        tracing::info!("rectifier: started (interval={interval_secs}s, dry_run={dry_run})");

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            match scan(&state).await {
                Ok(gaps) if gaps.is_empty() => {
                    tracing::debug!("rectifier: no gaps found");
                }
                Ok(gaps) => {
                    tracing::info!("rectifier: found {} acquisitions with gaps", gaps.len());
                    if dry_run {
                        for gap in &gaps {
                            tracing::info!(
                                "rectifier [DRY RUN]: {} {} missing {} pair(s)",
                                gap.product,
                                gap.date,
                                gap.pairs.len()
                            );
                        }
                    } else if let Err(e) = rectify(&state, &gaps).await {
                        tracing::error!("rectifier: backfill pass failed: {e}");
                    }
                }
                Err(e) => tracing::error!("rectifier: scan failed: {e}"),
            }
        }
    });
}

