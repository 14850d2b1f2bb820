//! Drives one update cycle: Gap Planner → Availability Probe → Acquisition
//! Pipeline → Object Store → Catalog → Zonal Aggregator → Statistics
//! Materializer, for every product, bounded by a per-product concurrency
//! ceiling (a `tokio::sync::Semaphore`, the same primitive the teacher's
//! worker-pool contract reaches for). Acquisitions within one product are
//! processed sequentially to respect upstream rate limits.

use crate::error::{AcquisitionRef, GlamError, Result};
use crate::materializer::Materializer;
use crate::matchup;
use crate::planner::GapPlanner;
use crate::registry::ProductId;
use crate::state::GlamState;
use crate::zonal;
use chrono::{Datelike, NaiveDate};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bounded-backoff retry for the operation kinds §7 marks retryable
/// (`UpstreamTransient`, `ConnectionLost`): up to `max_attempts` tries per
/// cycle, doubling the backoff each time. Non-retryable errors and the
/// final attempt's error are returned immediately.
async fn with_retries<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!("attempt {attempt}/{max_attempts} failed, retrying: {e}");
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-product tally from one cycle, surfaced to the CLI / caller so one
/// product's failures never hide another's progress.
#[derive(Debug, Default)]
pub struct ProductReport {
    pub fetched: Vec<NaiveDate>,
    pub errors: Vec<(NaiveDate, String)>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub by_product: Vec<(ProductId, ProductReport)>,
}

pub struct Orchestrator {
    state: GlamState,
}

impl Orchestrator {
    pub fn new(state: GlamState) -> Self {
        Self { state }
    }

    /// Runs one cycle over `products`, as of `today`. `today` is always
    /// caller-supplied (never read from `chrono::Utc::now()` internally) so
    /// callers can pin the clock in tests.
    pub async fn run_cycle(&self, products: &[ProductId], today: NaiveDate) -> Result<CycleReport> {
        let ceiling = self.state.config.concurrency.product_parallelism.max(1);
        let semaphore = Arc::new(Semaphore::new(ceiling));

        let mut tasks = Vec::with_capacity(products.len());
        for &product in products {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let state = self.state.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let report = run_product_cycle(&state, product, today).await;
                (product, report)
            }));
        }

        let mut cycle = CycleReport::default();
        for task in tasks {
            let (product, report) = task
                .await
                .map_err(|e| GlamError::Other(anyhow::anyhow!("product task panicked: {e}")))?;
            cycle.by_product.push((product, report));
        }

        reconcile(&self.state).await?;
        Ok(cycle)
    }

    /// Drives the historical backfill variant of a cycle: an explicit
    /// `[from, to]` range instead of "since latest", for `fill-archive`.
    pub async fn fill_archive(
        &self,
        product: ProductId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<ProductReport> {
        let descriptor = product.descriptor();
        let dates = descriptor.expected_dates(from, to);
        for date in &dates {
            self.state
                .catalog
                .upsert_pending(product.as_str(), *date, descriptor.collections[0])?;
        }
        let fetchable = GapPlanner::new(&self.state.catalog, &self.state.probe)
            .filter_available(product, dates)
            .await?;
        Ok(process_dates(&self.state, product, fetchable).await)
    }

    pub async fn purge(&self, product: ProductId, date: NaiveDate) -> Result<()> {
        purge_acquisition(&self.state, product, date).await
    }
}

async fn run_product_cycle(state: &GlamState, product: ProductId, today: NaiveDate) -> ProductReport {
    let planner = GapPlanner::new(&state.catalog, &state.probe);
    let planned = match planner.missing(product, today) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("{product}: gap planning failed: {e}");
            return ProductReport::default();
        }
    };
    let fetchable = match planner.filter_available(product, planned).await {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("{product}: availability filtering failed: {e}");
            return ProductReport::default();
        }
    };
    process_dates(state, product, fetchable).await
}

/// Processes each candidate date for `product` in sequence, never letting
/// one acquisition's failure abort the rest of the product's queue.
async fn process_dates(state: &GlamState, product: ProductId, dates: Vec<NaiveDate>) -> ProductReport {
    let mut report = ProductReport::default();
    for date in dates {
        match process_acquisition(state, product, date).await {
            Ok(()) => {
                report.fetched.push(date);
                if product == ProductId::Chirps {
                    if let Err(e) = purge_acquisition(state, ProductId::ChirpsPrelim, date).await {
                        tracing::warn!("chirps-prelim: purge after definitive {date} failed: {e}");
                    }
                }
            }
            Err(e) => {
                tracing::warn!("{product} {date}: {e}");
                report.errors.push((date, e.to_string()));
            }
        }
    }
    report
}

/// Fetch → normalize → publish → aggregate for one acquisition. One
/// `Pipeline::run` call per acquisition regardless of how many collections
/// the product has: merra-2's single 5-day fetch yields `[min, mean, max]`
/// in one round-trip, and every output is published and tracked here rather
/// than discarding all but one (§4.F). Normalizes into a scratch temp
/// directory removed on both the success and failure path; each collection's
/// publication is a single atomic PUT followed by its own `processed` flag
/// write, so cancellation anywhere before a flag write is repaired by the
/// next cycle's reconciliation pass (I4/§7).
async fn process_acquisition(state: &GlamState, product: ProductId, date: NaiveDate) -> Result<()> {
    let descriptor = product.descriptor();
    for &collection in descriptor.collections {
        state.catalog.upsert_pending(product.as_str(), date, collection)?;
    }

    let tmp_dir = TempDirGuard::new(format!("glam-fetch-{}-{date}", product.as_str()))?;
    let outputs = with_retries(3, || state.pipeline.run(product, date, tmp_dir.path())).await?;

    for &collection in descriptor.collections {
        state.catalog.set_flag(product.as_str(), date, collection, "downloaded", true)?;
    }

    for (i, &collection) in descriptor.collections.iter().enumerate() {
        let local_path = outputs.get(i).ok_or_else(|| {
            GlamError::BadInput(format!("{product} {date}: fetch plan produced no output for collection {collection:?}"))
        })?;
        let key = format!("rasters/{}", descriptor.canonical_path(date, non_empty(collection)));
        state
            .object_store
            .put(&key, local_path)
            .await
            .map_err(|e| GlamError::PublishFailure {
                acq: acq_ref(product, date, collection),
                source: e.into(),
            })?;
        state.catalog.set_flag(product.as_str(), date, collection, "processed", true)?;
    }

    // Temp artifacts are scratch; drop them now that the canonical copies are published.
    drop(tmp_dir);

    for &collection in descriptor.collections {
        if let Err(e) = aggregate_and_materialize(state, product, date, collection).await {
            tracing::warn!(
                "{product} {date} {collection:?}: aggregation failed, statGen left false for the Rectifier: {e}"
            );
        }
    }
    Ok(())
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() { None } else { Some(s) }
}

/// Runs the Zonal Aggregator over every (region, mask) pair the Matchup
/// Policy permits for this product's resolution class, materializes each
/// result, then sets `statGen`. Region/mask rasters that simply haven't
/// been published for this resolution class are skipped rather than
/// treated as an error — the matchup policy names what's *permitted*, not
/// what's physically present.
async fn aggregate_and_materialize(
    state: &GlamState,
    product: ProductId,
    date: NaiveDate,
    collection: &str,
) -> Result<()> {
    let descriptor = product.descriptor();
    let family = product.raster_family();
    let acq = acq_ref(product, date, collection);

    let tmp_dir = TempDirGuard::new(format!("glam-agg-{}-{collection}-{date}", product.as_str()))?;
    let raster_key = format!("rasters/{}", descriptor.canonical_path(date, non_empty(collection)));
    let product_local = tmp_dir.path().join("product.tif");
    state
        .object_store
        .get(&raster_key, &product_local)
        .await
        .map_err(|e| GlamError::AggregationFailure {
            acq: acq.clone(),
            source: e.into(),
        })?;

    let year = date.year();
    let doy = date.ordinal();

    for &region in state.matchup.regions() {
        let region_key = format!("regions/{family}.{region}.tif");
        let region_local = tmp_dir.path().join(format!("region-{region}.tif"));
        if state.object_store.get(&region_key, &region_local).await.is_err() {
            continue;
        }

        for mask in state.matchup.masks_for_region(region) {
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
            .await
            .map_err(|e| GlamError::AggregationFailure {
                acq: acq.clone(),
                source: e.into(),
            })?;

            let table_ref = state.catalog.resolve_stats_table(product.as_str(), collection, mask, region, year)?;
            let materializer = Materializer::new(&state.catalog, state.catalog.conn());
            with_retries(3, || async {
                materializer.materialize(&table_ref, doy, &results).map_err(|e| {
                    if e.is_benign_race() {
                        e
                    } else {
                        GlamError::ConnectionLost {
                            acq: acq.clone(),
                            source: e.into(),
                        }
                    }
                })
            })
            .await?;
        }
    }

    state.catalog.set_flag(product.as_str(), date, collection, "stat_gen", true)?;
    Ok(())
}

/// Removes a superseded acquisition: deletes its object, its catalog row,
/// and subtracts its contributed doy columns from every stats table it had
/// written, leaving any other acquisition's columns (notably the
/// definitive counterpart's) intact.
async fn purge_acquisition(state: &GlamState, product: ProductId, date: NaiveDate) -> Result<()> {
    let descriptor = product.descriptor();
    let doy = date.ordinal();

    for &collection in descriptor.collections {
        let state_row = state.catalog.state_of(product.as_str(), date, collection)?;
        if state_row.is_none() {
            continue;
        }

        let key = format!("rasters/{}", descriptor.canonical_path(date, non_empty(collection)));
        state.object_store.delete(&key).await.map_err(|e| GlamError::PublishFailure {
            acq: acq_ref(product, date, collection),
            source: e.into(),
        })?;

        for table_ref in state.catalog.stats_tables_for(product.as_str(), collection, date.year())? {
            if !table_ref.exists {
                continue;
            }
            let materializer = Materializer::new(&state.catalog, state.catalog.conn());
            materializer.drop_doy_columns(&table_ref.name, doy)?;
        }

        state.catalog.delete_acquisition(product.as_str(), date, collection)?;
    }
    Ok(())
}

/// §7 reconciliation: deletes object-store keys with no corresponding
/// `processed=true` row, and marks rows whose backing object has
/// disappeared as not-processed so the next cycle re-fetches and
/// re-publishes them. Runs at the end of every cycle so no disagreement
/// between object storage and the catalog survives more than one cycle.
async fn reconcile(state: &GlamState) -> Result<()> {
    let processed = state.catalog.processed_acquisitions()?;
    let mut known_keys = std::collections::HashSet::new();
    for (product_name, date, collection) in &processed {
        if let Some(product) = ProductId::parse(product_name) {
            known_keys.insert(format!(
                "rasters/{}",
                product.descriptor().canonical_path(*date, non_empty(collection))
            ));
        }
    }

    for key in state.object_store.list("rasters/").await.unwrap_or_default() {
        let full_key = if key.starts_with("rasters/") {
            key.clone()
        } else {
            format!("rasters/{key}")
        };
        if !known_keys.contains(&full_key) {
            tracing::warn!("reconcile: orphan object {full_key} has no processed=true row, deleting");
            let _ = state.object_store.delete(&full_key).await;
        }
    }

    for (product_name, date, collection) in &processed {
        let Some(product) = ProductId::parse(product_name) else {
            continue;
        };
        let key = format!(
            "rasters/{}",
            product.descriptor().canonical_path(*date, non_empty(collection))
        );
        if state.object_store.get(&key, &std::env::temp_dir().join(".glam-reconcile-probe")).await.is_err() {
            tracing::warn!("reconcile: {product} {date} {collection:?} has no backing object, clearing processed for retry");
            state.catalog.set_flag(product_name, *date, collection, "processed", false)?;
        }
    }
    Ok(())
}

fn acq_ref(product: ProductId, date: NaiveDate, collection: &str) -> AcquisitionRef {
    AcquisitionRef {
        product: product.to_string(),
        date,
        collection: non_empty(collection).map(str::to_string),
    }
}

/// Owns one pipeline invocation's scratch directory; removed on drop
/// regardless of whether the invocation succeeded.
struct TempDirGuard(PathBuf);

impl TempDirGuard {
    fn new(tag: impl AsRef<str>) -> Result<Self> {
        let path = std::env::temp_dir().join(tag.as_ref());
        std::fs::create_dir_all(&path).map_err(anyhow::Error::from)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_treats_blank_string_as_no_collection() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("min"), Some("min"));
    }
}
