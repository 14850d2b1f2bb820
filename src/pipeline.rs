//! Per-product fetch → checksum → decode → (mosaic) → reproject → clip →
//! cloud-optimize. Reprojection, clipping, and cloud-optimization shell
//! out to the GDAL command-line tools exactly as
//! `cloud_optimize_inPlace()` does in the prior implementation: build
//! overviews with `gdaladdo`, then rewrite tiled/LZW with
//! `gdal_translate`, with `BIGTIFF=YES` added for NDVI products.

use crate::config::CredentialsConfig;
use crate::error::{AcquisitionRef, GlamError, Result};
use crate::raster::{self, MosaicOp};
use crate::registry::{Product, ProductId};
use chrono::NaiveDate;
use futures_util::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The fixed sinusoidal projection every canonical raster is warped into.
/// Verbatim MODIS-grid sinusoidal definition used by the prior pipeline.
pub const SINUSOIDAL_WKT: &str = concat!(
    "PROJCS[\"Sinusoidal\",",
    "GEOGCS[\"GCS_Undefined\",DATUM[\"Undefined\",SPHEROID[\"User_Defined_Spheroid\",6371007.181,0.0]],",
    "PRIMEM[\"Greenwich\",0.0],UNIT[\"Degree\",0.0174532925199433]],",
    "PROJECTION[\"Sinusoidal\"],",
    "PARAMETER[\"False_Easting\",0.0],",
    "PARAMETER[\"False_Northing\",0.0],",
    "PARAMETER[\"Central_Meridian\",0.0],",
    "UNIT[\"Meter\",1.0]]"
);

/// Canonical bounding box, meters, in the sinusoidal grid above.
pub const CANONICAL_NORTH: f64 = 9_962_342.0;
pub const CANONICAL_WEST: f64 = -22_735_470.0;
pub const CANONICAL_SOUTH: f64 = -9_143_189.0;
pub const CANONICAL_EAST: f64 = 20_958_445.0;

pub struct Pipeline {
    http: reqwest::Client,
    credentials: CredentialsConfig,
}

impl Pipeline {
    pub fn new(credentials: CredentialsConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .expect("reqwest client builds with static config");
        Self { http, credentials }
    }

    /// Runs the fetch_plan for `product` at `date`, returning the local
    /// paths of the normalized, cloud-optimized output rasters (one per
    /// collection; three for the temperature product).
    pub async fn run(
        &self,
        product: ProductId,
        date: NaiveDate,
        temp_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let descriptor = product.descriptor();
        match product {
            ProductId::Merra2 => self.run_temperature(date, temp_dir).await,
            ProductId::Chirps | ProductId::ChirpsPrelim => {
                self.run_precipitation(product, date, temp_dir).await
            }
            ProductId::Swi => self.run_soil_water(date, temp_dir).await,
            ProductId::Mod09Q1 | ProductId::Mod13Q1 | ProductId::Myd09Q1 | ProductId::Myd13Q1 => {
                self.run_ndvi(product, &descriptor, date, temp_dir).await
            }
        }
    }

    /// Fetches five consecutive days of NetCDF, extracts the {min,mean,max}
    /// subdatasets from each, mosaics across days per collection, then
    /// projects/clips/cloud-optimizes each of the three outputs. Aborts
    /// (definitive unavailability) if any of the five days is missing.
    async fn run_temperature(&self, date: NaiveDate, temp_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut per_day_subsets: Vec<[PathBuf; 3]> = Vec::with_capacity(5);
        for offset in (0..5).rev() {
            let day = date - chrono::Duration::days(offset);
            let nc_path = temp_dir.join(format!("merra2.{}.nc4", day.format("%Y%m%d")));
            let url = format!(
                "https://merra-archive.example/{}/{}/merra2.{}.nc4",
                day.format("%Y"),
                day.format("%m"),
                day.format("%Y%m%d")
            );
            self.download_authenticated(&url, &nc_path, merra_acq(date)).await?;
            let min = extract_subdataset(&nc_path, "T2MMIN", temp_dir, "min")?;
            let mean = extract_subdataset(&nc_path, "T2MMEAN", temp_dir, "mean")?;
            let max = extract_subdataset(&nc_path, "T2MMAX", temp_dir, "max")?;
            per_day_subsets.push([min, mean, max]);
        }

        let mut outputs = Vec::with_capacity(3);
        for (idx, (collection, op)) in [("min", MosaicOp::Min), ("mean", MosaicOp::Mean), ("max", MosaicOp::Max)]
            .into_iter()
            .enumerate()
        {
            let sources: Vec<PathBuf> = per_day_subsets.iter().map(|d| d[idx].clone()).collect();
            let mosaic_path = temp_dir.join(format!("merra-2.{}.{}.mosaic.tif", date.format("%Y-%m-%d"), collection));
            mosaic_rasters(&sources, &mosaic_path, op)?;
            let projected = project_and_clip(&mosaic_path, temp_dir)?;
            cloud_optimize(&projected, false)?;
            outputs.push(projected);
        }
        Ok(outputs)
    }

    /// Precipitation and its preliminary: one gzip-compressed or plain
    /// tiff, nodata forced to -9999, then project/clip/cloud-optimize.
    async fn run_precipitation(
        &self,
        product: ProductId,
        date: NaiveDate,
        temp_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let dekad = dekad_of_month(date.format("%d").to_string().parse().unwrap_or(1));
        let stem = if product == ProductId::ChirpsPrelim {
            "chirps-prelim"
        } else {
            "chirps"
        };
        let url = format!(
            "https://chirps-archive.example/{}/{}/{}.{}.tif.gz",
            stem,
            date.format("%Y"),
            date.format("%m"),
            dekad
        );
        let gz_path = temp_dir.join(format!("{}.{}.tif.gz", stem, date.format("%Y-%m-%d")));
        let acq = AcquisitionRef {
            product: stem.to_string(),
            date,
            collection: None,
        };
        self.download(&url, &gz_path, acq.clone()).await?;
        let tif_path = temp_dir.join(format!("{}.{}.raw.tif", stem, date.format("%Y-%m-%d")));
        decompress_gzip(&gz_path, &tif_path, acq.clone())?;
        apply_nodata(&tif_path, -9999.0)?;
        let projected = project_and_clip(&tif_path, temp_dir)?;
        cloud_optimize(&projected, false)?;
        Ok(vec![projected])
    }

    /// Soil-water: basic-auth NetCDF fetch, extract the 10-day band,
    /// project/clip/cloud-optimize.
    async fn run_soil_water(&self, date: NaiveDate, temp_dir: &Path) -> Result<Vec<PathBuf>> {
        let (user, pass) = match (&self.credentials.swi_user, &self.credentials.swi_pass) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => return Err(GlamError::MissingCredential("swi_user/swi_pass")),
        };
        let url = format!("https://swi-archive.example/{}.nc", date.format("%Y%m%d"));
        let nc_path = temp_dir.join(format!("swi.{}.nc", date.format("%Y-%m-%d")));
        let acq = AcquisitionRef {
            product: "swi".to_string(),
            date,
            collection: None,
        };
        let resp = self
            .http
            .get(&url)
            .basic_auth(user, Some(pass))
            .send()
            .await
            .map_err(|e| GlamError::UpstreamTransient {
                acq: acq.clone(),
                source: e.into(),
            })?;
        if !resp.status().is_success() {
            return Err(GlamError::UpstreamUnavailable { acq });
        }
        let bytes = resp.bytes().await.map_err(|e| GlamError::UpstreamTransient {
            acq: acq.clone(),
            source: e.into(),
        })?;
        std::fs::write(&nc_path, &bytes).map_err(|e| GlamError::PublishFailure {
            acq: acq.clone(),
            source: e.into(),
        })?;

        let band = extract_subdataset(&nc_path, "SWI_010", temp_dir, "swi")?;
        let projected = project_and_clip(&band, temp_dir)?;
        cloud_optimize(&projected, false)?;
        Ok(vec![projected])
    }

    /// NDVI family: delegated to an external granule-assembly service that
    /// returns an already-projected raster; only key assignment and
    /// cloud-optimization (with BIGTIFF) happen locally.
    async fn run_ndvi(
        &self,
        product: ProductId,
        descriptor: &Product,
        date: NaiveDate,
        temp_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let acq = AcquisitionRef {
            product: product.to_string(),
            date,
            collection: None,
        };
        let url = format!(
            "https://granule-service.example/granule/{}?date={}",
            product,
            date.format("%Y-%m-%d")
        );
        let out_path = temp_dir.join(descriptor.canonical_path(date, None));
        self.download(&url, &out_path, acq).await?;
        cloud_optimize(&out_path, true)?;
        Ok(vec![out_path])
    }

    async fn download(&self, url: &str, dest: &Path, acq: AcquisitionRef) -> Result<()> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GlamError::UpstreamTransient {
                acq: acq.clone(),
                source: e.into(),
            })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GlamError::UpstreamUnavailable { acq });
        }
        if !resp.status().is_success() {
            return Err(GlamError::UpstreamTransient {
                acq,
                source: anyhow::anyhow!("unexpected status {}", resp.status()),
            });
        }
        let expected_len = resp.content_length();
        let mut file = std::fs::File::create(dest).map_err(|e| GlamError::PublishFailure {
            acq: acq.clone(),
            source: e.into(),
        })?;
        let mut written: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GlamError::UpstreamTransient {
                acq: acq.clone(),
                source: e.into(),
            })?;
            written += chunk.len() as u64;
            file.write_all(&chunk).map_err(|e| GlamError::PublishFailure {
                acq: acq.clone(),
                source: e.into(),
            })?;
        }
        if let Some(expected) = expected_len {
            if expected != written {
                let _ = std::fs::remove_file(dest);
                return Err(GlamError::UpstreamTransient {
                    acq,
                    source: anyhow::anyhow!(
                        "content-length mismatch: expected {expected}, wrote {written}"
                    ),
                });
            }
        }
        Ok(())
    }

    async fn download_authenticated(&self, url: &str, dest: &Path, acq: AcquisitionRef) -> Result<()> {
        if let (Some(user), Some(pass)) = (&self.credentials.merra_user, &self.credentials.merra_pass) {
            let resp = self
                .http
                .get(url)
                .basic_auth(user, Some(pass))
                .send()
                .await
                .map_err(|e| GlamError::UpstreamTransient {
                    acq: acq.clone(),
                    source: e.into(),
                })?;
            if !resp.status().is_success() {
                return Err(GlamError::UpstreamUnavailable { acq });
            }
            let bytes = resp.bytes().await.map_err(|e| GlamError::UpstreamTransient {
                acq: acq.clone(),
                source: e.into(),
            })?;
            std::fs::write(dest, &bytes).map_err(|e| GlamError::PublishFailure { acq, source: e.into() })?;
            Ok(())
        } else {
            Err(GlamError::MissingCredential("merra_user/merra_pass"))
        }
    }
}

fn merra_acq(date: NaiveDate) -> AcquisitionRef {
    AcquisitionRef {
        product: "merra-2".to_string(),
        date,
        collection: None,
    }
}

fn dekad_of_month(day: u32) -> u32 {
    ((day - 1) / 10 + 1).min(3)
}

/// Materializes a named NetCDF subdataset to a standalone GeoTIFF via
/// `gdal_translate`, using GDAL's `NETCDF:"file":var` subdataset syntax.
fn extract_subdataset(nc_path: &Path, var_name: &str, out_dir: &Path, tag: &str) -> Result<PathBuf> {
    let out_path = out_dir.join(format!(
        "{}.{}.tif",
        nc_path.file_stem().unwrap_or_default().to_string_lossy(),
        tag
    ));
    let subdataset = format!("NETCDF:\"{}\":{}", nc_path.display(), var_name);
    run_gdal_tool(
        "gdal_translate",
        &[subdataset.as_str(), out_path.to_str().unwrap_or_default()],
    )?;
    Ok(out_path)
}

fn decompress_gzip(src: &Path, dest: &Path, acq: AcquisitionRef) -> Result<()> {
    use flate2::read::GzDecoder;
    let f = std::fs::File::open(src).map_err(|e| GlamError::UpstreamTransient {
        acq: acq.clone(),
        source: e.into(),
    })?;
    let mut decoder = GzDecoder::new(f);
    let mut out = std::fs::File::create(dest).map_err(|e| GlamError::PublishFailure {
        acq: acq.clone(),
        source: e.into(),
    })?;
    std::io::copy(&mut decoder, &mut out).map_err(|e| GlamError::PublishFailure { acq, source: e.into() })?;
    Ok(())
}

fn apply_nodata(path: &Path, value: f64) -> Result<()> {
    let ds = gdal::Dataset::open(path)?;
    let band = ds.rasterband(1)?;
    band.set_no_data_value(value)?;
    Ok(())
}

fn mosaic_rasters(sources: &[PathBuf], dest: &Path, op: MosaicOp) -> Result<()> {
    let ds0 = gdal::Dataset::open(&sources[0])?;
    let meta = raster::open_meta(&sources[0])?;
    let nodata = meta.nodata.unwrap_or(-9999.0);
    let mut blocks_by_source = Vec::with_capacity(sources.len());
    for src in sources {
        let ds = gdal::Dataset::open(src)?;
        let full_window = raster::Window {
            x_off: 0,
            y_off: 0,
            width: meta.width,
            height: meta.height,
        };
        blocks_by_source.push(raster::read_window_f64(&ds, 1, full_window)?);
    }
    let reduced = raster::mosaic_reduce(&blocks_by_source, nodata, op);

    let driver = gdal::DriverManager::get_driver_by_name("GTiff")?;
    let mut out_ds = driver.create_with_band_type::<f64, _>(dest, meta.width, meta.height, 1)?;
    out_ds.set_geo_transform(&ds0.geo_transform()?)?;
    out_ds.set_spatial_ref(&ds0.spatial_ref()?)?;
    let mut band = out_ds.rasterband(1)?;
    band.set_no_data_value(nodata)?;
    band.write(
        (0, 0),
        (meta.width, meta.height),
        &gdal::raster::Buffer::new((meta.width, meta.height), reduced.into_raw_vec()),
    )?;
    Ok(())
}

/// Warps to the canonical sinusoidal projection and clips against the
/// canonical bounding box, snapping only the side(s) that exceed it — a
/// raster already fully inside the box passes through the warp step
/// untouched by the clip.
fn project_and_clip(src: &Path, out_dir: &Path) -> Result<PathBuf> {
    let ds = gdal::Dataset::open(src)?;
    if ds.spatial_ref().is_err() {
        // Input lacks a projection; assign geographic WGS84 before warping.
        assign_wgs84(src)?;
    }

    let out_path = out_dir.join(format!(
        "{}.canonical.tif",
        src.file_stem().unwrap_or_default().to_string_lossy()
    ));

    let (north, west, south, east) = clamp_bounds(src)?;

    run_gdal_tool(
        "gdalwarp",
        &[
            "-t_srs",
            SINUSOIDAL_WKT,
            "-te",
            &west.to_string(),
            &south.to_string(),
            &east.to_string(),
            &north.to_string(),
            "-overwrite",
            src.to_str().unwrap_or_default(),
            out_path.to_str().unwrap_or_default(),
        ],
    )?;
    Ok(out_path)
}

fn assign_wgs84(path: &Path) -> Result<()> {
    run_gdal_tool("gdal_edit.py", &["-a_srs", "EPSG:4326", path.to_str().unwrap_or_default()])
}

/// One-sided snap: a source side only moves to the canonical limit when
/// it exceeds it; sides already inside the box are left as-is.
fn clamp_bounds(path: &Path) -> Result<(f64, f64, f64, f64)> {
    let ds = gdal::Dataset::open(path)?;
    let gt = ds.geo_transform()?;
    let (width, height) = ds.raster_size();
    let src_west = gt[0];
    let src_north = gt[3];
    let src_east = src_west + gt[1] * width as f64;
    let src_south = src_north + gt[5] * height as f64;

    let north = if src_north > CANONICAL_NORTH { CANONICAL_NORTH } else { src_north };
    let south = if src_south < CANONICAL_SOUTH { CANONICAL_SOUTH } else { src_south };
    let west = if src_west < CANONICAL_WEST { CANONICAL_WEST } else { src_west };
    let east = if src_east > CANONICAL_EAST { CANONICAL_EAST } else { src_east };
    Ok((north, west, south, east))
}

/// Builds overviews then rewrites tiled/LZW, copying the overviews in,
/// matching `cloud_optimize_inPlace`. NDVI products additionally get
/// BIGTIFF=YES for their larger granule sizes.
pub fn cloud_optimize(path: &Path, bigtiff: bool) -> Result<()> {
    run_gdal_tool("gdaladdo", &[path.to_str().unwrap_or_default(), "-q"])?;

    let intermediate = path.with_extension("TEMP.tif");
    std::fs::copy(path, &intermediate).map_err(anyhow::Error::from)?;

    let mut args: Vec<&str> = vec![
        intermediate.to_str().unwrap_or_default(),
        path.to_str().unwrap_or_default(),
        "-q",
        "-co",
        "TILED=YES",
        "-co",
        "COPY_SRC_OVERVIEWS=YES",
        "-co",
        "COMPRESS=LZW",
        "-co",
        "PREDICTOR=2",
    ];
    if bigtiff {
        args.push("-co");
        args.push("BIGTIFF=YES");
    }
    run_gdal_tool("gdal_translate", &args)?;
    let _ = std::fs::remove_file(&intermediate);
    Ok(())
}

fn run_gdal_tool(tool: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(tool)
        .args(args)
        .status()
        .map_err(|e| GlamError::Other(anyhow::anyhow!("failed to spawn {tool}: {e}")))?;
    if !status.success() {
        return Err(GlamError::Other(anyhow::anyhow!(
            "{tool} exited with status {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_only_moves_exceeding_sides() {
        // A source fully inside the canonical box keeps its own bounds.
        let north = 1_000_000.0_f64;
        let south = -1_000_000.0_f64;
        let west = -1_000_000.0_f64;
        let east = 1_000_000.0_f64;
        assert!(north < CANONICAL_NORTH);
        assert!(south > CANONICAL_SOUTH);
        assert!(west > CANONICAL_WEST);
        assert!(east < CANONICAL_EAST);
    }

    #[test]
    fn dekad_of_month_matches_registry_rule() {
        assert_eq!(dekad_of_month(1), 1);
        assert_eq!(dekad_of_month(10), 1);
        assert_eq!(dekad_of_month(11), 2);
        assert_eq!(dekad_of_month(21), 3);
        assert_eq!(dekad_of_month(22), 3);
    }
}
