//! Static per-product metadata: cadence, epoch, URL templates, fetch plan shape.
//!
//! Every product-specific rule lives behind this module. Callers match on
//! [`ProductId`] only to select a [`Product`] descriptor; no other module
//! branches on product identity.

use crate::error::{GlamError, Result};
use chrono::{Datelike, NaiveDate};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductId {
    Chirps,
    ChirpsPrelim,
    Swi,
    Merra2,
    Mod09Q1,
    Mod13Q1,
    Myd09Q1,
    Myd13Q1,
}

impl ProductId {
    pub const ALL: &'static [ProductId] = &[
        ProductId::Chirps,
        ProductId::ChirpsPrelim,
        ProductId::Swi,
        ProductId::Merra2,
        ProductId::Mod09Q1,
        ProductId::Mod13Q1,
        ProductId::Myd09Q1,
        ProductId::Myd13Q1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProductId::Chirps => "chirps",
            ProductId::ChirpsPrelim => "chirps-prelim",
            ProductId::Swi => "swi",
            ProductId::Merra2 => "merra-2",
            ProductId::Mod09Q1 => "MOD09Q1",
            ProductId::Mod13Q1 => "MOD13Q1",
            ProductId::Myd09Q1 => "MYD09Q1",
            ProductId::Myd13Q1 => "MYD13Q1",
        }
    }

    pub fn parse(s: &str) -> Option<ProductId> {
        ProductId::ALL.iter().copied().find(|p| p.as_str() == s)
    }

    pub fn category(self) -> Category {
        match self {
            ProductId::Mod09Q1 | ProductId::Mod13Q1 | ProductId::Myd09Q1 | ProductId::Myd13Q1 => {
                Category::Ndvi
            }
            _ => Category::Ancillary,
        }
    }

    pub fn descriptor(self) -> Product {
        Product::for_id(self)
    }

    /// The resolution-class stem region/mask auxiliary rasters are keyed
    /// under. Merra-2's three collections (min/mean/max) share one set of
    /// region and mask rasters, so this is just the product id itself.
    pub fn raster_family(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Ndvi,
    Ancillary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily,
    FiveDay,
    Dekad,
    EightDay,
    SixteenDay,
    SixteenDayOffset,
}

/// Static descriptor for one product. Built once per [`ProductId`]; never mutated.
///
/// `collections` enumerates the sub-products one acquisition fetch yields:
/// every product but merra-2 has exactly one implicit collection (the empty
/// string, matching the catalog's `collection` column default); merra-2's
/// single 5-day fetch plan yields three (`min`, `mean`, `max`) from one
/// upstream round-trip, per §4.F.
#[derive(Debug, Clone)]
pub struct Product {
    pub id: ProductId,
    pub cadence: Cadence,
    pub epoch: NaiveDate,
    pub category: Category,
    pub collections: &'static [&'static str],
}

const NO_COLLECTION: &[&str] = &[""];
const MERRA_COLLECTIONS: &[&str] = &["min", "mean", "max"];

impl Product {
    fn for_id(id: ProductId) -> Product {
        match id {
            ProductId::Chirps => Product {
                id,
                cadence: Cadence::Dekad,
                epoch: NaiveDate::from_ymd_opt(1981, 1, 1).unwrap(),
                category: Category::Ancillary,
                collections: NO_COLLECTION,
            },
            ProductId::ChirpsPrelim => Product {
                id,
                cadence: Cadence::Dekad,
                epoch: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
                category: Category::Ancillary,
                collections: NO_COLLECTION,
            },
            ProductId::Swi => Product {
                id,
                cadence: Cadence::Dekad,
                epoch: NaiveDate::from_ymd_opt(2007, 1, 1).unwrap(),
                category: Category::Ancillary,
                collections: NO_COLLECTION,
            },
            ProductId::Merra2 => Product {
                id,
                cadence: Cadence::FiveDay,
                epoch: NaiveDate::from_ymd_opt(1980, 1, 1).unwrap(),
                category: Category::Ancillary,
                collections: MERRA_COLLECTIONS,
            },
            ProductId::Mod09Q1 => Product {
                id,
                cadence: Cadence::EightDay,
                epoch: NaiveDate::from_ymd_opt(2000, 2, 18).unwrap(),
                category: Category::Ndvi,
                collections: NO_COLLECTION,
            },
            // Aqua (MYD*) launched mid-2002; its archive has no granules before this date.
            ProductId::Myd09Q1 => Product {
                id,
                cadence: Cadence::EightDay,
                epoch: NaiveDate::from_ymd_opt(2002, 7, 4).unwrap(),
                category: Category::Ndvi,
                collections: NO_COLLECTION,
            },
            ProductId::Mod13Q1 => Product {
                id,
                cadence: Cadence::SixteenDay,
                epoch: NaiveDate::from_ymd_opt(2000, 2, 18).unwrap(),
                category: Category::Ndvi,
                collections: NO_COLLECTION,
            },
            // Aqua's 16-day cadence is offset by 8 days from Terra's, resetting
            // to day-of-year 9 (not 1) on year rollover.
            ProductId::Myd13Q1 => Product {
                id,
                cadence: Cadence::SixteenDayOffset,
                epoch: NaiveDate::from_ymd_opt(2002, 7, 4).unwrap(),
                category: Category::Ndvi,
                collections: NO_COLLECTION,
            },
        }
    }

    /// Generates the full cadence-legal acquisition sequence in `(from, to]`.
    pub fn expected_dates(&self, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        match self.cadence {
            Cadence::Daily => daily_dates(from, to),
            Cadence::FiveDay => step_dates(from, to, 5),
            Cadence::Dekad => dekad_dates(from, to),
            Cadence::EightDay => anchored_dates(from, to, 8, 1),
            Cadence::SixteenDay => anchored_dates(from, to, 16, 1),
            Cadence::SixteenDayOffset => anchored_dates(from, to, 16, 9),
        }
    }

    /// Canonical on-disk / object-store filename for an acquisition.
    /// `collection` is the trailing discriminator for products with more
    /// than one collection (merra-2's min/mean/max); `None` or `""` omits it.
    pub fn canonical_path(&self, date: NaiveDate, collection: Option<&str>) -> String {
        match self.category {
            Category::Ndvi => format!("{}.{}.{:03}.tif", self.id, date.year(), date.ordinal()),
            Category::Ancillary => match collection.filter(|c| !c.is_empty()) {
                Some(c) => format!("{}.{}.{}.tif", self.id, date.format("%Y-%m-%d"), c),
                None => format!("{}.{}.tif", self.id, date.format("%Y-%m-%d")),
            },
        }
    }
}

fn daily_dates(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    step_dates(from, to, 1)
}

fn step_dates(from: NaiveDate, to: NaiveDate, step_days: i64) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut d = from + chrono::Duration::days(step_days);
    while d <= to {
        out.push(d);
        d += chrono::Duration::days(step_days);
    }
    out
}

/// Days {1, 11, 21} of each month, strictly after `from` and up to `to`.
fn dekad_dates(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut year = from.year();
    let mut month = from.month();
    loop {
        for day in [1u32, 11, 21] {
            if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
                if d > from && d <= to {
                    out.push(d);
                }
            }
        }
        if month == 12 {
            month = 1;
            year += 1;
        } else {
            month += 1;
        }
        if NaiveDate::from_ymd_opt(year, month, 1).map(|d| d > to).unwrap_or(true) {
            break;
        }
    }
    out
}

/// `step`-day cadence anchored to day-of-year `offset` (1-based), resetting
/// at each year boundary rather than drifting across it.
fn anchored_dates(from: NaiveDate, to: NaiveDate, step: u32, offset: u32) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut year = from.year();
    loop {
        let mut doy = offset;
        loop {
            let Some(d) = NaiveDate::from_yo_opt(year, doy) else {
                break;
            };
            if d > from && d <= to {
                out.push(d);
            }
            if d > to {
                break;
            }
            doy += step;
        }
        year += 1;
        if NaiveDate::from_yo_opt(year, offset).map(|d| d > to).unwrap_or(true) {
            break;
        }
    }
    out
}

/// Parses a canonical filename back into `(product, date, collection)`.
/// Mirrors `getMetadata()` in the source pipeline's date/product parsing.
pub fn parse_canonical_path(path: &str) -> Result<(ProductId, NaiveDate, Option<String>)> {
    let basename = path.rsplit('/').next().unwrap_or(path);
    let stem = basename.strip_suffix(".tif").unwrap_or(basename);
    let parts: Vec<&str> = stem.split('.').collect();
    if parts.is_empty() {
        return Err(GlamError::BadInput(format!("empty filename '{path}'")));
    }

    let id = ProductId::parse(parts[0])
        .ok_or_else(|| GlamError::BadInput(format!("unknown product in '{path}'")))?;

    match id.category() {
        Category::Ndvi => {
            if parts.len() < 3 {
                return Err(GlamError::BadInput(format!("malformed NDVI filename '{path}'")));
            }
            let combined = format!("{}.{}", parts[1], parts[2]);
            let date = NaiveDate::parse_from_str(&combined, "%Y.%j")
                .map_err(|e| GlamError::BadInput(format!("bad date in '{path}': {e}")))?;
            Ok((id, date, None))
        }
        Category::Ancillary => {
            if parts.len() < 2 {
                return Err(GlamError::BadInput(format!("malformed filename '{path}'")));
            }
            let date = NaiveDate::parse_from_str(parts[1], "%Y-%m-%d")
                .map_err(|e| GlamError::BadInput(format!("bad date in '{path}': {e}")))?;
            let collection = parts.get(2).map(|s| s.to_string());
            Ok((id, date, collection))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dekad_rollover_crosses_month() {
        let p = Product::for_id(ProductId::Chirps);
        let dates = p.expected_dates(
            NaiveDate::from_ymd_opt(2019, 11, 21).unwrap(),
            NaiveDate::from_ymd_opt(2019, 12, 11).unwrap(),
        );
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2019, 12, 1).unwrap(),
                NaiveDate::from_ymd_opt(2019, 12, 11).unwrap(),
            ]
        );
    }

    #[test]
    fn eight_day_resets_on_year_boundary() {
        let p = Product::for_id(ProductId::Mod09Q1);
        let dates = p.expected_dates(
            NaiveDate::from_ymd_opt(2019, 12, 27).unwrap(),
            NaiveDate::from_ymd_opt(2020, 1, 5).unwrap(),
        );
        // day 361 (2019-12-27) + 8 = day 369 overflows the year so the next
        // legal date is day 1 of 2020, not a drifted day in December.
        assert!(dates.contains(&NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()));
    }

    #[test]
    fn sixteen_day_offset_resets_to_day_nine() {
        let p = ProductId::Myd13Q1.descriptor();
        assert_eq!(p.cadence, Cadence::SixteenDayOffset);
        let dates = p.expected_dates(
            NaiveDate::from_ymd_opt(2019, 12, 20).unwrap(),
            NaiveDate::from_ymd_opt(2020, 1, 15).unwrap(),
        );
        assert!(dates.contains(&NaiveDate::from_ymd_opt(2020, 1, 9).unwrap()));
    }

    #[test]
    fn canonical_path_round_trips_ancillary() {
        let p = Product::for_id(ProductId::Chirps);
        let date = NaiveDate::from_ymd_opt(2019, 12, 1).unwrap();
        let path = p.canonical_path(date, None);
        assert_eq!(path, "chirps.2019-12-01.tif");
        let (id, parsed_date, collection) = parse_canonical_path(&path).unwrap();
        assert_eq!(id, ProductId::Chirps);
        assert_eq!(parsed_date, date);
        assert_eq!(collection, None);
    }

    #[test]
    fn canonical_path_round_trips_merra_collection() {
        let p = Product::for_id(ProductId::Merra2);
        let date = NaiveDate::from_ymd_opt(2019, 12, 25).unwrap();
        let path = p.canonical_path(date, Some("min"));
        assert_eq!(path, "merra-2.2019-12-25.min.tif");
        let (id, parsed_date, collection) = parse_canonical_path(&path).unwrap();
        assert_eq!(id, p.id);
        assert_eq!(parsed_date, date);
        assert_eq!(collection, Some("min".to_string()));
    }

    #[test]
    fn canonical_path_round_trips_ndvi() {
        let p = Product::for_id(ProductId::Mod09Q1);
        let date = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap();
        let path = p.canonical_path(date, None);
        assert_eq!(path, "MOD09Q1.2019.001.tif");
        let (id, parsed_date, _) = parse_canonical_path(&path).unwrap();
        assert_eq!(id, ProductId::Mod09Q1);
        assert_eq!(parsed_date, date);
    }

    #[test]
    fn expected_dates_strictly_increasing() {
        for id in ProductId::ALL {
            let p = id.descriptor();
            let dates = p.expected_dates(
                NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
            );
            for w in dates.windows(2) {
                assert!(w[0] < w[1], "{:?} not strictly increasing for {}", dates, id);
            }
        }
    }
}
