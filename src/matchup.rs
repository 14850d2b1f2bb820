//! Static allow-list of (region, crop mask) pairs the Zonal Aggregator is
//! permitted to produce statistics for. Grounded on `admins`/`crops` in
//! `original_source/glam_data_processing/__init__.py`: one global GAUL
//! admin-1 layer paired with the cropmonitor crop masks, plus Brazil's four
//! subnational admin layers paired only with Brazil-specific crop codes.
//! `nomask` is implicitly permitted against every region.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

pub const NOMASK: &str = "nomask";

/// Region rasters known to the system. `gaul1` is the global admin-1
/// boundary set used by every ancillary/NDVI product; the `BR_*` layers are
/// Brazil-specific subnational boundaries.
pub const REGIONS: &[&str] = &["gaul1", "BR_Mesoregion", "BR_Microregion", "BR_Municipality", "BR_State"];

/// Cropmonitor masks, permitted against the global `gaul1` region.
const GLOBAL_CROPS: &[&str] = &["maize", "rice", "soybean", "springwheat", "winterwheat", "cropland"];

/// A sample of the Brazil safra-season crop codes, permitted only against
/// the `BR_*` regions.
const BRAZIL_CROPS: &[&str] = &[
    "2S-MTZSafraZ2014_2015",
    "2S-PRZSafraZ2013_2014",
    "CV-GOZSafraZ2014_2015",
    "CV-MGZSafraZ2013_2014",
];

pub struct MatchupPolicy {
    table: HashMap<&'static str, HashSet<&'static str>>,
}

impl MatchupPolicy {
    /// Process-wide singleton, built once (same discipline as the Product
    /// Registry's static descriptor table).
    pub fn global() -> &'static MatchupPolicy {
        static POLICY: LazyLock<MatchupPolicy> = LazyLock::new(MatchupPolicy::build);
        &POLICY
    }

    fn build() -> Self {
        let mut table: HashMap<&'static str, HashSet<&'static str>> = HashMap::new();

        let mut gaul: HashSet<&'static str> = GLOBAL_CROPS.iter().copied().collect();
        gaul.insert(NOMASK);
        table.insert("gaul1", gaul);

        for region in &REGIONS[1..] {
            let mut crops: HashSet<&'static str> = BRAZIL_CROPS.iter().copied().collect();
            crops.insert(NOMASK);
            table.insert(region, crops);
        }

        Self { table }
    }

    /// Whether the Aggregator may produce statistics for `(region, mask)`.
    /// `nomask` is always permitted regardless of region.
    pub fn allowed(&self, region: &str, mask: &str) -> bool {
        mask == NOMASK || self.table.get(region).is_some_and(|masks| masks.contains(mask))
    }

    /// All masks permitted for `region`, including `nomask`.
    pub fn masks_for_region(&self, region: &str) -> Vec<&'static str> {
        self.table
            .get(region)
            .map(|masks| masks.iter().copied().collect())
            .unwrap_or_else(|| vec![NOMASK])
    }

    pub fn regions(&self) -> &'static [&'static str] {
        REGIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nomask_allowed_everywhere() {
        let policy = MatchupPolicy::global();
        assert!(policy.allowed("gaul1", NOMASK));
        assert!(policy.allowed("BR_State", NOMASK));
        assert!(policy.allowed("unknown-region", NOMASK));
    }

    #[test]
    fn brazil_crops_not_permitted_against_gaul() {
        let policy = MatchupPolicy::global();
        assert!(!policy.allowed("gaul1", "2S-MTZSafraZ2014_2015"));
        assert!(policy.allowed("BR_State", "2S-MTZSafraZ2014_2015"));
    }

    #[test]
    fn cropmonitor_masks_not_permitted_against_brazil() {
        let policy = MatchupPolicy::global();
        assert!(!policy.allowed("BR_Mesoregion", "maize"));
        assert!(policy.allowed("gaul1", "maize"));
    }
}
