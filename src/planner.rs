//! Combines the Catalog Store and Product Registry cadence rules to
//! compute which acquisitions ought to exist, then narrows that set
//! against live availability.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::probe::{Availability, Probe};
use crate::registry::ProductId;
use chrono::NaiveDate;

pub struct GapPlanner<'a> {
    catalog: &'a Catalog,
    probe: &'a Probe,
}

impl<'a> GapPlanner<'a> {
    pub fn new(catalog: &'a Catalog, probe: &'a Probe) -> Self {
        Self { catalog, probe }
    }

    /// The set of acquisitions the system ought to have for `product` as
    /// of `today`: previously-recorded pending dates, unioned with newly
    /// expected dates since the latest known date.
    pub fn missing(&self, product: ProductId, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let descriptor = product.descriptor();
        // Merra-2's three collections share one 5-day fetch cycle, so pending
        // dates are tracked against a single representative collection
        // rather than tripled across min/mean/max.
        let plan_collection = descriptor.collections[0];
        let mut out = self.catalog.missing_by_product(product.as_str(), plan_collection)?;

        let since = self
            .catalog
            .latest_date(product.as_str(), plan_collection)?
            .unwrap_or(descriptor.epoch);
        for date in descriptor.expected_dates(since, today) {
            self.catalog.upsert_pending(product.as_str(), date, plan_collection)?;
            if !out.contains(&date) {
                out.push(date);
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Narrows `candidates` to ones the Availability Probe currently
    /// reports as fetchable. Transient failures are kept (retried next
    /// cycle); definitive non-availability is dropped.
    pub async fn filter_available(
        &self,
        product: ProductId,
        candidates: Vec<NaiveDate>,
    ) -> Result<Vec<NaiveDate>> {
        let mut out = Vec::with_capacity(candidates.len());
        for date in candidates {
            match self.probe.check(product, date).await? {
                Availability::Yes | Availability::Transient => out.push(date),
                Availability::DefinitiveNo => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProductId;

    #[test]
    fn missing_generates_dekad_sequence_since_latest() {
        let catalog = Catalog::open(":memory:").unwrap();
        catalog
            .upsert_pending("chirps", NaiveDate::from_ymd_opt(2019, 11, 21).unwrap(), "")
            .unwrap();
        catalog
            .set_flag(
                "chirps",
                NaiveDate::from_ymd_opt(2019, 11, 21).unwrap(),
                "",
                "processed",
                true,
            )
            .unwrap();
        catalog
            .set_flag(
                "chirps",
                NaiveDate::from_ymd_opt(2019, 11, 21).unwrap(),
                "",
                "stat_gen",
                true,
            )
            .unwrap();

        let probe = Probe::new();
        let planner = GapPlanner::new(&catalog, &probe);
        let missing = planner
            .missing(ProductId::Chirps, NaiveDate::from_ymd_opt(2019, 12, 5).unwrap())
            .unwrap();
        assert_eq!(missing, vec![NaiveDate::from_ymd_opt(2019, 12, 1).unwrap()]);
    }
}
