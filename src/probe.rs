//! Availability probes: per-product-family predicates deciding whether an
//! acquisition is fetchable right now. Built on one shared `reqwest::Client`
//! with per-call timeouts.

use crate::config::CredentialsConfig;
use crate::error::{AcquisitionRef, GlamError, Result};
use crate::registry::ProductId;
use chrono::NaiveDate;
use regex::Regex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Yes,
    DefinitiveNo,
    Transient,
}

/// Result of fetching one month's directory listing, kept un-interpreted
/// so the caller can apply a day-specific filename pattern against the
/// cached body.
#[derive(Debug, Clone)]
enum ListingOutcome {
    Body(String),
    DefinitiveNo,
    Transient,
}

pub struct Probe {
    http: reqwest::Client,
    credentials: CredentialsConfig,
}

impl Probe {
    pub fn new() -> Self {
        Self::with_credentials(CredentialsConfig::default())
    }

    pub fn with_credentials(credentials: CredentialsConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self { http, credentials }
    }

    pub async fn check(&self, product: ProductId, date: NaiveDate) -> Result<Availability> {
        match product {
            ProductId::Merra2 => self.listing_probe(product, date).await,
            ProductId::Chirps | ProductId::ChirpsPrelim => self.url_head_probe(product, date).await,
            ProductId::Swi => self.auth_head_probe(product, date).await,
            ProductId::Mod09Q1 | ProductId::Mod13Q1 | ProductId::Myd09Q1 | ProductId::Myd13Q1 => {
                self.catalog_lookup_probe(product, date).await
            }
        }
    }

    /// HTTP directory-listing probe: fetches the index page for the
    /// acquisition's (year, month) and regex-matches for the expected
    /// filename pattern. The temperature family mosaics five consecutive
    /// days ending at the acquisition date, so all five must individually
    /// list before the acquisition is reported available.
    async fn listing_probe(&self, product: ProductId, date: NaiveDate) -> Result<Availability> {
        let mut cache: std::collections::HashMap<(i32, u32), ListingOutcome> =
            std::collections::HashMap::new();
        for offset in 0..5i64 {
            let day = date - chrono::Duration::days(offset);
            let key = (day.format("%Y").to_string().parse().unwrap_or(0), day.format("%m").to_string().parse().unwrap_or(1));
            if !cache.contains_key(&key) {
                let outcome = self.fetch_listing(product, date, key.0, key.1).await?;
                cache.insert(key, outcome);
            }
            let pattern = Regex::new(&format!(r"merra2_.*\.{}\.nc4", day.format("%Y%m%d")))
                .map_err(|e| GlamError::BadInput(format!("bad listing regex: {e}")))?;
            match cache.get(&key).expect("just inserted") {
                ListingOutcome::DefinitiveNo => return Ok(Availability::DefinitiveNo),
                ListingOutcome::Transient => return Ok(Availability::Transient),
                ListingOutcome::Body(body) => {
                    if !pattern.is_match(body) {
                        return Ok(Availability::DefinitiveNo);
                    }
                }
            }
        }
        Ok(Availability::Yes)
    }

    /// Fetches (and does not interpret) the directory listing for one
    /// (year, month). Split out so [`listing_probe`] can cache a month's
    /// body across the several days of the 5-day window that fall in it.
    async fn fetch_listing(
        &self,
        product: ProductId,
        acq_date: NaiveDate,
        year: i32,
        month: u32,
    ) -> Result<ListingOutcome> {
        let url = format!("https://merra-archive.example/{year:04}/{month:02}/");
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Ok(ListingOutcome::Transient);
            }
            Err(e) => {
                return Err(GlamError::UpstreamTransient {
                    acq: acq_ref(product, acq_date),
                    source: e.into(),
                });
            }
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ListingOutcome::DefinitiveNo);
        }
        if resp.status().is_server_error() {
            return Ok(ListingOutcome::Transient);
        }
        let body = resp.text().await.map_err(|e| GlamError::UpstreamTransient {
            acq: acq_ref(product, acq_date),
            source: e.into(),
        })?;
        Ok(ListingOutcome::Body(body))
    }

    /// Plain URL HEAD/GET probe used for precipitation and its preliminary.
    /// A 200 must additionally carry the expected tiff/gzip content-type.
    async fn url_head_probe(&self, product: ProductId, date: NaiveDate) -> Result<Availability> {
        let url = precipitation_url(product, date);
        self.status_probe(
            product,
            date,
            self.http.head(&url),
            &["image/tiff", "application/gzip", "application/octet-stream"],
        )
        .await
    }

    /// Basic-auth-gated HEAD probe used for the soil-water product. Missing
    /// credentials are a `MissingCredential` error, not a probe failure: the
    /// caller skips this product's cycle rather than treating it as a
    /// definitive absence at the source.
    async fn auth_head_probe(&self, product: ProductId, date: NaiveDate) -> Result<Availability> {
        let (user, pass) = match (&self.credentials.swi_user, &self.credentials.swi_pass) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => return Err(GlamError::MissingCredential("swi_user/swi_pass")),
        };
        let url = format!("https://swi-archive.example/{}.nc", date.format("%Y%m%d"));
        self.status_probe(
            product,
            date,
            self.http.head(&url).basic_auth(user, Some(pass)),
            &["application/octet-stream"],
        )
        .await
    }

    async fn status_probe(
        &self,
        product: ProductId,
        date: NaiveDate,
        builder: reqwest::RequestBuilder,
        expected_content_types: &[&str],
    ) -> Result<Availability> {
        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => return Ok(Availability::Transient),
            Err(e) => {
                return Err(GlamError::UpstreamTransient {
                    acq: acq_ref(product, date),
                    source: e.into(),
                });
            }
        };
        if resp.status().is_server_error() {
            return Ok(Availability::Transient);
        }
        if !resp.status().is_success() {
            return Ok(Availability::DefinitiveNo);
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(
            if expected_content_types.iter().any(|ct| content_type.starts_with(ct)) {
                Availability::Yes
            } else {
                Availability::DefinitiveNo
            },
        )
    }

    /// Delegates to an external granule-assembly service's date catalog
    /// for the NDVI family.
    async fn catalog_lookup_probe(&self, product: ProductId, date: NaiveDate) -> Result<Availability> {
        let url = format!(
            "https://granule-service.example/catalog/{}?date={}",
            product,
            date.format("%Y-%m-%d")
        );
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => return Ok(Availability::Transient),
            Err(e) => {
                return Err(GlamError::UpstreamTransient {
                    acq: acq_ref(product, date),
                    source: e.into(),
                });
            }
        };
        if !resp.status().is_success() {
            return Ok(if resp.status().is_server_error() {
                Availability::Transient
            } else {
                Availability::DefinitiveNo
            });
        }
        let dates: Vec<String> = resp.json().await.map_err(|e| GlamError::UpstreamTransient {
            acq: acq_ref(product, date),
            source: e.into(),
        })?;
        Ok(if dates.iter().any(|d| d == &date.format("%Y-%m-%d").to_string()) {
            Availability::Yes
        } else {
            Availability::DefinitiveNo
        })
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}

fn precipitation_url(product: ProductId, date: NaiveDate) -> String {
    let dekad = dekad_of_month(date.format("%d").to_string().parse().unwrap_or(1));
    let stem = match product {
        ProductId::ChirpsPrelim => "chirps-prelim",
        _ => "chirps",
    };
    format!(
        "https://chirps-archive.example/{}/{}/{}.{}.tif.gz",
        stem,
        date.format("%Y"),
        date.format("%m"),
        dekad
    )
}

fn dekad_of_month(day: u32) -> u32 {
    ((day - 1) / 10 + 1).min(3)
}

fn acq_ref(product: ProductId, date: NaiveDate) -> AcquisitionRef {
    AcquisitionRef {
        product: product.to_string(),
        date,
        collection: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dekad_of_month_boundaries() {
        assert_eq!(dekad_of_month(1), 1);
        assert_eq!(dekad_of_month(10), 1);
        assert_eq!(dekad_of_month(11), 2);
        assert_eq!(dekad_of_month(20), 2);
        assert_eq!(dekad_of_month(21), 3);
        assert_eq!(dekad_of_month(22), 3);
        assert_eq!(dekad_of_month(31), 3);
    }

    #[tokio::test]
    async fn swi_probe_without_credentials_is_missing_credential() {
        let probe = Probe::new();
        let date = NaiveDate::from_ymd_opt(2019, 1, 28).unwrap();
        let err = probe.check(ProductId::Swi, date).await.unwrap_err();
        assert!(matches!(err, GlamError::MissingCredential("swi_user/swi_pass")));
    }
}
