use std::fmt;

/// Identity of the acquisition a [`GlamError`] occurred against, for logging and retry.
#[derive(Debug, Clone)]
pub struct AcquisitionRef {
    pub product: String,
    pub date: chrono::NaiveDate,
    pub collection: Option<String>,
}

impl fmt::Display for AcquisitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(c) => write!(f, "{}.{}.{}", self.product, self.date, c),
            None => write!(f, "{}.{}", self.product, self.date),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GlamError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("missing credential '{0}', skipping dependent work")]
    MissingCredential(&'static str),

    #[error("{acq}: no upstream file detected")]
    UpstreamUnavailable { acq: AcquisitionRef },

    #[error("{acq}: transient upstream failure: {source}")]
    UpstreamTransient {
        acq: AcquisitionRef,
        #[source]
        source: anyhow::Error,
    },

    #[error("{acq}: failed to publish: {source}")]
    PublishFailure {
        acq: AcquisitionRef,
        #[source]
        source: anyhow::Error,
    },

    #[error("{acq}: aggregation failed: {source}")]
    AggregationFailure {
        acq: AcquisitionRef,
        #[source]
        source: anyhow::Error,
    },

    #[error("schema race on {0}, treating as success")]
    SchemaRace(String),

    #[error("{acq}: connection lost during stats upload: {source}")]
    ConnectionLost {
        acq: AcquisitionRef,
        #[source]
        source: anyhow::Error,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("raster I/O error: {0}")]
    Raster(#[from] gdal::errors::GdalError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GlamError {
    /// Errors in this set are expected to recur and should not abort sibling work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GlamError::UpstreamTransient { .. } | GlamError::ConnectionLost { .. }
        )
    }

    /// `SchemaRace` on a known-idempotent DDL statement is not a real failure.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, GlamError::SchemaRace(_))
    }
}

pub type Result<T> = std::result::Result<T, GlamError>;
