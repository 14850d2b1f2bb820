use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `glam.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlamConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub rectifier: RectifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

fn default_catalog_path() -> String {
    "./glam_catalog.db".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    pub s3: Option<S3Config>,
    #[serde(default = "default_local_root")]
    pub local_root: String,
}

fn default_local_root() -> String {
    "./glam_objects".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Upstream credential bundle. Absent groups disable only the capability
/// that needs them; unrelated products still update.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub merra_user: Option<String>,
    pub merra_pass: Option<String>,
    pub swi_user: Option<String>,
    pub swi_pass: Option<String>,
    pub db_user: Option<String>,
    pub db_pass: Option<String>,
    pub purge_key: Option<String>,
}

impl CredentialsConfig {
    /// Layers environment variables on top of whatever was read from the TOML file.
    /// Env takes precedence.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("GLAM_MERRA_USER") {
            self.merra_user = Some(v);
        }
        if let Ok(v) = std::env::var("GLAM_MERRA_PASS") {
            self.merra_pass = Some(v);
        }
        if let Ok(v) = std::env::var("GLAM_SWI_USER") {
            self.swi_user = Some(v);
        }
        if let Ok(v) = std::env::var("GLAM_SWI_PASS") {
            self.swi_pass = Some(v);
        }
        if let Ok(v) = std::env::var("GLAM_DB_USER") {
            self.db_user = Some(v);
        }
        if let Ok(v) = std::env::var("GLAM_DB_PASS") {
            self.db_pass = Some(v);
        }
        if let Ok(v) = std::env::var("GLAM_PURGE_KEY") {
            self.purge_key = Some(v);
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_product_parallelism")]
    pub product_parallelism: usize,
    #[serde(default = "default_zonal_workers")]
    pub zonal_workers: usize,
    #[serde(default = "default_block_scale")]
    pub block_scale: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            product_parallelism: default_product_parallelism(),
            zonal_workers: default_zonal_workers(),
            block_scale: default_block_scale(),
        }
    }
}

fn default_product_parallelism() -> usize {
    4
}

fn default_zonal_workers() -> usize {
    8
}

fn default_block_scale() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct RectifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rectifier_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for RectifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_rectifier_interval(),
            dry_run: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_rectifier_interval() -> u64 {
    3600
}

impl GlamConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config: GlamConfig = toml::from_str(&contents)?;
        config.credentials = config.credentials.with_env_overrides();
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let cfg = GlamConfig::load("/nonexistent/glam.toml").unwrap();
        assert_eq!(cfg.catalog.path, "./glam_catalog.db");
        assert_eq!(cfg.concurrency.product_parallelism, 4);
        assert!(cfg.rectifier.enabled);
    }
}
