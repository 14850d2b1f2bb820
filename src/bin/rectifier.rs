use glam_pipeline::config::GlamConfig;
use glam_pipeline::rectifier;
use glam_pipeline::state::GlamState;
use tracing_subscriber::EnvFilter;

/// Standalone long-running Rectifier process: builds process state, spawns
/// the background scan-and-backfill loop, then blocks forever. Split out of
/// `glam` so the backfill daemon can be deployed and scaled independently of
/// the update-cycle CLI.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("glam_pipeline=info")))
        .init();

    let config_path = std::env::var("GLAM_CONFIG").unwrap_or_else(|_| "./glam.toml".to_string());
    let config = GlamConfig::load(&config_path)?;
    let state = GlamState::build(config)?;

    tracing::info!("glam-rectifier starting");
    rectifier::spawn_rectifier(state);

    std::future::pending::<()>().await;
    Ok(())
}
