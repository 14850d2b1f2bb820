use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use glam_pipeline::config::GlamConfig;
use glam_pipeline::orchestrator::Orchestrator;
use glam_pipeline::registry::ProductId;
use glam_pipeline::rectifier;
use glam_pipeline::state::GlamState;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glam", about = "Agricultural raster discovery, acquisition, and zonal statistics pipeline")]
struct Cli {
    #[arg(long, default_value = "./glam.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs one discovery + acquisition + aggregation cycle for every
    /// known product, or a single `--product` if given.
    Update {
        #[arg(long)]
        product: Option<String>,
    },
    /// Lists acquisitions not yet marked `completed` for a product.
    ListMissing {
        #[arg(long)]
        product: String,
    },
    /// Runs the Rectifier's scan-and-backfill pass once, synchronously.
    RectifyStats {
        #[arg(long)]
        product: Option<String>,
    },
    /// Backfills a historical `[from, to]` date range for one product.
    FillArchive {
        #[arg(long)]
        product: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Deletes one acquisition's object, catalog row, and stats contribution.
    Purge {
        #[arg(long)]
        product: String,
        #[arg(long)]
        date: NaiveDate,
    },
}

fn parse_product(name: &str) -> anyhow::Result<ProductId> {
    ProductId::parse(name).ok_or_else(|| anyhow::anyhow!("unknown product '{name}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("glam_pipeline=info")))
        .init();

    let cli = Cli::parse();
    let config = GlamConfig::load(&cli.config)?;
    let state = GlamState::build(config)?;

    match cli.command {
        Command::Update { product } => {
            let products: Vec<ProductId> = match product {
                Some(name) => vec![parse_product(&name)?],
                None => ProductId::ALL.to_vec(),
            };
            let orchestrator = Orchestrator::new(state);
            let today = chrono::Utc::now().date_naive();
            let cycle = orchestrator.run_cycle(&products, today).await?;
            for (product, report) in cycle.by_product {
                tracing::info!(
                    "{product}: fetched {} acquisition(s), {} error(s)",
                    report.fetched.len(),
                    report.errors.len()
                );
                for (date, err) in &report.errors {
                    tracing::warn!("{product} {date}: {err}");
                }
            }
        }
        Command::ListMissing { product } => {
            let product = parse_product(&product)?;
            let plan_collection = product.descriptor().collections[0];
            for date in state.catalog.missing_by_product(product.as_str(), plan_collection)? {
                println!("{date}");
            }
        }
        Command::RectifyStats { product } => {
            let gaps = rectifier::scan(&state).await?;
            let gaps: Vec<_> = match product {
                Some(name) => {
                    let product = parse_product(&name)?;
                    gaps.into_iter().filter(|g| g.product == product).collect()
                }
                None => gaps,
            };
            tracing::info!("rectify-stats: {} gap(s) found", gaps.len());
            rectifier::rectify(&state, &gaps).await?;
        }
        Command::FillArchive { product, from, to } => {
            let product = parse_product(&product)?;
            let orchestrator = Orchestrator::new(state);
            let report = orchestrator.fill_archive(product, from, to).await?;
            tracing::info!(
                "fill-archive {product}: fetched {} acquisition(s), {} error(s)",
                report.fetched.len(),
                report.errors.len()
            );
        }
        Command::Purge { product, date } => {
            let product = parse_product(&product)?;
            let orchestrator = Orchestrator::new(state);
            orchestrator.purge(product, date).await?;
            tracing::info!("purged {product} {date}");
        }
    }

    Ok(())
}
