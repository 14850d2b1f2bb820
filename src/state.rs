//! Process-wide bundle of the singletons every component consumes: a
//! single `Clone`-able struct built once at process start and threaded
//! through the Orchestrator, Gap Planner, Rectifier, and CLI subcommand
//! handlers by explicit argument, never as an implicit global.

use crate::catalog::Catalog;
use crate::config::GlamConfig;
use crate::matchup::MatchupPolicy;
use crate::object_store::{self, ObjectStore};
use crate::pipeline::Pipeline;
use crate::probe::Probe;
use std::sync::Arc;

#[derive(Clone)]
pub struct GlamState {
    pub config: Arc<GlamConfig>,
    pub catalog: Arc<Catalog>,
    pub object_store: Arc<dyn ObjectStore>,
    pub probe: Arc<Probe>,
    pub pipeline: Arc<Pipeline>,
    pub matchup: &'static MatchupPolicy,
}

impl GlamState {
    pub fn build(config: GlamConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(Catalog::open(&config.catalog.path)?);
        let object_store = object_store::build(&config.storage);
        let probe = Arc::new(Probe::with_credentials(config.credentials.clone()));
        let pipeline = Arc::new(Pipeline::new(config.credentials.clone()));
        Ok(Self {
            config: Arc::new(config),
            catalog,
            object_store,
            probe,
            pipeline,
            matchup: MatchupPolicy::global(),
        })
    }
}
