//! Continuous application engine: configuration, the cycle state machine, the
//! bounded dispatcher and end-of-run reporting.

use autoapply_storage::StoreError;
use thiserror::Error;

pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod report;
pub mod state;

pub use config::EngineConfig;
pub use dispatcher::{DispatchItem, DispatchReport, DispatchSettings, Dispatcher};
pub use orchestrator::{select_for_dispatch, Orchestrator};
pub use state::{CyclePhase, MonitorReceiver, MonitorSnapshot, SystemState};

pub const CRATE_NAME: &str = "autoapply-engine";

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad configuration; raised before the first cycle runs.
    #[error("invalid configuration: {0}")]
    FatalConfig(String),
    #[error("persisting engine state failed {consecutive_failures} times in a row: {source}")]
    Persistence {
        consecutive_failures: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
