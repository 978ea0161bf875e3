//! Declarative configuration: model, validation and the hot-reloading store.

mod model;
mod store;
mod validation;

pub use model::{
    BreakerConfig, CoordinatorConfig, DecisionType, ExecutorConfig, GateConfig, JobGateConfig,
    LoggingConfig, Lookback, QueueConfig, SchedulerConfig, SubTaskRef, WindowSpec, WorkflowSpec,
    WriterConfig,
};
pub use store::{load_config, parse_config, ConfigStore, ReloadOutcome};
pub use validation::{validate_config, validate_workflow};
