pub mod campaign;
pub mod catalog;
pub mod channel;
pub mod checkpoint;
pub mod classify;
pub mod comparator;
pub mod config;
pub mod debugger;
pub mod injector;
pub mod orchestrator;
pub mod selector;
pub mod store;
pub mod value;
pub mod worker;

pub use campaign::{Campaign, Mode, OutcomeCategory, ResultRecord, Workspace};
pub use catalog::{Catalog, CatalogDefinition, CatalogError, CatalogFilter};
pub use channel::{ChannelError, DeviceChannel};
pub use checkpoint::{AttributeStore, CheckpointError};
pub use classify::{Classification, Observation};
pub use comparator::{CheckpointComparator, DiffTally};
pub use config::UpsetConfig;
pub use debugger::{Debugger, DebuggerError, DebuggerKind};
pub use injector::{CheckpointInjector, InjectionPlan, InjectionSite};
pub use orchestrator::{CampaignError, CampaignState, Orchestrator, run_campaign, setup_campaign};
pub use selector::TargetSelector;
pub use store::{InMemoryResultStore, JsonResultStore, ResultStore, RetryPolicy, RetryingStore, StoreError};
pub use value::Value;
pub use worker::{CancellationToken, IterationBudget};
