pub mod ensemble;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod probe;
pub mod providers;
pub mod registry;
pub mod scoring;
pub mod service;
pub mod types;

// Re-export core types at crate root for convenience.
pub use ensemble::MergeKeys;
pub use error::{FailedAttempt, RouteError};
pub use executor::{DispatchEvent, RequestExecutor};
pub use ledger::{PerformanceLedger, PerformanceRecord};
pub use probe::{AvailabilityProber, AvailabilityRecord, ProbeEvent};
pub use providers::{ProviderClient, ProviderError, ProviderRegistry};
pub use registry::{TaskProfile, TaskRegistry, default_task_catalog};
pub use scoring::{ModelScorer, ScoredCandidate};
pub use service::RoutingService;
pub use types::*;
