pub mod config;
pub mod kv;
pub mod logging;

pub use config::{
    ExecutorConfig, LedgerConfig, ProberConfig, ProviderEndpoints, SavoraConfig, ScoringWeights,
};
pub use kv::{KvStore, MemoryKvStore, SqliteKvStore, TieredKvStore};
pub use logging::{init_logging, init_logging_to_dir};
