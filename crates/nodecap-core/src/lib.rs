//! Resource model for node capacity accounting.
//!
//! Each resource kind (cpu/memory, storage, volumes) has node arguments,
//! workload options and workload arguments, plus the arithmetic and
//! validation that keeps a node's usage inside its capacity. Shared pieces
//! live here too: raw request parameters, unit parsing, and configuration.

pub mod accounting;
pub mod config;
pub mod cpumem;
pub mod error;
pub mod params;
pub mod storage;
pub mod units;
pub mod volume;

pub use accounting::{NodeResourceInfo, ResourceArgs};
pub use config::{NodecapConfig, SchedulerConfig, StoreConfig};
pub use error::{CoreError, CoreResult};
pub use params::RawParams;
