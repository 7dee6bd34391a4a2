//! Resource plugins for the nodecap scheduler.
//!
//! [`ResourcePlugin`] binds one [`ResourceKind`] to a [`ResourceStore`] and
//! exposes the node lifecycle, accounting and allocation operations. The
//! three kinds are [`CpuMemKind`], [`StorageKind`] and [`VolumeKind`].
//!
//! [`ResourceStore`]: nodecap_store::ResourceStore

pub mod context;
pub mod cpumem;
pub mod error;
pub mod kind;
pub mod plugin;
pub mod storage;
pub mod volume;

pub use context::OpContext;
pub use cpumem::CpuMemKind;
pub use error::{PluginError, PluginResult};
pub use kind::{
    Deploy, DeployCapacity, DeployOf, IdleNode, InfoOf, NodeCapacityInfo, Realloc, ReallocOf,
    ResourceKind, ResourceUpdate, UNBOUNDED, UpdateOf,
};
pub use plugin::ResourcePlugin;
pub use storage::StorageKind;
pub use volume::VolumeKind;
