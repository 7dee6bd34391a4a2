//! nodecap schedulers: CPU core binding and volume bin-packing.
//!
//! Both schedulers are pure functions over a node's available resources.
//! They never fail: a request that does not fit yields fewer (or zero)
//! plans. Plans are successive, so any prefix of the returned list can be
//! committed together.
//!
//! # Components
//!
//! - **`cpu`**: fractional share packing over whole and fragmented cores
//! - **`volume`**: exclusive, shared and unlimited-quota device placement

pub mod cpu;
pub mod volume;

pub use cpu::{CpuPlan, CpuRequest, cpu_plans};
pub use volume::volume_plans;
