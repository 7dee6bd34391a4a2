//! Generic capacity/usage bookkeeping.
//!
//! Every resource kind describes its tracked dimensions with a
//! [`ResourceArgs`] type; [`NodeResourceInfo`] pairs a capacity and a usage
//! value of that type and enforces the invariants that must hold before the
//! pair is persisted:
//!
//! 1. every key tracked in usage also exists in capacity,
//! 2. `0 <= usage <= capacity` for every dimension,
//! 3. a missing usage is read back as all-zero over the capacity keys,
//! 4. declared NUMA topology covers every core and has a memory quota.
//!
//! Nothing here touches storage; callers own the values they mutate.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Tracked dimensions of one resource kind.
///
/// `add`/`sub` are element-wise over every map dimension, treating missing
/// keys as zero.
pub trait ResourceArgs:
    Clone + Default + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn add(&mut self, delta: &Self);

    fn sub(&mut self, delta: &Self);

    /// Same keys as `self`, every value zero.
    fn zeroed(&self) -> Self;

    /// Insert a zero entry for every key of `capacity` missing from `self`.
    fn fill_missing(&mut self, capacity: &Self);

    /// Check a capacity/usage pair, returning the first violation.
    fn validate(capacity: &Self, usage: &Self) -> CoreResult<()>;

    /// Drop dimension entries that are zero in both capacity and usage.
    fn prune_empty(_capacity: &mut Self, _usage: &mut Self) {}
}

/// Capacity and usage of one node for one resource kind.
///
/// Serialized as `{"Capacity": .., "Usage": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "StoredInfo<A>",
    bound(serialize = "A: Serialize", deserialize = "A: ResourceArgs")
)]
pub struct NodeResourceInfo<A> {
    #[serde(rename = "Capacity")]
    pub capacity: A,
    #[serde(rename = "Usage")]
    pub usage: A,
}

/// Wire shape before the usage default is applied.
#[derive(Deserialize)]
#[serde(bound = "A: DeserializeOwned")]
struct StoredInfo<A> {
    #[serde(rename = "Capacity", default)]
    capacity: Option<A>,
    #[serde(rename = "Usage", default)]
    usage: Option<A>,
}

impl<A: ResourceArgs> TryFrom<StoredInfo<A>> for NodeResourceInfo<A> {
    type Error = CoreError;

    fn try_from(stored: StoredInfo<A>) -> Result<Self, Self::Error> {
        let capacity = stored.capacity.ok_or(CoreError::InvalidCapacity)?;
        let mut usage = stored.usage.unwrap_or_else(|| capacity.zeroed());
        usage.fill_missing(&capacity);
        Ok(Self { capacity, usage })
    }
}

impl<A: ResourceArgs> NodeResourceInfo<A> {
    /// A fresh node: the given capacity and zero usage.
    pub fn new(capacity: A) -> Self {
        let usage = capacity.zeroed();
        Self { capacity, usage }
    }

    /// `Capacity - Usage`, computed on a copy.
    pub fn available(&self) -> A {
        let mut available = self.capacity.clone();
        available.sub(&self.usage);
        available
    }

    /// Give every capacity key a usage entry.
    pub fn normalize(&mut self) {
        self.usage.fill_missing(&self.capacity);
    }

    pub fn validate(&self) -> CoreResult<()> {
        A::validate(&self.capacity, &self.usage)
    }

    pub fn prune_empty(&mut self) {
        A::prune_empty(&mut self.capacity, &mut self.usage);
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
