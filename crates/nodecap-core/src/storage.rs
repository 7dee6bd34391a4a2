//! Storage quota resource types.

use serde::{Deserialize, Serialize};

use crate::accounting::ResourceArgs;
use crate::error::{CoreError, CoreResult};
use crate::params::RawParams;
use crate::units::parse_bytes;

/// Capacity or usage of one node, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageArgs {
    pub storage: i64,
}

impl ResourceArgs for StorageArgs {
    fn add(&mut self, delta: &Self) {
        self.storage += delta.storage;
    }

    fn sub(&mut self, delta: &Self) {
        self.storage -= delta.storage;
    }

    fn zeroed(&self) -> Self {
        Self::default()
    }

    fn fill_missing(&mut self, _capacity: &Self) {}

    fn validate(capacity: &Self, usage: &Self) -> CoreResult<()> {
        if capacity.storage < 0 {
            return Err(CoreError::InvalidStorage(
                "storage capacity can't be negative".into(),
            ));
        }
        if usage.storage < 0 {
            return Err(CoreError::InvalidStorage(
                "storage usage can't be negative".into(),
            ));
        }
        if usage.storage > capacity.storage {
            return Err(CoreError::InvalidStorage(
                "storage usage exceeds capacity".into(),
            ));
        }
        Ok(())
    }
}

/// Request and limit of one workload. Also the per-workload record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageWorkloadOpts {
    #[serde(rename = "storage-request")]
    pub storage_request: i64,
    #[serde(rename = "storage-limit")]
    pub storage_limit: i64,
}

pub type StorageWorkloadArgs = StorageWorkloadOpts;

impl StorageWorkloadOpts {
    /// Recognised keys: `storage-request`, `storage-limit`, `storage` (sets both).
    pub fn from_params(p: &RawParams) -> CoreResult<Self> {
        let mut opts = Self {
            storage_request: parse_bytes(p.string("storage-request"))?,
            storage_limit: parse_bytes(p.string("storage-limit"))?,
        };
        if p.is_set("storage") {
            let storage = parse_bytes(p.string("storage"))?;
            opts.storage_request = storage;
            opts.storage_limit = storage;
        }
        Ok(opts)
    }

    pub fn normalize(&mut self) -> CoreResult<()> {
        if self.storage_limit < 0 || self.storage_request < 0 {
            return Err(CoreError::InvalidStorage(
                "storage limit or request less than 0".into(),
            ));
        }
        if self.storage_limit > 0 && self.storage_request == 0 {
            self.storage_request = self.storage_limit;
        }
        if self.storage_request > self.storage_limit {
            self.storage_limit = self.storage_request;
        }
        Ok(())
    }

    pub fn add(&mut self, other: &Self) {
        self.storage_request += other.storage_request;
        self.storage_limit += other.storage_limit;
    }

    pub fn usage(&self) -> StorageArgs {
        StorageArgs {
            storage: self.storage_request,
        }
    }
}

/// Node capacity as entered by an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeOpts {
    pub storage: Option<i64>,
}

impl StorageNodeOpts {
    /// Recognised keys: `storage`.
    pub fn from_params(p: &RawParams) -> CoreResult<Self> {
        let storage = if p.is_set("storage") {
            Some(parse_bytes(p.string("storage"))?)
        } else {
            None
        };
        Ok(Self { storage })
    }

    pub fn to_capacity(&self) -> StorageArgs {
        StorageArgs {
            storage: self.storage.unwrap_or(0),
        }
    }

    pub fn or_current(&self, current: &StorageArgs) -> Self {
        Self {
            storage: Some(self.storage.unwrap_or(current.storage)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEngineArgs {
    pub storage: i64,
}
