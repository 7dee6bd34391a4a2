//! Block-device volume resource types.
//!
//! A [`VolumeBinding`] is written `src:dst[:flags[:size]]`. Bindings whose
//! source ends in `AUTO` are placed by the volume scheduler; the others are
//! passed through to the engine untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::accounting::ResourceArgs;
use crate::error::{CoreError, CoreResult};
use crate::params::RawParams;
use crate::units::parse_bytes;

const AUTO: &str = "AUTO";

/// Identity of a binding slot. Request and limit copies of the same
/// binding share a key even when their sizes differ.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    pub source: String,
    pub destination: String,
    pub flags: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeBinding {
    pub source: String,
    pub destination: String,
    pub flags: String,
    pub size_in_bytes: i64,
}

impl VolumeBinding {
    pub fn key(&self) -> BindingKey {
        BindingKey {
            source: self.source.clone(),
            destination: self.destination.clone(),
            flags: self.flags.clone(),
        }
    }

    pub fn requires_schedule(&self) -> bool {
        self.source.ends_with(AUTO)
    }

    pub fn is_monopoly(&self) -> bool {
        self.requires_schedule() && self.flags.contains('m')
    }

    pub fn is_unlimited(&self) -> bool {
        self.requires_schedule() && self.size_in_bytes == 0
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.destination.is_empty() {
            return Err(CoreError::InvalidBinding(format!(
                "dest must be provided: {self}"
            )));
        }
        if self.is_monopoly() && self.is_unlimited() {
            return Err(CoreError::InvalidBinding(format!(
                "monopoly volume must not be limited: {self}"
            )));
        }
        Ok(())
    }

    /// Textual form. With `normalize`, the monopoly flag is dropped so the
    /// engine never sees it.
    pub fn render(&self, normalize: bool) -> String {
        let mut flags = self.flags.clone();
        if normalize {
            flags = flags.replace('m', "");
        }
        if flags.contains('o') {
            flags = flags.replace('o', "").replace('r', "ro").replace('w', "wo");
        }

        if self.flags.is_empty() && self.size_in_bytes == 0 {
            format!("{}:{}", self.source, self.destination)
        } else {
            format!(
                "{}:{}:{}:{}",
                self.source, self.destination, flags, self.size_in_bytes
            )
        }
    }
}

impl fmt::Display for VolumeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

impl FromStr for VolumeBinding {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, destination, flags, size) = match parts.as_slice() {
            [src, dst] => (*src, *dst, "", 0),
            [src, dst, flags] => (*src, *dst, *flags, 0),
            [src, dst, flags, size] => {
                let size = size
                    .parse::<i64>()
                    .map_err(|_| CoreError::InvalidBinding(s.to_string()))?;
                (*src, *dst, *flags, size)
            }
            _ => return Err(CoreError::InvalidBinding(s.to_string())),
        };

        let mut flag_chars: Vec<char> = flags.chars().collect();
        flag_chars.sort_unstable();

        let binding = Self {
            source: source.to_string(),
            destination: destination.to_string(),
            flags: flag_chars.into_iter().collect(),
            size_in_bytes: size,
        };
        binding.validate()?;
        Ok(binding)
    }
}

impl Serialize for VolumeBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render(false))
    }
}

impl<'de> Deserialize<'de> for VolumeBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub type VolumeBindings = Vec<VolumeBinding>;

pub fn parse_bindings(volumes: &[String]) -> CoreResult<VolumeBindings> {
    volumes.iter().map(|v| v.parse()).collect()
}

pub fn total_size(bindings: &[VolumeBinding]) -> i64 {
    bindings.iter().map(|b| b.size_in_bytes).sum()
}

/// Sum sizes per slot. A slot whose sizes cancel out, or go negative, is
/// dropped.
pub fn merge_bindings(base: &[VolumeBinding], delta: &[VolumeBinding]) -> VolumeBindings {
    let mut slots: BTreeMap<BindingKey, (i64, bool)> = BTreeMap::new();
    for binding in base.iter().chain(delta) {
        let slot = slots.entry(binding.key()).or_insert((0, false));
        slot.0 += binding.size_in_bytes;
        slot.1 |= binding.size_in_bytes != 0;
    }
    slots
        .into_iter()
        .filter(|(_, (size, sized))| *size > 0 || (*size == 0 && !sized))
        .map(|(key, (size, _))| VolumeBinding {
            source: key.source,
            destination: key.destination,
            flags: key.flags,
            size_in_bytes: size,
        })
        .collect()
}

/// Device path to bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeMap(BTreeMap<String, i64>);

impl VolumeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(device: impl Into<String>, size: i64) -> Self {
        Self(BTreeMap::from([(device.into(), size)]))
    }

    pub fn size(&self, device: &str) -> i64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }

    pub fn add(&mut self, other: &VolumeMap) {
        for (device, size) in &other.0 {
            *self.0.entry(device.clone()).or_insert(0) += size;
        }
    }

    pub fn sub(&mut self, other: &VolumeMap) {
        for (device, size) in &other.0 {
            *self.0.entry(device.clone()).or_insert(0) -= size;
        }
    }
}

impl Deref for VolumeMap {
    type Target = BTreeMap<String, i64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for VolumeMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K: Into<String>> FromIterator<(K, i64)> for VolumeMap {
    fn from_iter<I: IntoIterator<Item = (K, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Placement of each binding of one workload, keyed by slot.
///
/// Serialized as `{"AUTO:/data:rw:100": {"/dev/sda1": 100}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumePlan(BTreeMap<BindingKey, (VolumeBinding, VolumeMap)>);

impl VolumePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `binding`; placing the same slot twice accumulates.
    pub fn insert(&mut self, binding: VolumeBinding, map: VolumeMap) {
        match self.0.get_mut(&binding.key()) {
            Some((_, existing)) => existing.add(&map),
            None => {
                self.0.insert(binding.key(), (binding, map));
            }
        }
    }

    pub fn get(&self, key: &BindingKey) -> Option<&VolumeMap> {
        self.0.get(key).map(|(_, map)| map)
    }

    pub fn binding(&self, key: &BindingKey) -> Option<&VolumeBinding> {
        self.0.get(key).map(|(binding, _)| binding)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VolumeBinding, &VolumeMap)> {
        self.0.values().map(|(binding, map)| (binding, map))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: VolumePlan) {
        for (_, (binding, map)) in other.0 {
            self.insert(binding, map);
        }
    }

    /// Per-device sum over every binding.
    pub fn total(&self) -> VolumeMap {
        let mut total = VolumeMap::new();
        for (_, map) in self.0.values() {
            total.add(map);
        }
        total
    }

    /// Devices touched by this plan.
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .0
            .values()
            .flat_map(|(_, map)| map.keys().cloned())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }
}

impl Serialize for VolumePlan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.values().map(|(b, map)| (b.render(false), map)))
    }
}

impl<'de> Deserialize<'de> for VolumePlan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, VolumeMap>::deserialize(deserializer)?;
        let mut plan = VolumePlan::new();
        for (volume, map) in raw {
            let binding: VolumeBinding = volume.parse().map_err(serde::de::Error::custom)?;
            plan.insert(binding, map);
        }
        Ok(plan)
    }
}

/// Capacity or usage of one node. `storage` mirrors the volume total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeArgs {
    pub volumes: VolumeMap,
    pub storage: i64,
}

impl VolumeArgs {
    pub fn from_volumes(volumes: VolumeMap) -> Self {
        let storage = volumes.total();
        Self { volumes, storage }
    }
}

impl ResourceArgs for VolumeArgs {
    fn add(&mut self, delta: &Self) {
        self.volumes.add(&delta.volumes);
        self.storage += delta.storage;
    }

    fn sub(&mut self, delta: &Self) {
        self.volumes.sub(&delta.volumes);
        self.storage -= delta.storage;
    }

    fn zeroed(&self) -> Self {
        Self {
            volumes: self.volumes.keys().map(|k| (k.clone(), 0)).collect(),
            storage: 0,
        }
    }

    fn fill_missing(&mut self, capacity: &Self) {
        for device in capacity.volumes.keys() {
            self.volumes.entry(device.clone()).or_insert(0);
        }
    }

    fn validate(capacity: &Self, usage: &Self) -> CoreResult<()> {
        if usage.volumes.keys().any(|k| !capacity.volumes.contains_key(k)) {
            return Err(CoreError::InvalidUsage);
        }
        for (device, &total) in capacity.volumes.iter() {
            if total < 0 {
                return Err(CoreError::InvalidVolume(format!(
                    "size of {device} should not be less than 0"
                )));
            }
            let used = usage.volumes.size(device);
            if used < 0 || used > total {
                return Err(CoreError::InvalidVolume(format!(
                    "invalid usage of {device}: {used}"
                )));
            }
        }
        if capacity.storage < 0 {
            return Err(CoreError::InvalidStorage(
                "storage capacity can't be negative".into(),
            ));
        }
        if usage.storage < 0 || usage.storage > capacity.storage {
            return Err(CoreError::InvalidStorage(format!(
                "invalid storage usage: {}",
                usage.storage
            )));
        }
        Ok(())
    }

    fn prune_empty(capacity: &mut Self, usage: &mut Self) {
        let empty: Vec<String> = capacity
            .volumes
            .iter()
            .filter(|(device, total)| **total == 0 && usage.volumes.size(device) == 0)
            .map(|(device, _)| device.clone())
            .collect();
        for device in empty {
            capacity.volumes.remove(&device);
            usage.volumes.remove(&device);
        }
    }
}

/// Workload request as entered by an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeWorkloadOpts {
    pub volumes_request: VolumeBindings,
    pub volumes_limit: VolumeBindings,
    #[serde(rename = "storage-request")]
    pub storage_request: i64,
    #[serde(rename = "storage-limit")]
    pub storage_limit: i64,
}

impl VolumeWorkloadOpts {
    /// Recognised keys: `volumes-request`/`volume-request`,
    /// `volumes`/`volume`/`volume-limit`, `storage-request`, `storage-limit`,
    /// `storage` (sets both).
    pub fn from_params(p: &RawParams) -> CoreResult<Self> {
        let request = p
            .one_of_string_slice(&["volumes-request", "volume-request"])
            .unwrap_or_default();
        let limit = p
            .one_of_string_slice(&["volumes", "volume", "volume-limit"])
            .unwrap_or_default();

        let mut opts = Self {
            volumes_request: parse_bindings(&request)?,
            volumes_limit: parse_bindings(&limit)?,
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

    /// Pair request and limit bindings by slot, raising limits to requests.
    pub fn normalize(&mut self) -> CoreResult<()> {
        if let Some(negative) = self
            .volumes_request
            .iter()
            .chain(&self.volumes_limit)
            .find(|b| b.requires_schedule() && b.size_in_bytes < 0)
        {
            return Err(CoreError::InvalidVolume(format!(
                "negative volume size: {negative}"
            )));
        }

        if !self.volumes_request.is_empty() || !self.volumes_limit.is_empty() {
            if self.volumes_request.is_empty() {
                self.volumes_request = self.volumes_limit.clone();
            }
            if self.volumes_limit.is_empty() {
                self.volumes_limit = self.volumes_request.clone();
            }
            if self.volumes_request.len() != self.volumes_limit.len() {
                return Err(CoreError::InvalidVolume(
                    "different length of request and limit".into(),
                ));
            }

            self.volumes_request.sort_by_key(VolumeBinding::key);
            self.volumes_limit.sort_by_key(VolumeBinding::key);

            for (request, limit) in self.volumes_request.iter().zip(self.volumes_limit.iter_mut()) {
                if request.key() != limit.key() {
                    return Err(CoreError::InvalidVolume(
                        "request and limit not match".into(),
                    ));
                }
                if request.size_in_bytes > 0
                    && limit.size_in_bytes > 0
                    && request.size_in_bytes > limit.size_in_bytes
                {
                    limit.size_in_bytes = request.size_in_bytes;
                }
            }
        }

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

    /// Slot-wise sum, used to turn a realloc delta into final opts.
    pub fn merged(&self, delta: &Self) -> Self {
        Self {
            volumes_request: merge_bindings(&self.volumes_request, &delta.volumes_request),
            volumes_limit: merge_bindings(&self.volumes_limit, &delta.volumes_limit),
            storage_request: self.storage_request + delta.storage_request,
            storage_limit: self.storage_limit + delta.storage_limit,
        }
    }
}

/// What one workload holds on its node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeWorkloadArgs {
    pub volumes_request: VolumeBindings,
    pub volumes_limit: VolumeBindings,
    pub volume_plan_request: VolumePlan,
    pub volume_plan_limit: VolumePlan,
    #[serde(rename = "storage-request")]
    pub storage_request: i64,
    #[serde(rename = "storage-limit")]
    pub storage_limit: i64,
}

impl VolumeWorkloadArgs {
    pub fn usage(&self) -> VolumeArgs {
        VolumeArgs::from_volumes(self.volume_plan_request.total())
    }

    pub fn opts(&self) -> VolumeWorkloadOpts {
        VolumeWorkloadOpts {
            volumes_request: self.volumes_request.clone(),
            volumes_limit: self.volumes_limit.clone(),
            storage_request: self.storage_request,
            storage_limit: self.storage_limit,
        }
    }
}

/// Node capacity as entered by an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeNodeOpts {
    pub volumes: Option<VolumeMap>,
    pub storage: Option<i64>,
}

impl VolumeNodeOpts {
    /// Recognised keys: `volumes` (list of `"/dev/path:size"`), `storage`.
    pub fn from_params(p: &RawParams) -> CoreResult<Self> {
        let mut opts = Self::default();
        if let Some(volumes) = p.string_slice("volumes") {
            let mut map = VolumeMap::new();
            for volume in volumes {
                let (device, size) = volume.split_once(':').ok_or_else(|| {
                    CoreError::InvalidVolume("volume should have 2 parts".into())
                })?;
                if size.contains(':') {
                    return Err(CoreError::InvalidVolume(
                        "volume should have 2 parts".into(),
                    ));
                }
                map.insert(device.to_string(), parse_bytes(size)?);
            }
            opts.volumes = Some(map);
        }
        if p.is_set("storage") {
            opts.storage = Some(parse_bytes(p.string("storage"))?);
        }
        Ok(opts)
    }

    pub fn to_capacity(&self) -> VolumeArgs {
        let volumes = self.volumes.clone().unwrap_or_default();
        let storage = self.storage.unwrap_or_else(|| volumes.total());
        VolumeArgs { volumes, storage }
    }

    pub fn or_current(&self, current: &VolumeArgs) -> Self {
        let volumes = self
            .volumes
            .clone()
            .unwrap_or_else(|| current.volumes.clone());
        let storage = match (self.storage, &self.volumes) {
            (Some(storage), _) => storage,
            (None, Some(_)) => volumes.total(),
            (None, None) => current.storage,
        };
        Self {
            volumes: Some(volumes),
            storage: Some(storage),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEngineArgs {
    pub volumes: Vec<String>,
    pub volume_changed: bool,
    pub storage: i64,
}
