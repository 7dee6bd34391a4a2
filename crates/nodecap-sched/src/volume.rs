//! Volume bin-packing scheduler.
//!
//! Devices with no usage are *unused* and can be handed out whole to
//! monopoly bindings; devices with some usage are *used* and only host
//! shared (normal) bindings. When monopoly capacity outstrips shared
//! capacity, unused devices are moved into the shared pool one at a time
//! while that improves the number of complete instances.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use nodecap_core::volume::{VolumeBinding, VolumeMap, VolumePlan};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Device {
    size: i64,
    name: String,
}

struct VolumeHost {
    max_deploy_count: usize,
    used: Vec<Device>,
    unused: Vec<Device>,
}

/// Successive volume plans for `requests`, at most `max_deploy_count`.
///
/// Bindings that do not need scheduling are ignored. A node without
/// devices has no plans.
pub fn volume_plans(
    capacity: &VolumeMap,
    usage: &VolumeMap,
    requests: &[VolumeBinding],
    max_deploy_count: usize,
) -> Vec<VolumePlan> {
    let mut host = VolumeHost::new(capacity, usage, max_deploy_count);
    let plans = host.plans(requests);
    debug!(
        requests = requests.len(),
        plans = plans.len(),
        "volume plans computed"
    );
    plans
}

impl VolumeHost {
    fn new(capacity: &VolumeMap, usage: &VolumeMap, max_deploy_count: usize) -> Self {
        let mut used = Vec::new();
        let mut unused = Vec::new();
        for (name, &size) in capacity.iter() {
            match usage.size(name) {
                0 => unused.push(Device {
                    size,
                    name: name.clone(),
                }),
                taken => used.push(Device {
                    size: size - taken,
                    name: name.clone(),
                }),
            }
        }
        used.sort();
        unused.sort();
        Self {
            max_deploy_count,
            used,
            unused,
        }
    }

    fn plans(&mut self, requests: &[VolumeBinding]) -> Vec<VolumePlan> {
        if self.used.is_empty() && self.unused.is_empty() {
            return Vec::new();
        }

        let mut normal = Vec::new();
        let mut mono = Vec::new();
        let mut unlimited = Vec::new();
        for binding in requests {
            if binding.is_monopoly() {
                mono.push(binding);
            } else if binding.is_unlimited() {
                unlimited.push(binding);
            } else if binding.requires_schedule() {
                normal.push(binding);
            }
        }
        mono.sort_by_key(|b| b.size_in_bytes);
        normal.sort_by_key(|b| b.size_in_bytes);
        let min_normal = normal
            .iter()
            .map(|b| b.size_in_bytes)
            .min()
            .unwrap_or(i64::MAX);

        let (mut normal_plans, normal_cap) = self.normal_plans(&normal);
        let (mut mono_plans, mono_cap) = self.mono_plans(&mono);
        let (mut normal_len, mut mono_len) = (normal_plans.len(), mono_plans.len());
        let mut best = normal_cap.min(mono_cap);
        normal_plans.truncate(best);
        mono_plans.truncate(best);
        let mut best_plans = (normal_plans, mono_plans);

        while mono_len > normal_len && self.unused.len() >= mono.len() {
            let Some(p) = self.unused.iter().position(|d| d.size >= min_normal) else {
                break;
            };
            let device = self.unused.remove(p);
            self.used.push(device);

            let (mut normal_plans, normal_cap) = self.normal_plans(&normal);
            let (mut mono_plans, mono_cap) = self.mono_plans(&mono);
            (normal_len, mono_len) = (normal_plans.len(), mono_plans.len());
            let capacity = normal_cap.min(mono_cap);
            if capacity > best {
                best = capacity;
                normal_plans.truncate(capacity);
                mono_plans.truncate(capacity);
                best_plans = (normal_plans, mono_plans);
            }
        }

        // Unlimited bindings need a device no retained monopoly plan holds;
        // drop instances until one is left.
        let (mut normal_plans, mut mono_plans) = best_plans;
        let unlimited_plan = loop {
            match self.unlimited_plan(&normal_plans, &mono_plans, &unlimited) {
                Some(plan) => break plan,
                None if best > 0 => {
                    best -= 1;
                    normal_plans.truncate(best);
                    mono_plans.truncate(best);
                }
                None => return Vec::new(),
            }
        };

        (0..best)
            .map(|i| {
                let mut plan = VolumePlan::new();
                if let Some(p) = normal_plans.get(i) {
                    plan.merge(p.clone());
                }
                if let Some(p) = mono_plans.get(i) {
                    plan.merge(p.clone());
                }
                plan.merge(unlimited_plan.clone());
                plan
            })
            .collect()
    }

    fn normal_plans(&self, requests: &[&VolumeBinding]) -> (Vec<VolumePlan>, usize) {
        if requests.is_empty() {
            return (Vec::new(), self.max_deploy_count);
        }

        let mut heap: BinaryHeap<Reverse<Device>> =
            self.used.iter().cloned().map(Reverse).collect();
        let mut plans = Vec::new();
        while plans.len() < self.max_deploy_count {
            match normal_plan(&mut heap, requests) {
                Some(plan) => plans.push(plan),
                None => break,
            }
        }
        let count = plans.len();
        (plans, count)
    }

    /// Round-robin over the monopoly requests, walking unused devices from
    /// the smallest. A device too small for the current request is skipped.
    fn mono_plans(&self, requests: &[&VolumeBinding]) -> (Vec<VolumePlan>, usize) {
        if requests.is_empty() {
            return (Vec::new(), self.max_deploy_count);
        }

        let mut plans = Vec::new();
        let mut plan = VolumePlan::new();
        let mut index = 0;
        for device in &self.unused {
            if plans.len() >= self.max_deploy_count {
                break;
            }
            let request = requests[index];
            if device.size < request.size_in_bytes {
                continue;
            }
            plan.insert(request.clone(), VolumeMap::single(&device.name, device.size));
            if index == requests.len() - 1 {
                plans.push(std::mem::take(&mut plan));
            }
            index = (index + 1) % requests.len();
        }
        let count = plans.len();
        (plans, count)
    }

    /// Every unlimited binding lands on the device with the most bytes left
    /// once the retained normal and monopoly plans are applied. Devices
    /// held by a monopoly plan are never picked; `None` when no other
    /// device exists.
    fn unlimited_plan(
        &self,
        normal_plans: &[VolumePlan],
        mono_plans: &[VolumePlan],
        requests: &[&VolumeBinding],
    ) -> Option<VolumePlan> {
        let mut plan = VolumePlan::new();
        if requests.is_empty() {
            return Some(plan);
        }

        let monopolized: BTreeSet<&String> = mono_plans
            .iter()
            .flat_map(|p| p.iter().flat_map(|(_, map)| map.keys()))
            .collect();
        let mut remaining: Vec<Device> = self
            .used
            .iter()
            .chain(&self.unused)
            .filter(|d| !monopolized.contains(&d.name))
            .cloned()
            .collect();
        for consumed in normal_plans.iter().map(VolumePlan::total) {
            for device in remaining.iter_mut() {
                device.size -= consumed.size(&device.name);
            }
        }

        let mut largest: Option<&Device> = None;
        for device in &remaining {
            if largest.is_none_or(|l| device.size > l.size) {
                largest = Some(device);
            }
        }
        let device = largest?;
        for request in requests {
            plan.insert((*request).clone(), VolumeMap::single(&device.name, 0));
        }
        Some(plan)
    }
}

/// One instance worth of shared placements, or `None` if any request does
/// not fit. Devices skipped for being too small go back on the heap.
fn normal_plan(
    heap: &mut BinaryHeap<Reverse<Device>>,
    requests: &[&VolumeBinding],
) -> Option<VolumePlan> {
    let mut plan = VolumePlan::new();
    for request in requests {
        let mut skipped = Vec::new();
        let mut placed = false;
        while let Some(Reverse(mut device)) = heap.pop() {
            if device.size >= request.size_in_bytes {
                plan.insert(
                    (*request).clone(),
                    VolumeMap::single(&device.name, request.size_in_bytes),
                );
                device.size -= request.size_in_bytes;
                if device.size > 0 {
                    skipped.push(device);
                }
                placed = true;
                break;
            }
            skipped.push(device);
        }
        heap.extend(skipped.into_iter().map(Reverse));
        if !placed {
            return None;
        }
    }
    Some(plan)
}
