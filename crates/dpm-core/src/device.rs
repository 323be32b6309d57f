//! Device model and snapshot diffing.
//!
//! Plugins always push *full* snapshots. Everything downstream (the manager's
//! inventory and the change callback) works in terms of [`DeviceDiff`], which
//! is computed here by comparing two snapshots keyed by device id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Health of a single device as reported by its plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// A device advertised by a plugin.
///
/// `id` is only meaningful within the resource that reported it; two
/// resources may both expose a device called `"0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub health: Health,
}

impl Device {
    pub fn new(id: impl Into<String>, health: Health) -> Self {
        Self {
            id: id.into(),
            health,
        }
    }

    pub fn healthy(id: impl Into<String>) -> Self {
        Self::new(id, Health::Healthy)
    }

    pub fn unhealthy(id: impl Into<String>) -> Self {
        Self::new(id, Health::Unhealthy)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

/// Devices of one resource keyed by id.
pub type DeviceSet = HashMap<String, Device>;

/// Index a snapshot by device id. Later duplicates win.
pub fn index_devices<I>(devices: I) -> DeviceSet
where
    I: IntoIterator<Item = Device>,
{
    devices
        .into_iter()
        .map(|device| (device.id.clone(), device))
        .collect()
}

/// Changes between two snapshots of the same resource.
///
/// Every list is sorted by device id so that callers (and tests) observe a
/// stable order regardless of hash iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    pub added: Vec<Device>,
    pub updated: Vec<Device>,
    pub removed: Vec<Device>,
}

impl DeviceDiff {
    /// Compute the diff that turns `previous` into `current`.
    ///
    /// A device present in both with a different health is `updated`; a
    /// device whose health did not change does not appear at all.
    pub fn between(previous: &DeviceSet, current: &DeviceSet) -> Self {
        let mut diff = DeviceDiff::default();

        for (id, device) in current {
            match previous.get(id) {
                None => diff.added.push(device.clone()),
                Some(old) if old.health != device.health => diff.updated.push(device.clone()),
                Some(_) => {}
            }
        }
        for (id, device) in previous {
            if !current.contains_key(id) {
                diff.removed.push(device.clone());
            }
        }

        diff.sort();
        diff
    }

    /// Diff that removes every device in `set`.
    pub fn removal_of(set: &DeviceSet) -> Self {
        let mut diff = DeviceDiff {
            removed: set.values().cloned().collect(),
            ..Default::default()
        };
        diff.sort();
        diff
    }

    /// Diff that flips every healthy device in `set` to unhealthy.
    ///
    /// Devices that are already unhealthy are left out.
    pub fn all_unhealthy(set: &DeviceSet) -> Self {
        let mut diff = DeviceDiff {
            updated: set
                .values()
                .filter(|device| device.is_healthy())
                .map(|device| Device::unhealthy(device.id.clone()))
                .collect(),
            ..Default::default()
        };
        diff.sort();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Apply this diff to `set` in place.
    ///
    /// Returns the part of the diff that actually changed `set`: removals of
    /// ids that were not present, additions identical to an existing entry and
    /// updates that do not change anything are dropped.
    pub fn apply_to(&self, set: &mut DeviceSet) -> DeviceDiff {
        let mut effective = DeviceDiff::default();

        for device in &self.removed {
            if let Some(old) = set.remove(&device.id) {
                effective.removed.push(old);
            }
        }
        for device in self.added.iter().chain(self.updated.iter()) {
            match set.insert(device.id.clone(), device.clone()) {
                None => effective.added.push(device.clone()),
                Some(old) if old.health != device.health => effective.updated.push(device.clone()),
                Some(_) => {}
            }
        }

        effective.sort();
        effective
    }

    fn sort(&mut self) {
        self.added.sort_by(|a, b| a.id.cmp(&b.id));
        self.updated.sort_by(|a, b| a.id.cmp(&b.id));
        self.removed.sort_by(|a, b| a.id.cmp(&b.id));
    }
}
