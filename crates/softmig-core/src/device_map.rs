//! Management-API to region device index mapping
//!
//! The management API enumerates every physical device on the host, while
//! the region is indexed by the devices visible to the container. A
//! visible-device list such as `"2,0"` means region device 0 is physical
//! device 2 and region device 1 is physical device 0.

use crate::constants::MAX_DEVICES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMap {
    /// Indexed by region device, holds the management device
    to_mgmt: Vec<usize>,
}

impl DeviceMap {
    /// Region device `i` is management device `i`
    pub fn identity(count: usize) -> Self {
        DeviceMap {
            to_mgmt: (0..count.min(MAX_DEVICES)).collect(),
        }
    }

    /// Parse a comma-separated list of physical indices
    ///
    /// Returns `None` when any entry is not a plain index (e.g. UUIDs) or
    /// the list is empty; callers fall back to `identity`.
    pub fn from_visible(list: &str) -> Option<Self> {
        let mut to_mgmt = Vec::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            to_mgmt.push(part.parse::<usize>().ok()?);
        }
        if to_mgmt.is_empty() {
            return None;
        }
        to_mgmt.truncate(MAX_DEVICES);
        Some(DeviceMap { to_mgmt })
    }

    /// Region device for a management device, if visible
    pub fn region_for(&self, mgmt_dev: usize) -> Option<usize> {
        self.to_mgmt.iter().position(|&m| m == mgmt_dev)
    }

    /// Management device for a region device
    pub fn mgmt_for(&self, region_dev: usize) -> Option<usize> {
        self.to_mgmt.get(region_dev).copied()
    }

    pub fn len(&self) -> usize {
        self.to_mgmt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_mgmt.is_empty()
    }
}
