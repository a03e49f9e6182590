//! Per-process list of live device allocations
//!
//! Process-local (never shared). The allocator keeps one list for
//! synchronous allocations and one for stream-ordered ones; each entry
//! remembers the device and byte count it was accounted under, so a free
//! releases exactly what the allocation added.

use crate::status::{MemoryType, UsageKind};
use crate::traits::DevicePtr;

/// Opaque handle of a large (virtual-memory backed) allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocHandle(pub u64);

/// One live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEntry {
    pub address: DevicePtr,
    /// Bytes accounted in the shared region for this allocation
    pub length: u64,
    pub device: usize,
    pub kind: UsageKind,
    pub handle: Option<AllocHandle>,
}

impl AllocationEntry {
    /// Does `[address, address + length)` contain `addr`?
    #[inline]
    pub fn contains(&self, addr: DevicePtr) -> bool {
        addr >= self.address && addr - self.address < self.length.max(1)
    }
}

/// Unordered collection of live allocations
#[derive(Debug, Default)]
pub struct AllocationList {
    entries: Vec<AllocationEntry>,
    /// Pool reserved-bytes watermark already charged to this process
    high_water: u64,
}

impl AllocationList {
    pub const fn new() -> Self {
        AllocationList {
            entries: Vec::new(),
            high_water: 0,
        }
    }

    pub fn push(&mut self, entry: AllocationEntry) {
        self.entries.push(entry);
    }

    /// Remove the entry starting at `address`
    pub fn remove(&mut self, address: DevicePtr) -> Option<AllocationEntry> {
        let idx = self.entries.iter().position(|e| e.address == address)?;
        Some(self.entries.swap_remove(idx))
    }

    pub fn find(&self, address: DevicePtr) -> Option<&AllocationEntry> {
        self.entries.iter().find(|e| e.address == address)
    }

    /// Classify an arbitrary address against the tracked ranges
    pub fn memory_type(&self, addr: DevicePtr) -> MemoryType {
        if self.entries.iter().any(|e| e.contains(addr)) {
            MemoryType::Device
        } else {
            MemoryType::Host
        }
    }

    /// Sum of accounted bytes
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().fold(0u64, |acc, e| acc.saturating_add(e.length))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationEntry> {
        self.entries.iter()
    }

    #[inline]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Charge newly reserved pool bytes
    ///
    /// Given the pool's current reserved-high mark, returns how many of the
    /// `requested` bytes are new to this process and raises the watermark
    /// by that amount. Memory the pool already held is reused for free.
    pub fn charge_pool(&mut self, pool_reserved: u64, requested: u64) -> u64 {
        let charged = if pool_reserved > self.high_water {
            (pool_reserved - self.high_water).min(requested)
        } else {
            0
        };
        self.high_water = self.high_water.saturating_add(charged);
        charged
    }

    /// Give back `bytes` previously charged via `charge_pool`
    pub fn release_pool(&mut self, bytes: u64) {
        self.high_water = self.high_water.saturating_sub(bytes);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u64, length: u64) -> AllocationEntry {
        AllocationEntry {
            address,
            length,
            device: 0,
            kind: UsageKind::Data,
            handle: None,
        }
    }

    #[test]
    fn test_push_remove() {
        let mut list = AllocationList::new();
        list.push(entry(0x1000, 256));
        list.push(entry(0x2000, 512));
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_bytes(), 768);

        assert_eq!(list.remove(0x2000), Some(entry(0x2000, 512)));
        assert_eq!(list.remove(0x2000), None);
        assert_eq!(list.total_bytes(), 256);
        assert!(list.find(0x1000).is_some());
    }

    #[test]
    fn test_memory_type() {
        let mut list = AllocationList::new();
        list.push(entry(0x1000, 0x100));
        assert_eq!(list.memory_type(0x1000), MemoryType::Device);
        assert_eq!(list.memory_type(0x10ff), MemoryType::Device);
        assert_eq!(list.memory_type(0x1100), MemoryType::Host);
        assert_eq!(list.memory_type(0x0fff), MemoryType::Host);
    }

    #[test]
    fn test_pool_charge() {
        let mut list = AllocationList::new();
        // Pool grew by 4 MiB for a 3 MiB request: charge the request
        assert_eq!(list.charge_pool(4 << 20, 3 << 20), 3 << 20);
        // Pool grew 1 MiB more; only that is new
        assert_eq!(list.charge_pool(4 << 20, 2 << 20), 1 << 20);
        // Pool did not grow: reuse is free
        assert_eq!(list.charge_pool(4 << 20, 1 << 20), 0);
        assert_eq!(list.high_water(), 4 << 20);

        list.release_pool(3 << 20);
        assert_eq!(list.high_water(), 1 << 20);
        list.release_pool(u64::MAX);
        assert_eq!(list.high_water(), 0);
    }
}
