/// Virtual memory bookkeeping: the global page table and the free-list
/// device memory allocator.
///
/// The allocator owns the device registry — the driver, allocator, and
/// devices would otherwise refer to each other in a cycle, so ownership is
/// arena-style: driver → allocator → devices. Physical address ranges are
/// assigned cumulatively at registration, with the bottom 4 GiB reserved
/// for system memory. The allocator is consumed from the tick thread (the
/// migration path) and the wiring surface; it is not part of the
/// host-facing API.
use std::collections::HashMap;

use crate::device::{Device, DeviceKind, DeviceMemoryState, DeviceProperties};
use crate::error::{DriverError, Result};

/// Address space reserved for the CPU sentinel; GPU physical ranges start
/// above it.
const SYSTEM_MEMORY_SIZE: u64 = 1 << 32;

/// A simulated process id. Globally unique per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// One virtual-to-physical mapping.
#[derive(Debug, Clone)]
pub struct Page {
    pub pid: Pid,
    pub v_addr: u64,
    pub p_addr: u64,
    /// Device whose DRAM holds the physical frame
    pub device_id: usize,
    pub pinned: bool,
    /// Set while a migration copy for this page is in flight
    pub is_migrating: bool,
}

// ---------------------------------------------------------------------------
// Page table
// ---------------------------------------------------------------------------

/// Mapping (pid, page-aligned v-addr) → page. Lookups are exact; an update
/// replaces the record wholesale.
pub struct PageTable {
    log2_page_size: u64,
    entries: HashMap<(Pid, u64), Page>,
}

impl PageTable {
    pub fn new(log2_page_size: u64) -> Self {
        PageTable { log2_page_size, entries: HashMap::new() }
    }

    fn align(&self, v_addr: u64) -> u64 {
        v_addr >> self.log2_page_size << self.log2_page_size
    }

    pub fn find(&self, pid: Pid, v_addr: u64) -> Option<&Page> {
        self.entries.get(&(pid, self.align(v_addr)))
    }

    pub fn find_mut(&mut self, pid: Pid, v_addr: u64) -> Option<&mut Page> {
        let key = (pid, self.align(v_addr));
        self.entries.get_mut(&key)
    }

    /// Insert or replace the mapping for the page's (pid, v-addr).
    pub fn update(&mut self, page: Page) {
        let key = (page.pid, self.align(page.v_addr));
        self.entries.insert(key, page);
    }

    pub fn remove(&mut self, pid: Pid, v_addr: u64) -> Option<Page> {
        let key = (pid, self.align(v_addr));
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Memory allocator
// ---------------------------------------------------------------------------

/// Free-list allocator over all registered devices.
pub struct MemoryAllocator {
    log2_page_size: u64,
    devices: Vec<Device>,
    next_storage_base: u64,
}

impl MemoryAllocator {
    pub fn new(log2_page_size: u64) -> Self {
        let mut allocator = MemoryAllocator {
            log2_page_size,
            devices: Vec::new(),
            next_storage_base: 0,
        };

        // CPU sentinel at id 0 so 1-based GPU ids index the registry.
        allocator.register_device(
            DeviceKind::Cpu,
            DeviceProperties { cu_count: 0, dram_size: SYSTEM_MEMORY_SIZE },
            Vec::new(),
        );
        allocator
    }

    pub fn log2_page_size(&self) -> u64 {
        self.log2_page_size
    }

    pub fn page_size(&self) -> u64 {
        1 << self.log2_page_size
    }

    pub fn device(&self, id: usize) -> &Device {
        &self.devices[id]
    }

    pub fn get_device(&self, id: usize) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    fn register_device(
        &mut self,
        kind: DeviceKind,
        properties: DeviceProperties,
        unified_members: Vec<usize>,
    ) -> usize {
        let id = self.devices.len();
        let mut mem = DeviceMemoryState::new(self.log2_page_size);
        mem.set_storage(self.next_storage_base, properties.dram_size);
        self.next_storage_base += properties.dram_size;

        self.devices.push(Device { id, kind, properties, unified_members, mem });
        id
    }

    /// Register a plain GPU; ids are assigned in registration order.
    pub fn register_gpu(&mut self, properties: DeviceProperties) -> usize {
        self.register_device(DeviceKind::Gpu, properties, Vec::new())
    }

    /// Register a unified virtual device over previously registered GPUs.
    /// The aggregate holds no DRAM; its CU count is the members' sum.
    pub fn register_unified_gpu(&mut self, members: &[usize]) -> Result<usize> {
        if members.is_empty() {
            return Err(DriverError::EmptyUnifiedDevice);
        }
        let mut cu_count = 0;
        for &id in members {
            let dev = self.get_device(id).ok_or(DriverError::UnknownDevice(id))?;
            if dev.kind != DeviceKind::Gpu {
                return Err(DriverError::NotAGpu(id));
            }
            cu_count += dev.properties.cu_count;
        }
        Ok(self.register_device(
            DeviceKind::Unified,
            DeviceProperties { cu_count, dram_size: 0 },
            members.to_vec(),
        ))
    }

    /// Reserve a physical frame on `device_id` and map `v_addr` to it,
    /// replacing any previous mapping for that v-addr.
    pub fn allocate_page_with_vaddr(
        &mut self,
        table: &mut PageTable,
        pid: Pid,
        device_id: usize,
        v_addr: u64,
        pin: bool,
    ) -> Result<Page> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or(DriverError::UnknownDevice(device_id))?;
        let p_addr = device
            .mem
            .reserve_frame()
            .ok_or(DriverError::OutOfDeviceMemory(device_id))?;

        let page = Page {
            pid,
            v_addr,
            p_addr,
            device_id,
            pinned: pin,
            is_migrating: false,
        };
        table.update(page.clone());
        Ok(page)
    }

    /// Explicit free: unmap the page at `v_addr` and retire its frame.
    pub fn free_page(&mut self, table: &mut PageTable, pid: Pid, v_addr: u64) -> Result<()> {
        let page = table
            .remove(pid, v_addr)
            .ok_or(DriverError::NotMapped { pid, vaddr: v_addr })?;
        self.devices[page.device_id].mem.free_frame(page.p_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_props(dram_size: u64) -> DeviceProperties {
        DeviceProperties { cu_count: 4, dram_size }
    }

    #[test]
    fn registration_assigns_ordered_ids_above_the_sentinel() {
        let mut alloc = MemoryAllocator::new(12);
        assert_eq!(alloc.register_gpu(gpu_props(1 << 20)), 1);
        assert_eq!(alloc.register_gpu(gpu_props(1 << 20)), 2);
        assert_eq!(alloc.device(0).kind, DeviceKind::Cpu);
        assert_eq!(alloc.device(2).kind, DeviceKind::Gpu);
    }

    #[test]
    fn unified_device_validates_members() {
        let mut alloc = MemoryAllocator::new(12);
        alloc.register_gpu(gpu_props(1 << 20));
        alloc.register_gpu(DeviceProperties { cu_count: 2, dram_size: 1 << 20 });

        let id = alloc.register_unified_gpu(&[1, 2]).unwrap();
        assert_eq!(alloc.device(id).properties.cu_count, 6);
        assert_eq!(alloc.device(id).properties.dram_size, 0);

        assert!(alloc.register_unified_gpu(&[]).is_err());
        assert!(alloc.register_unified_gpu(&[7]).is_err());
        assert!(alloc.register_unified_gpu(&[0]).is_err(), "CPU is not a member");
    }

    #[test]
    fn page_lookups_align_to_page_boundaries() {
        let mut alloc = MemoryAllocator::new(12);
        let gpu = alloc.register_gpu(gpu_props(1 << 20));
        let mut table = PageTable::new(12);
        let pid = Pid(1);

        alloc
            .allocate_page_with_vaddr(&mut table, pid, gpu, 0x1000, false)
            .unwrap();
        let page = table.find(pid, 0x1000 + 17).unwrap();
        assert_eq!(page.device_id, gpu);
        assert_eq!(page.v_addr, 0x1000);
        assert!(table.find(pid, 0x2000).is_none(), "lookups are exact");
    }

    #[test]
    fn freeing_a_page_recycles_its_frame() {
        let mut alloc = MemoryAllocator::new(12);
        let gpu = alloc.register_gpu(gpu_props(1 << 20));
        let mut table = PageTable::new(12);
        let pid = Pid(1);

        let page = alloc
            .allocate_page_with_vaddr(&mut table, pid, gpu, 0x1000, false)
            .unwrap();
        alloc.free_page(&mut table, pid, 0x1000).unwrap();
        assert!(table.is_empty());

        let reused = alloc
            .allocate_page_with_vaddr(&mut table, pid, gpu, 0x2000, false)
            .unwrap();
        assert_eq!(reused.p_addr, page.p_addr, "retired frame is reused");

        assert!(alloc.free_page(&mut table, pid, 0x9000).is_err(), "unmapped free");
    }

    #[test]
    fn remapping_a_vaddr_replaces_the_old_page() {
        let mut alloc = MemoryAllocator::new(12);
        let gpu1 = alloc.register_gpu(gpu_props(1 << 20));
        let gpu2 = alloc.register_gpu(gpu_props(1 << 20));
        let mut table = PageTable::new(12);
        let pid = Pid(1);

        let old = alloc
            .allocate_page_with_vaddr(&mut table, pid, gpu1, 0x1000, false)
            .unwrap();
        let new = alloc
            .allocate_page_with_vaddr(&mut table, pid, gpu2, 0x1000, true)
            .unwrap();

        assert_ne!(old.p_addr, new.p_addr);
        let current = table.find(pid, 0x1000).unwrap();
        assert_eq!(current.device_id, gpu2);
        assert!(current.pinned);
    }
}
