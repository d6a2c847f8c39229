/// Kernel launch descriptors.
/// A launch is described by a code object plus an HSA-style dispatch packet
/// (grid and workgroup sizes); unified multi-GPU launches additionally tag
/// each per-GPU request with a workgroup filter that selects the slice of
/// the grid that GPU executes.

/// 3D dimension struct used for grid and workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }
}

/// A loaded kernel binary. Parsing and ISA emulation happen inside the
/// simulated CUs; the driver only carries the object to the GPUs.
#[derive(Debug, Clone, Default)]
pub struct CodeObject {
    /// Kernel symbol name
    pub symbol: String,
    /// Bytes of kernel arguments the packet points at
    pub kernarg_segment_size: u32,
    /// LDS bytes per workgroup
    pub group_segment_size: u32,
}

impl CodeObject {
    pub fn new(symbol: &str) -> Self {
        CodeObject { symbol: symbol.to_string(), ..Default::default() }
    }
}

/// An HSA kernel dispatch packet: how large the grid is and how it is cut
/// into workgroups.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPacket {
    /// Grid size in work-items per dimension
    pub grid_size: Dim3,
    /// Workgroup size in work-items per dimension
    pub workgroup_size: Dim3,
    /// Device address of the kernel argument buffer
    pub kernarg_address: u64,
}

impl DispatchPacket {
    pub fn new(grid_size: Dim3, workgroup_size: Dim3) -> Self {
        DispatchPacket { grid_size, workgroup_size, kernarg_address: 0 }
    }

    /// Number of workgroups along x
    pub fn num_wg_x(&self) -> u32 {
        self.grid_size.x.div_ceil(self.workgroup_size.x)
    }

    /// Number of workgroups along y
    pub fn num_wg_y(&self) -> u32 {
        self.grid_size.y.div_ceil(self.workgroup_size.y)
    }

    /// Number of workgroups along z
    pub fn num_wg_z(&self) -> u32 {
        self.grid_size.z.div_ceil(self.workgroup_size.z)
    }

    /// Total number of workgroups in the grid
    pub fn num_workgroups(&self) -> u64 {
        self.num_wg_x() as u64 * self.num_wg_y() as u64 * self.num_wg_z() as u64
    }

    /// Row-major flattened id of a workgroup: z·nWGx·nWGy + y·nWGx + x.
    /// Every consumer of workgroup ranges must use this ordering; any other
    /// flattening breaks cross-GPU partitioning.
    pub fn flattened_wg_id(&self, wg: Dim3) -> u64 {
        let nx = self.num_wg_x() as u64;
        let ny = self.num_wg_y() as u64;
        wg.z as u64 * nx * ny + wg.y as u64 * nx + wg.x as u64
    }
}

/// Accepts the workgroups whose flattened id falls in `[lo, hi)`.
///
/// Carried on launch requests of a unified multi-GPU launch so each member
/// GPU executes a contiguous, disjoint slice of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupFilter {
    pub lo: u64,
    pub hi: u64,
}

impl WorkgroupFilter {
    pub fn accepts(&self, packet: &DispatchPacket, wg: Dim3) -> bool {
        let id = packet.flattened_wg_id(wg);
        id >= self.lo && id < self.hi
    }

    pub fn len(&self) -> u64 {
        self.hi - self.lo
    }

    pub fn is_empty(&self) -> bool {
        self.hi == self.lo
    }
}
