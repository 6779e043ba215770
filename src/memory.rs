// Copyright 2019 The Glare Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device-memory sub-allocation.
//!
//! Drivers hand out device memory in large, expensive allocations. The
//! [`Allocator`] sits between a backend and its driver and multiplexes
//! those allocations: each driver allocation becomes a [slab], slabs with
//! identical allocation parameters form a heap, and callers receive
//! [`Slice`]s carved out of slab free space by a best-fit search.
//! Oversized requests bypass the heaps entirely and get a dedicated slab;
//! imported external memory is always dedicated and never subdivided.
//!
//! [slab]: SlabStats

use std::fmt;
use std::mem;
use std::ptr::NonNull;

#[cfg(unix)]
use std::os::unix::io::{BorrowedFd, OwnedFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::OwnedHandle;

use smallvec::SmallVec;

use crate::device::Error;

/// Multiplication factor for new slab allocations: every new slab is this
/// much larger than the previous one. Higher values trade memory wastage
/// for fewer driver allocations.
pub const SLAB_GROWTH: u64 = 4;

/// Minimum slab size, so the first few small allocations don't each cost
/// a driver round trip. (1 MiB)
pub const MIN_SLAB: u64 = 1 << 20;

/// Maximum slab size, bounding the cost of unbounded slab growth.
/// Anything larger is allocated directly from the driver as a dedicated
/// slab. (256 MiB)
pub const MAX_SLAB: u64 = 1 << 28;

/// Minimum tracked free-region size. Smaller fragments are abandoned to
/// keep the free-space map from thrashing on lots of tiny buffers; the
/// resulting internal fragmentation is bounded by this constant per
/// discard. (1 KiB)
pub const MIN_REGION: u64 = 1 << 10;

bitflags!(
    /// Memory property flags, in driver preference order within a type
    /// table.
    pub struct MemoryFlags: u32 {
        /// Fastest memory for device access.
        const DEVICE_LOCAL  = 1 << 0;
        /// Mappable into host address space.
        const HOST_VISIBLE  = 1 << 1;
        /// Host writes need no explicit flush.
        const HOST_COHERENT = 1 << 2;
        /// Host reads are cached.
        const HOST_CACHED   = 1 << 3;
    }
);

bitflags!(
    /// Usage of the buffer spanning a slab.
    pub struct BufferUsage: u32 {
        /// Transfer source.
        const TRANSFER_SRC = 1 << 0;
        /// Transfer destination.
        const TRANSFER_DST = 1 << 1;
        /// Uniform buffer.
        const UNIFORM      = 1 << 2;
        /// Storage buffer.
        const STORAGE      = 1 << 3;
        /// Vertex buffer.
        const VERTEX       = 1 << 4;
    }
);

/// The classes of external memory handles.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HandleType {
    /// POSIX file descriptor.
    Fd,
    /// Linux dma-buf file descriptor.
    DmaBuf,
    /// Win32 NT handle.
    Win32,
    /// Win32 KMT identifier. Not a closable handle.
    Win32Kmt,
    /// Host pointer to importable memory. Never closed.
    HostPtr,
}

/// All handle types, in probing order.
pub const HANDLE_TYPES: [HandleType; 5] = [
    HandleType::Fd,
    HandleType::DmaBuf,
    HandleType::Win32,
    HandleType::Win32Kmt,
    HandleType::HostPtr,
];

bitflags!(
    /// A set of handle types, as reported by [`Allocator::handle_caps`].
    pub struct HandleCaps: u32 {
        /// POSIX file descriptor.
        const FD        = 1 << 0;
        /// Linux dma-buf file descriptor.
        const DMA_BUF   = 1 << 1;
        /// Win32 NT handle.
        const WIN32     = 1 << 2;
        /// Win32 KMT identifier.
        const WIN32_KMT = 1 << 3;
        /// Host pointer.
        const HOST_PTR  = 1 << 4;
    }
);

impl From<HandleType> for HandleCaps {
    fn from(ty: HandleType) -> HandleCaps {
        match ty {
            HandleType::Fd => HandleCaps::FD,
            HandleType::DmaBuf => HandleCaps::DMA_BUF,
            HandleType::Win32 => HandleCaps::WIN32,
            HandleType::Win32Kmt => HandleCaps::WIN32_KMT,
            HandleType::HostPtr => HandleCaps::HOST_PTR,
        }
    }
}

/// An owned external memory handle. Dropping it closes what must be
/// closed; KMT identifiers and host pointers are plain values.
#[derive(Debug)]
pub enum Handle {
    /// POSIX file descriptor, closed on drop.
    #[cfg(unix)]
    Fd(OwnedFd),
    /// dma-buf file descriptor, closed on drop.
    #[cfg(unix)]
    DmaBuf(OwnedFd),
    /// Win32 NT handle, closed on drop.
    #[cfg(windows)]
    Win32(OwnedHandle),
    /// Win32 KMT identifier.
    #[cfg(windows)]
    Win32Kmt(isize),
    /// Host pointer. Implicitly unmapped when its memory is freed.
    HostPtr(*mut u8),
}

impl Handle {
    /// The class this handle belongs to.
    pub fn ty(&self) -> HandleType {
        match self {
            #[cfg(unix)]
            Handle::Fd(_) => HandleType::Fd,
            #[cfg(unix)]
            Handle::DmaBuf(_) => HandleType::DmaBuf,
            #[cfg(windows)]
            Handle::Win32(_) => HandleType::Win32,
            #[cfg(windows)]
            Handle::Win32Kmt(_) => HandleType::Win32Kmt,
            Handle::HostPtr(_) => HandleType::HostPtr,
        }
    }
}

/// A caller-owned handle to import. File descriptors stay owned by the
/// caller; the allocator duplicates them to sever the lifetime coupling.
#[derive(Clone, Copy, Debug)]
pub enum ImportHandle {
    /// dma-buf file descriptor.
    #[cfg(unix)]
    DmaBuf(RawFd),
    /// Host pointer, aligned to the driver's import alignment.
    HostPtr(*mut u8),
}

/// The window of external memory an import covers, or that an exported
/// slice occupies within its slab.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SharedMem {
    /// Byte offset into the external allocation.
    pub offset: u64,
    /// Total size of the external allocation.
    pub size: u64,
}

/// Import request: a handle plus the memory window behind it.
#[derive(Clone, Copy, Debug)]
pub struct SharedMemParams {
    /// The caller-owned handle.
    pub handle: ImportHandle,
    /// Byte offset of the object within the imported memory.
    pub offset: u64,
    /// Total size of the imported memory.
    pub size: u64,
}

/// One entry of the driver's memory type table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MemoryType {
    /// Property flags of this type.
    pub flags: MemoryFlags,
    /// Index of the physical heap backing it.
    pub heap_index: u32,
}

/// One physical memory heap of the device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HeapInfo {
    /// Heap size in bytes.
    pub size: u64,
    /// Whether the heap is device-local.
    pub device_local: bool,
}

/// The driver's memory configuration, enumerated once.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    /// Memory types in the driver's preference order: the first matching
    /// type is the best one.
    pub types: Vec<MemoryType>,
    /// Physical heaps.
    pub heaps: Vec<HeapInfo>,
}

/// Placement requirements the driver reports for an allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MemoryRequirements {
    /// Required size; may exceed what the caller asked for.
    pub size: u64,
    /// Required alignment.
    pub align: u64,
    /// Bitmask of acceptable memory type indices; 0 means unconstrained.
    pub type_bits: u32,
}

/// The driver surface the allocator runs against. A concrete GPU backend
/// implements this over its device; tests drive the allocator with a stub.
pub trait MemoryDevice {
    /// Raw device memory allocation.
    type Memory: fmt::Debug;
    /// Raw buffer resource.
    type Buffer: fmt::Debug;

    /// Enumerate memory types and heaps.
    fn properties(&self) -> MemoryProperties;
    /// Required alignment between buffer and image memory.
    fn buffer_image_granularity(&self) -> u64;
    /// Required alignment of imported host pointers.
    fn host_ptr_alignment(&self) -> u64;
    /// Largest single allocation the driver accepts.
    fn max_alloc_size(&self) -> u64;

    /// Allocate device memory of the given type, optionally exportable as
    /// `export`.
    fn alloc(
        &mut self,
        size: u64,
        type_index: u32,
        export: Option<HandleType>,
    ) -> Result<Self::Memory, Error>;
    /// Free device memory. Implicitly unmaps it.
    fn free(&mut self, mem: Self::Memory);

    /// Create a buffer and report its placement requirements.
    fn buf_create(
        &mut self,
        size: u64,
        usage: BufferUsage,
        export: Option<HandleType>,
    ) -> Result<(Self::Buffer, MemoryRequirements), Error>;
    /// Destroy a buffer.
    fn buf_destroy(&mut self, buf: Self::Buffer);
    /// Bind a buffer to memory at offset 0.
    fn bind(&mut self, buf: &Self::Buffer, mem: &Self::Memory) -> Result<(), Error>;
    /// Map memory into host address space.
    fn map(&mut self, mem: &Self::Memory) -> Result<NonNull<u8>, Error>;

    /// Extract the external handle of an exportable allocation.
    fn export(&mut self, mem: &Self::Memory, ty: HandleType) -> Result<Handle, Error>;
    /// Memory type bits compatible with importing this specific handle.
    fn import_props(&mut self, handle: &ImportHandle) -> Result<u32, Error>;
    /// Import external memory as a device allocation of the given type.
    fn import(&mut self, size: u64, type_index: u32, handle: &Handle)
        -> Result<Self::Memory, Error>;

    /// Whether a trivial transfer buffer could be exported or imported
    /// with this handle type. A rough probe; specific checks still happen
    /// at buffer creation time.
    fn external_check(&self, usage: BufferUsage, ty: HandleType, import: bool) -> bool;
}

/// A contiguous free range within a slab.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Region {
    /// First offset in the region.
    pub start: u64,
    /// First offset past the region.
    pub end: u64,
}

impl Region {
    fn len(&self) -> u64 {
        self.end - self.start
    }

    fn fits(&self, size: u64, align: u64) -> bool {
        align_to(self.start, align) + size <= self.end
    }
}

/// Stable identity of a slab, valid for the lifetime of the allocator.
/// Slab storage positions move; ids do not.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SlabId(u64);

// One driver allocation, carved into slices. The free space map stays
// sorted, disjoint and maximally coalesced.
#[derive(Debug)]
struct Slab<D: MemoryDevice> {
    id: SlabId,
    mem: D::Memory,
    size: u64,
    used: u64,
    dedicated: bool,
    imported: bool,
    regions: SmallVec<[Region; 8]>,
    buffer: Option<D::Buffer>,
    data: Option<NonNull<u8>>,
    coherent: bool,
    handle: Option<Handle>,
}

impl<D: MemoryDevice> Slab<D> {
    fn insert_region(&mut self, region: Region) {
        if region.start == region.end {
            return;
        }

        let big_enough = region.len() >= MIN_REGION;

        for i in 0..self.regions.len() {
            if self.regions[i].end == region.start {
                // The new region is at the tail of this one: extend it,
                // then keep coalescing forward as long as possible.
                self.regions[i].end = region.end;
                while i + 1 < self.regions.len() && self.regions[i].end == self.regions[i + 1].start
                {
                    self.regions[i].end = self.regions[i + 1].end;
                    self.regions.remove(i + 1);
                }
                return;
            }

            if self.regions[i].start == region.end {
                // The new region is at the head of this one. Any backward
                // coalescing would already have been caught by an earlier
                // iteration.
                self.regions[i].start = region.start;
                return;
            }

            if self.regions[i].start > region.start {
                if big_enough {
                    self.regions.insert(i, region);
                }
                return;
            }
        }

        // All existing regions come before the new one, disconnected
        if big_enough {
            self.regions.push(region);
        }
    }
}

// All slabs sharing one allocation signature, in insertion order.
#[derive(Debug)]
struct Heap<D: MemoryDevice> {
    usage: BufferUsage,
    flags: MemoryFlags,
    type_bits: u32,
    handle_type: Option<HandleType>,
    slabs: Vec<Slab<D>>,
}

// Where a slice's slab lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Owner {
    Heap(usize),
    Imported,
}

/// A suballocation. The slice stays valid for the lifetime of the
/// allocator that produced it and must be returned to it with
/// [`Allocator::free`].
#[derive(Debug)]
pub struct Slice {
    owner: Owner,
    slab: SlabId,
    /// Byte offset within the underlying device allocation.
    pub offset: u64,
    /// Size of the suballocation.
    pub size: u64,
    /// Host pointer to the slice, when its memory is mapped.
    pub data: Option<NonNull<u8>>,
    /// Whether the mapping is coherent.
    pub coherent: bool,
    /// Window of the slice within the slab's external allocation.
    pub shared: SharedMem,
}

/// Observable state of one slab; see [`Allocator::slab_stats`].
#[derive(Clone, Debug)]
pub struct SlabStats {
    /// Total slab size.
    pub size: u64,
    /// Outstanding slice bytes.
    pub used: u64,
    /// The slab serves exactly one slice and dies with it.
    pub dedicated: bool,
    /// The slab wraps caller-provided external memory.
    pub imported: bool,
    /// The free-space map, ordered by offset.
    pub regions: Vec<Region>,
}

/// The allocator: a driver plus one heap per allocation signature.
#[derive(Debug)]
pub struct Allocator<D: MemoryDevice> {
    device: D,
    props: MemoryProperties,
    granularity: u64,
    host_ptr_align: u64,
    max_alloc: u64,
    heaps: Vec<Heap<D>>,
    imported: Vec<Slab<D>>,
    next_slab_id: u64,
}

impl<D: MemoryDevice> Allocator<D> {
    /// Take ownership of the driver and enumerate its memory
    /// configuration.
    pub fn new(device: D) -> Self {
        let props = device.properties();
        let granularity = device.buffer_image_granularity();
        let host_ptr_align = device.host_ptr_alignment();
        let max_alloc = device.max_alloc_size();

        info!("memory heaps supported by device:");
        for (i, heap) in props.heaps.iter().enumerate() {
            info!("    heap {}: size {} local {}", i, heap.size, heap.device_local);
        }
        info!("memory types supported by device:");
        for (i, ty) in props.types.iter().enumerate() {
            info!("    type {}: flags {:?} heap {}", i, ty.flags, ty.heap_index);
        }

        Allocator {
            device,
            props,
            granularity,
            host_ptr_align,
            max_alloc,
            heaps: Vec::new(),
            imported: Vec::new(),
            next_slab_id: 0,
        }
    }

    /// The wrapped driver.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Allocate bufferless memory matching the driver-reported
    /// requirements.
    pub fn generic(
        &mut self,
        reqs: MemoryRequirements,
        flags: MemoryFlags,
        handle_type: Option<HandleType>,
    ) -> Result<Slice, Error> {
        let heap = self.find_heap(BufferUsage::empty(), flags, handle_type, Some(&reqs));
        self.slice_heap(heap, reqs.size, reqs.align)
    }

    /// Allocate memory backed by a window of a slab-spanning buffer.
    /// [`Allocator::slice_buffer`] retrieves that buffer.
    pub fn buffer(
        &mut self,
        usage: BufferUsage,
        flags: MemoryFlags,
        size: u64,
        align: u64,
        handle_type: Option<HandleType>,
    ) -> Result<Slice, Error> {
        assert!(!usage.is_empty(), "buffer slice without a buffer usage");
        let heap = self.find_heap(usage, flags, handle_type, None);
        self.slice_heap(heap, size, align)
    }

    /// The buffer spanning the slice's slab, if its heap carries one.
    pub fn slice_buffer(&self, slice: &Slice) -> Option<&D::Buffer> {
        self.lookup(slice).and_then(|slab| slab.buffer.as_ref())
    }

    /// The external handle of the slice's slab, if it was exported or
    /// imported.
    pub fn slice_handle(&self, slice: &Slice) -> Option<&Handle> {
        self.lookup(slice).and_then(|slab| slab.handle.as_ref())
    }

    /// Return a slice. Dedicated slabs die with their slice; everything
    /// else goes back into the free-space map.
    pub fn free(&mut self, slice: Slice) {
        let slabs = match slice.owner {
            Owner::Heap(idx) => &mut self.heaps[idx].slabs,
            Owner::Imported => &mut self.imported,
        };
        let pos = slabs
            .iter()
            .position(|s| s.id == slice.slab)
            .expect("slice outlived its slab");

        let slab = &mut slabs[pos];
        assert!(slab.used >= slice.size, "freeing more than was allocated");
        slab.used -= slice.size;

        debug!(
            "freeing slice {} + {} from slab with size {}",
            slice.offset, slice.size, slab.size
        );

        if slab.dedicated {
            let slab = slabs.remove(pos);
            self.slab_release(slab);
        } else {
            slab.insert_region(Region {
                start: slice.offset,
                end: slice.offset + slice.size,
            });
        }
    }

    /// Wrap caller-owned external memory in a dedicated slab. File
    /// descriptors are duplicated; host pointers must satisfy the
    /// driver's import alignment.
    pub fn import(
        &mut self,
        mut reqs: MemoryRequirements,
        shared: SharedMemParams,
    ) -> Result<Slice, Error> {
        if reqs.size > shared.size {
            error!("imported object requires memory larger than the provided size");
            return Err(Error::Unsupported);
        }
        if reqs.type_bits == 0 {
            reqs.type_bits = u32::MAX;
        }

        let handle = match shared.handle {
            #[cfg(unix)]
            ImportHandle::DmaBuf(fd) => {
                reqs.type_bits &= self.device.import_props(&shared.handle)?;
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let owned = borrowed.try_clone_to_owned().map_err(|err| {
                    error!("failed to duplicate fd {} for import: {}", fd, err);
                    Error::Unsupported
                })?;
                Handle::DmaBuf(owned)
            }
            ImportHandle::HostPtr(ptr) => {
                let align = self.host_ptr_align.max(1);
                if ptr as u64 % align != 0 {
                    error!(
                        "imported host pointer {:p} does not satisfy the import alignment {}",
                        ptr, align
                    );
                    return Err(Error::Unsupported);
                }
                if shared.size > self.max_alloc {
                    error!("imported host memory exceeds the maximum allocation size");
                    return Err(Error::Unsupported);
                }
                reqs.type_bits &= self.device.import_props(&shared.handle)?;
                Handle::HostPtr(ptr)
            }
        };

        if reqs.type_bits == 0 {
            error!("no compatible memory types offered for imported memory");
            return Err(Error::HandleUnsupported);
        }
        // No better basis for choosing than the first compatible type
        let type_index = reqs.type_bits.trailing_zeros();

        let mem = self.device.import(shared.size, type_index, &handle)?;
        debug!("imported {} bytes of memory as {:?}", shared.size, handle.ty());

        let mut slab = Slab {
            id: self.next_id(),
            mem,
            size: shared.size,
            used: shared.size,
            dedicated: true,
            imported: true,
            regions: SmallVec::new(),
            buffer: None,
            data: None,
            coherent: false,
            handle: Some(handle),
        };

        let flags = self.props.types[type_index as usize].flags;
        if flags.contains(MemoryFlags::HOST_VISIBLE) {
            match self.device.map(&slab.mem) {
                Ok(data) => {
                    slab.data = Some(data);
                    slab.coherent = flags.contains(MemoryFlags::HOST_COHERENT);
                }
                Err(err) => {
                    self.device.free(slab.mem);
                    return Err(err);
                }
            }
        }

        let slice = Slice {
            owner: Owner::Imported,
            slab: slab.id,
            offset: shared.offset,
            size: shared.size,
            data: slab
                .data
                .map(|p| unsafe { NonNull::new_unchecked(p.as_ptr().add(shared.offset as usize)) }),
            coherent: slab.coherent,
            shared: SharedMem {
                offset: shared.offset,
                size: shared.size,
            },
        };
        self.imported.push(slab);
        Ok(slice)
    }

    /// Which handle types the driver could export (or import, with
    /// `import`) for a trivial transfer buffer.
    pub fn handle_caps(&self, import: bool) -> HandleCaps {
        let mut caps = HandleCaps::empty();
        for &ty in HANDLE_TYPES.iter() {
            if self.device.external_check(BufferUsage::TRANSFER_DST, ty, import) {
                caps |= ty.into();
            }
        }
        caps
    }

    /// Snapshot of every slab, heap slabs first in insertion order, then
    /// imported slabs.
    pub fn slab_stats(&self) -> Vec<SlabStats> {
        self.heaps
            .iter()
            .flat_map(|heap| heap.slabs.iter())
            .chain(self.imported.iter())
            .map(|slab| SlabStats {
                size: slab.size,
                used: slab.used,
                dedicated: slab.dedicated,
                imported: slab.imported,
                regions: slab.regions.to_vec(),
            })
            .collect()
    }

    fn next_id(&mut self) -> SlabId {
        let id = SlabId(self.next_slab_id);
        self.next_slab_id += 1;
        id
    }

    fn lookup(&self, slice: &Slice) -> Option<&Slab<D>> {
        let slabs = match slice.owner {
            Owner::Heap(idx) => &self.heaps[idx].slabs,
            Owner::Imported => &self.imported,
        };
        slabs.iter().find(|s| s.id == slice.slab)
    }

    // Find the heap with this exact allocation signature, creating it if
    // it does not exist yet.
    fn find_heap(
        &mut self,
        usage: BufferUsage,
        flags: MemoryFlags,
        handle_type: Option<HandleType>,
        reqs: Option<&MemoryRequirements>,
    ) -> usize {
        let type_bits = reqs.map(|r| r.type_bits).unwrap_or(0);

        for (i, heap) in self.heaps.iter().enumerate() {
            if heap.usage == usage
                && heap.flags == flags
                && heap.type_bits == type_bits
                && heap.handle_type == handle_type
            {
                return i;
            }
        }

        self.heaps.push(Heap {
            usage,
            flags,
            type_bits,
            handle_type,
            slabs: Vec::new(),
        });
        self.heaps.len() - 1
    }

    fn slice_heap(&mut self, heap: usize, size: u64, align: u64) -> Result<Slice, Error> {
        let align = lcm(align.max(1), self.granularity.max(1));
        let (pos, index) = self.heap_get_region(heap, size, align)?;

        let slab = &mut self.heaps[heap].slabs[pos];
        let reg = slab.regions.remove(index);
        let offset = align_to(reg.start, align);

        debug!(
            "sub-allocating slice {} + {} from slab with size {}",
            offset, size, slab.size
        );

        slab.insert_region(Region { start: reg.start, end: offset });
        slab.insert_region(Region { start: offset + size, end: reg.end });
        slab.used += size;

        Ok(Slice {
            owner: Owner::Heap(heap),
            slab: slab.id,
            offset,
            size,
            data: slab
                .data
                .map(|p| unsafe { NonNull::new_unchecked(p.as_ptr().add(offset as usize)) }),
            coherent: slab.coherent,
            shared: SharedMem {
                offset,
                size: slab.size,
            },
        })
    }

    // Find the best-fitting region in a heap: the smallest region that
    // still fits, searching slabs in insertion order. Oversized requests
    // get a dedicated slab; a heap that is too small or too fragmented
    // grows by one slab.
    fn heap_get_region(
        &mut self,
        heap: usize,
        size: u64,
        align: u64,
    ) -> Result<(usize, usize), Error> {
        if size > MAX_SLAB {
            let mut slab = self.slab_alloc(heap, size)?;
            slab.dedicated = true;
            let slabs = &mut self.heaps[heap].slabs;
            slabs.push(slab);
            return Ok((slabs.len() - 1, 0));
        }

        for (pos, slab) in self.heaps[heap].slabs.iter().enumerate() {
            if slab.size < size {
                continue;
            }

            let mut best: Option<usize> = None;
            for (index, region) in slab.regions.iter().enumerate() {
                if !region.fits(size, align) {
                    continue;
                }
                if let Some(b) = best {
                    if region.len() > slab.regions[b].len() {
                        continue;
                    }
                }
                best = Some(index);
            }

            if let Some(index) = best {
                return Ok((pos, index));
            }
        }

        let last_size = self.heaps[heap].slabs.last().map(|s| s.size).unwrap_or(0);
        let slab_size = (SLAB_GROWTH * size.max(last_size)).max(MIN_SLAB).min(MAX_SLAB);
        assert!(slab_size >= size);

        let slab = self.slab_alloc(heap, slab_size)?;
        assert_eq!(slab.regions.len(), 1);
        let slabs = &mut self.heaps[heap].slabs;
        slabs.push(slab);
        Ok((slabs.len() - 1, 0))
    }

    // Allocate one slab for a heap. On failure every partially built
    // artifact is released before returning.
    fn slab_alloc(&mut self, heap: usize, size: u64) -> Result<Slab<D>, Error> {
        let (usage, flags, heap_type_bits, handle_type) = {
            let heap = &self.heaps[heap];
            (heap.usage, heap.flags, heap.type_bits, heap.handle_type)
        };

        let mut type_bits = if heap_type_bits != 0 { heap_type_bits } else { u32::MAX };
        let mut alloc_size = size;
        let mut buffer = None;

        if !usage.is_empty() {
            if let Some(ty) = handle_type {
                if !self.device.external_check(usage, ty, false) {
                    error!(
                        "failed allocating shared memory buffer: possibly the \
                         handle type is unsupported?"
                    );
                    return Err(Error::HandleUnsupported);
                }
            }

            let (buf, reqs) = self.device.buf_create(size, usage, handle_type)?;
            // the driver may ask for more than the slab size, and may
            // restrict the types
            alloc_size = reqs.size.max(size);
            if reqs.type_bits != 0 {
                type_bits &= reqs.type_bits;
            }
            buffer = Some(buf);
        }

        let (type_index, type_flags) = match self.find_best_memtype(type_bits, flags) {
            Some(found) => found,
            None => {
                release_partial(&mut self.device, buffer, None);
                return Err(Error::Unsupported);
            }
        };

        info!(
            "allocating {} memory of type {:?} (id {}) in heap {}",
            alloc_size, type_flags, type_index, self.props.types[type_index as usize].heap_index
        );

        let mem = match self.device.alloc(alloc_size, type_index, handle_type) {
            Ok(mem) => mem,
            Err(err) => {
                release_partial(&mut self.device, buffer, None);
                return Err(err);
            }
        };

        let mut data = None;
        let mut coherent = false;
        if type_flags.contains(MemoryFlags::HOST_VISIBLE) {
            match self.device.map(&mem) {
                Ok(ptr) => {
                    data = Some(ptr);
                    coherent = type_flags.contains(MemoryFlags::HOST_COHERENT);
                }
                Err(err) => {
                    release_partial(&mut self.device, buffer, Some(mem));
                    return Err(err);
                }
            }
        }

        if let Some(buf) = &buffer {
            if let Err(err) = self.device.bind(buf, &mem) {
                release_partial(&mut self.device, buffer, Some(mem));
                return Err(err);
            }
        }

        let mut handle = None;
        if let Some(ty) = handle_type {
            match self.device.export(&mem, ty) {
                Ok(h) => handle = Some(h),
                Err(err) => {
                    release_partial(&mut self.device, buffer, Some(mem));
                    return Err(err);
                }
            }
        }

        let mut regions = SmallVec::new();
        regions.push(Region { start: 0, end: size });

        Ok(Slab {
            id: self.next_id(),
            mem,
            size,
            used: 0,
            dedicated: false,
            imported: false,
            regions,
            buffer,
            data,
            coherent,
            handle,
        })
    }

    // The driver's type table is in preference order, so the first
    // matching type is the best one.
    fn find_best_memtype(&self, type_bits: u32, flags: MemoryFlags) -> Option<(u32, MemoryFlags)> {
        for (i, ty) in self.props.types.iter().enumerate() {
            if !ty.flags.contains(flags) {
                continue;
            }
            if type_bits & (1u32 << i) == 0 {
                continue;
            }
            return Some((i as u32, ty.flags));
        }

        error!(
            "found no memory type matching property flags {:?} and type bits {:#x}",
            flags, type_bits
        );
        None
    }

    fn slab_release(&mut self, slab: Slab<D>) {
        debug_assert_eq!(slab.used, 0, "releasing a slab with outstanding slices");

        if !slab.imported {
            if let Some(buf) = slab.buffer {
                self.device.buf_destroy(buf);
            }
            info!("freed slab of size {}", slab.size);
        } else {
            debug!("unimporting slab of size {}", slab.size);
        }

        // closes the external handle where the type requires it
        drop(slab.handle);
        // also implicitly unmaps the memory
        self.device.free(slab.mem);
    }
}

impl<D: MemoryDevice> Drop for Allocator<D> {
    fn drop(&mut self) {
        for heap in mem::take(&mut self.heaps) {
            for slab in heap.slabs {
                self.slab_release(slab);
            }
        }
        for slab in mem::take(&mut self.imported) {
            self.slab_release(slab);
        }
    }
}

fn release_partial<D: MemoryDevice>(
    device: &mut D,
    buffer: Option<D::Buffer>,
    mem: Option<D::Memory>,
) {
    if let Some(buf) = buffer {
        device.buf_destroy(buf);
    }
    if let Some(mem) = mem {
        device.free(mem);
    }
}

fn align_to(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullDevice;

    impl MemoryDevice for NullDevice {
        type Memory = ();
        type Buffer = ();

        fn properties(&self) -> MemoryProperties {
            MemoryProperties::default()
        }
        fn buffer_image_granularity(&self) -> u64 {
            1
        }
        fn host_ptr_alignment(&self) -> u64 {
            1
        }
        fn max_alloc_size(&self) -> u64 {
            u64::MAX
        }
        fn alloc(&mut self, _: u64, _: u32, _: Option<HandleType>) -> Result<(), Error> {
            Ok(())
        }
        fn free(&mut self, _: ()) {}
        fn buf_create(
            &mut self,
            size: u64,
            _: BufferUsage,
            _: Option<HandleType>,
        ) -> Result<((), MemoryRequirements), Error> {
            Ok(((), MemoryRequirements { size, align: 1, type_bits: 0 }))
        }
        fn buf_destroy(&mut self, _: ()) {}
        fn bind(&mut self, _: &(), _: &()) -> Result<(), Error> {
            Ok(())
        }
        fn map(&mut self, _: &()) -> Result<NonNull<u8>, Error> {
            Err(Error::Unsupported)
        }
        fn export(&mut self, _: &(), _: HandleType) -> Result<Handle, Error> {
            Err(Error::HandleUnsupported)
        }
        fn import_props(&mut self, _: &ImportHandle) -> Result<u32, Error> {
            Ok(0)
        }
        fn import(&mut self, _: u64, _: u32, _: &Handle) -> Result<(), Error> {
            Err(Error::HandleUnsupported)
        }
        fn external_check(&self, _: BufferUsage, _: HandleType, _: bool) -> bool {
            false
        }
    }

    fn slab(regions: &[(u64, u64)]) -> Slab<NullDevice> {
        Slab {
            id: SlabId(0),
            mem: (),
            size: 1 << 20,
            used: 0,
            dedicated: false,
            imported: false,
            regions: regions.iter().map(|&(start, end)| Region { start, end }).collect(),
            buffer: None,
            data: None,
            coherent: false,
            handle: None,
        }
    }

    fn ranges(slab: &Slab<NullDevice>) -> Vec<(u64, u64)> {
        slab.regions.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn insert_extends_tail_and_merges_forward() {
        let mut s = slab(&[(0, 4096), (8192, 12288)]);
        s.insert_region(Region { start: 4096, end: 8192 });
        assert_eq!(ranges(&s), [(0, 12288)]);
    }

    #[test]
    fn insert_extends_head() {
        let mut s = slab(&[(8192, 12288)]);
        s.insert_region(Region { start: 4096, end: 8192 });
        assert_eq!(ranges(&s), [(4096, 12288)]);
    }

    #[test]
    fn insert_keeps_order() {
        let mut s = slab(&[(0, 2048), (65536, 131072)]);
        s.insert_region(Region { start: 16384, end: 32768 });
        assert_eq!(ranges(&s), [(0, 2048), (16384, 32768), (65536, 131072)]);
    }

    #[test]
    fn tiny_disconnected_regions_are_dropped() {
        let mut s = slab(&[(0, 2048)]);
        s.insert_region(Region { start: 8192, end: 8192 + MIN_REGION - 1 });
        assert_eq!(ranges(&s), [(0, 2048)]);
    }

    #[test]
    fn tiny_regions_still_coalesce() {
        let mut s = slab(&[(0, 2048)]);
        s.insert_region(Region { start: 2048, end: 2064 });
        assert_eq!(ranges(&s), [(0, 2064)]);
    }

    #[test]
    fn empty_region_is_ignored() {
        let mut s = slab(&[(0, 2048)]);
        s.insert_region(Region { start: 4096, end: 4096 });
        assert_eq!(ranges(&s), [(0, 2048)]);
    }

    #[test]
    fn lcm_of_alignment_and_granularity() {
        assert_eq!(lcm(16, 1024), 1024);
        assert_eq!(lcm(24, 16), 48);
        assert_eq!(lcm(1, 1), 1);
    }
}
