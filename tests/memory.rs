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

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use glare::memory::{
    Allocator, BufferUsage, Handle, HandleCaps, HandleType, HeapInfo, ImportHandle, MemoryDevice,
    MemoryFlags, MemoryProperties, MemoryRequirements, MemoryType, SharedMemParams, SlabStats,
    Slice, MAX_SLAB, MIN_REGION, MIN_SLAB, SLAB_GROWTH,
};
use glare::Error;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
struct Counters {
    allocs: usize,
    frees: usize,
    bufs: usize,
    buf_frees: usize,
    maps: usize,
}

#[derive(Debug)]
struct StubDriver {
    types: Vec<MemoryType>,
    granularity: u64,
    host_align: u64,
    max_alloc: u64,
    import_bits: u32,
    import_caps: HandleCaps,
    export_caps: HandleCaps,
    fail_alloc: bool,
    counters: Rc<RefCell<Counters>>,
    next: u64,
}

impl StubDriver {
    fn new() -> Self {
        StubDriver {
            types: vec![MemoryType {
                flags: MemoryFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
            granularity: 1,
            host_align: 4096,
            max_alloc: 1 << 31,
            import_bits: 0b1,
            import_caps: HandleCaps::HOST_PTR,
            export_caps: HandleCaps::empty(),
            fail_alloc: false,
            counters: Rc::new(RefCell::new(Counters::default())),
            next: 0,
        }
    }

    fn fresh(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

impl MemoryDevice for StubDriver {
    type Memory = u64;
    type Buffer = u64;

    fn properties(&self) -> MemoryProperties {
        MemoryProperties {
            types: self.types.clone(),
            heaps: vec![HeapInfo {
                size: 1 << 33,
                device_local: true,
            }],
        }
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.granularity
    }

    fn host_ptr_alignment(&self) -> u64 {
        self.host_align
    }

    fn max_alloc_size(&self) -> u64 {
        self.max_alloc
    }

    fn alloc(&mut self, _size: u64, _ty: u32, _export: Option<HandleType>) -> Result<u64, Error> {
        if self.fail_alloc {
            return Err(Error::OutOfMemory);
        }
        self.counters.borrow_mut().allocs += 1;
        Ok(self.fresh())
    }

    fn free(&mut self, _mem: u64) {
        self.counters.borrow_mut().frees += 1;
    }

    fn buf_create(
        &mut self,
        size: u64,
        _usage: BufferUsage,
        _export: Option<HandleType>,
    ) -> Result<(u64, MemoryRequirements), Error> {
        self.counters.borrow_mut().bufs += 1;
        let id = self.fresh();
        Ok((
            id,
            MemoryRequirements {
                size,
                align: 16,
                type_bits: 0b1,
            },
        ))
    }

    fn buf_destroy(&mut self, _buf: u64) {
        self.counters.borrow_mut().buf_frees += 1;
    }

    fn bind(&mut self, _buf: &u64, _mem: &u64) -> Result<(), Error> {
        Ok(())
    }

    fn map(&mut self, _mem: &u64) -> Result<NonNull<u8>, Error> {
        self.counters.borrow_mut().maps += 1;
        // backing storage for mapped slabs; leaked for pointer stability
        let storage: &'static mut [u8] = Box::leak(vec![0u8; (4 * MIN_SLAB) as usize].into());
        Ok(NonNull::new(storage.as_mut_ptr()).unwrap())
    }

    fn export(&mut self, _mem: &u64, _ty: HandleType) -> Result<Handle, Error> {
        Err(Error::HandleUnsupported)
    }

    fn import_props(&mut self, _handle: &ImportHandle) -> Result<u32, Error> {
        Ok(self.import_bits)
    }

    fn import(&mut self, _size: u64, _ty: u32, _handle: &Handle) -> Result<u64, Error> {
        self.counters.borrow_mut().allocs += 1;
        Ok(self.fresh())
    }

    fn external_check(&self, _usage: BufferUsage, ty: HandleType, import: bool) -> bool {
        let caps = if import { self.import_caps } else { self.export_caps };
        caps.contains(ty.into())
    }
}

fn alloc(a: &mut Allocator<StubDriver>, size: u64, align: u64) -> Slice {
    a.generic(
        MemoryRequirements {
            size,
            align,
            type_bits: 0,
        },
        MemoryFlags::DEVICE_LOCAL,
        None,
    )
    .expect("allocation failed")
}

fn check_invariants(stats: &[SlabStats]) {
    for slab in stats {
        for w in slab.regions.windows(2) {
            assert!(w[0].start < w[1].start, "regions out of order");
            assert!(w[0].end < w[1].start, "regions overlapping or adjacent");
        }
        for r in &slab.regions {
            assert!(r.start < r.end, "empty region tracked");
            assert!(r.end <= slab.size, "region past the slab");
        }
        let free: u64 = slab.regions.iter().map(|r| r.end - r.start).sum();
        assert!(slab.used + free <= slab.size, "accounting overflow");
        if slab.dedicated {
            assert!(slab.regions.is_empty());
            assert_eq!(slab.used, slab.size);
        }
    }
}

#[test]
fn best_fit_lands_in_the_freed_hole() {
    init();
    let mut a = Allocator::new(StubDriver::new());

    let s1 = alloc(&mut a, 1024, 16);
    let s2 = alloc(&mut a, 2048, 16);
    let s3 = alloc(&mut a, 1024, 16);
    assert_eq!(s1.offset, 0);
    assert_eq!(s2.offset, 1024);
    assert_eq!(s3.offset, 3072);

    a.free(s2);
    check_invariants(&a.slab_stats());

    // the freed hole fits exactly and beats the large tail region
    let s4 = alloc(&mut a, 2048, 16);
    assert_eq!(s4.offset, 1024, "best fit must reuse the freed hole");

    let stats = a.slab_stats();
    assert_eq!(stats.len(), 1, "everything came from one slab");
    assert_eq!(stats[0].size, MIN_SLAB);
    assert_eq!(stats[0].used, 4096);

    a.free(s1);
    a.free(s3);
    a.free(s4);
}

#[test]
fn freeing_coalesces_into_one_region() {
    let mut a = Allocator::new(StubDriver::new());

    let s1 = alloc(&mut a, 1024, 16);
    let s2 = alloc(&mut a, 2048, 16);
    let s3 = alloc(&mut a, 1024, 16);

    a.free(s2);
    let s4 = alloc(&mut a, 2048, 16);

    a.free(s1);
    a.free(s3);
    let stats = a.slab_stats();
    check_invariants(&stats);
    assert_eq!(
        stats[0].regions.len(),
        2,
        "the head and the tail hole stay separate while the middle is allocated"
    );

    // the last free merges head, middle and tail into the full slab
    a.free(s4);
    let stats = a.slab_stats();
    check_invariants(&stats);
    assert_eq!(stats[0].used, 0);
    assert_eq!(stats[0].regions.len(), 1);
    assert_eq!(stats[0].regions[0].start, 0);
    assert_eq!(stats[0].regions[0].end, MIN_SLAB);
}

#[test]
fn oversized_requests_get_a_dedicated_slab() {
    init();
    let mut a = Allocator::new(StubDriver::new());
    let counters = a.device().counters.clone();

    let slice = alloc(&mut a, MAX_SLAB + 1, 16);
    assert_eq!(slice.offset, 0);
    assert_eq!(slice.size, MAX_SLAB + 1);

    let stats = a.slab_stats();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].dedicated);
    assert_eq!(stats[0].size, MAX_SLAB + 1, "dedicated slabs are cut to measure");
    assert_eq!(stats[0].used, stats[0].size);
    assert!(stats[0].regions.is_empty());
    check_invariants(&stats);

    // freeing the one slice destroys the whole slab
    a.free(slice);
    assert!(a.slab_stats().is_empty());
    assert_eq!(counters.borrow().frees, 1);
}

#[test]
fn slabs_grow_geometrically_up_to_the_cap() {
    let mut a = Allocator::new(StubDriver::new());

    let first = alloc(&mut a, 1024, 16);
    assert_eq!(a.slab_stats()[0].size, MIN_SLAB);

    // too big for what is left of the first slab
    let second = alloc(&mut a, MIN_SLAB, 16);
    let stats = a.slab_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[1].size, SLAB_GROWTH * MIN_SLAB);

    // fits into the second slab's remaining space, no new slab
    let third = alloc(&mut a, 2 * MIN_SLAB, 16);
    assert_eq!(a.slab_stats().len(), 2);

    check_invariants(&a.slab_stats());
    a.free(first);
    a.free(second);
    a.free(third);
}

#[test]
fn alignment_includes_the_buffer_image_granularity() {
    let mut driver = StubDriver::new();
    driver.granularity = 1024;
    let mut a = Allocator::new(driver);

    let s1 = alloc(&mut a, 100, 16);
    let s2 = alloc(&mut a, 100, 16);
    assert_eq!(s1.offset, 0);
    assert_eq!(s2.offset, 1024, "slices are kept apart by the granularity");

    a.free(s1);
    a.free(s2);
}

#[test]
fn distinct_signatures_get_distinct_heaps() {
    let mut driver = StubDriver::new();
    driver.types = vec![
        MemoryType {
            flags: MemoryFlags::DEVICE_LOCAL,
            heap_index: 0,
        },
        MemoryType {
            flags: MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT,
            heap_index: 0,
        },
    ];
    let mut a = Allocator::new(driver);

    let local = a
        .generic(
            MemoryRequirements { size: 1024, align: 16, type_bits: 0 },
            MemoryFlags::DEVICE_LOCAL,
            None,
        )
        .unwrap();
    let visible = a
        .generic(
            MemoryRequirements { size: 1024, align: 16, type_bits: 0 },
            MemoryFlags::HOST_VISIBLE,
            None,
        )
        .unwrap();

    assert_eq!(a.slab_stats().len(), 2, "one slab per heap signature");
    assert!(local.data.is_none());
    assert!(visible.data.is_some(), "host-visible slices carry a mapping");
    assert!(visible.coherent);

    let base = a
        .generic(
            MemoryRequirements { size: 1024, align: 16, type_bits: 0 },
            MemoryFlags::HOST_VISIBLE,
            None,
        )
        .unwrap();
    let delta = base.data.unwrap().as_ptr() as usize - visible.data.unwrap().as_ptr() as usize;
    assert_eq!(delta as u64, base.offset - visible.offset, "mappings follow slice offsets");

    a.free(local);
    a.free(visible);
    a.free(base);
}

#[test]
fn buffer_slices_expose_the_spanning_buffer() {
    init();
    let mut a = Allocator::new(StubDriver::new());
    let counters = a.device().counters.clone();

    let slice = a
        .buffer(
            BufferUsage::TRANSFER_DST,
            MemoryFlags::DEVICE_LOCAL,
            4096,
            16,
            None,
        )
        .unwrap();

    assert!(a.slice_buffer(&slice).is_some());
    assert_eq!(counters.borrow().bufs, 1, "one buffer spans the whole slab");

    // a second slice of the same heap reuses slab and buffer
    let other = a
        .buffer(
            BufferUsage::TRANSFER_DST,
            MemoryFlags::DEVICE_LOCAL,
            4096,
            16,
            None,
        )
        .unwrap();
    assert_eq!(counters.borrow().bufs, 1);
    assert_eq!(a.slab_stats().len(), 1);

    a.free(slice);
    a.free(other);
}

#[test]
fn failed_slab_allocation_unwinds_cleanly() {
    init();
    let mut driver = StubDriver::new();
    driver.fail_alloc = true;
    let counters = driver.counters.clone();
    let mut a = Allocator::new(driver);

    let err = a
        .buffer(
            BufferUsage::TRANSFER_DST,
            MemoryFlags::DEVICE_LOCAL,
            4096,
            16,
            None,
        )
        .unwrap_err();
    assert_eq!(err, Error::OutOfMemory);

    let c = counters.borrow();
    assert_eq!(c.bufs, 1, "the spanning buffer was attempted");
    assert_eq!(c.buf_frees, 1, "and released on the error path");
    assert_eq!(c.frees, 0, "no memory was ever allocated");
    assert!(a.slab_stats().is_empty());
}

#[test]
fn mixed_traffic_upholds_the_free_map_invariants() {
    let mut a = Allocator::new(StubDriver::new());

    let sizes = [1500u64, 3000, 1024, 7777, 2048, 65536, 1111];
    let aligns = [16u64, 32, 64, 16, 256, 16, 128];
    let mut live = Vec::new();

    for (&size, &align) in sizes.iter().zip(&aligns) {
        live.push(alloc(&mut a, size, align));
        check_invariants(&a.slab_stats());
    }

    // free every other slice first, then the rest
    let mut kept = Vec::new();
    for (i, slice) in live.drain(..).enumerate() {
        if i % 2 == 0 {
            a.free(slice);
            check_invariants(&a.slab_stats());
        } else {
            kept.push(slice);
        }
    }

    let stats = a.slab_stats();
    for slab in &stats {
        let free: u64 = slab.regions.iter().map(|r| r.end - r.start).sum();
        // slack from discarded fragments stays bounded
        assert!(slab.size - slab.used - free < MIN_REGION * 16);
    }

    for slice in kept {
        a.free(slice);
        check_invariants(&a.slab_stats());
    }
}

#[test]
fn host_pointer_import_wraps_a_dedicated_slab() {
    init();
    let mut a = Allocator::new(StubDriver::new());
    let counters = a.device().counters.clone();

    let ptr = 0x10000 as *mut u8; // aligned to 4096
    let slice = a
        .import(
            MemoryRequirements { size: 4096, align: 1, type_bits: 0 },
            SharedMemParams {
                handle: ImportHandle::HostPtr(ptr),
                offset: 512,
                size: 8192,
            },
        )
        .unwrap();

    assert_eq!(slice.offset, 512);
    assert_eq!(slice.size, 8192);
    assert_eq!(slice.shared.offset, 512);
    assert_eq!(slice.shared.size, 8192);
    match a.slice_handle(&slice) {
        Some(Handle::HostPtr(p)) => assert_eq!(*p, ptr),
        other => panic!("expected the imported host pointer, got {:?}", other),
    }

    let stats = a.slab_stats();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].imported);
    assert!(stats[0].dedicated);
    assert_eq!(stats[0].used, 8192);

    a.free(slice);
    assert!(a.slab_stats().is_empty());
    assert_eq!(counters.borrow().frees, 1, "imported memory is released as a whole");
}

#[test]
fn import_rejects_misaligned_host_pointers() {
    let mut a = Allocator::new(StubDriver::new());
    let err = a
        .import(
            MemoryRequirements { size: 4096, align: 1, type_bits: 0 },
            SharedMemParams {
                handle: ImportHandle::HostPtr(0x10001 as *mut u8),
                offset: 0,
                size: 8192,
            },
        )
        .unwrap_err();
    assert_eq!(err, Error::Unsupported);
}

#[test]
fn import_rejects_windows_smaller_than_required() {
    let mut a = Allocator::new(StubDriver::new());
    let err = a
        .import(
            MemoryRequirements { size: 16384, align: 1, type_bits: 0 },
            SharedMemParams {
                handle: ImportHandle::HostPtr(0x10000 as *mut u8),
                offset: 0,
                size: 8192,
            },
        )
        .unwrap_err();
    assert_eq!(err, Error::Unsupported);
}

#[test]
fn import_rejects_oversized_host_memory() {
    let mut driver = StubDriver::new();
    driver.max_alloc = 4096;
    let mut a = Allocator::new(driver);
    let err = a
        .import(
            MemoryRequirements { size: 4096, align: 1, type_bits: 0 },
            SharedMemParams {
                handle: ImportHandle::HostPtr(0x10000 as *mut u8),
                offset: 0,
                size: 8192,
            },
        )
        .unwrap_err();
    assert_eq!(err, Error::Unsupported);
}

#[test]
fn import_requires_a_compatible_memory_type() {
    let mut driver = StubDriver::new();
    driver.import_bits = 0;
    let mut a = Allocator::new(driver);
    let err = a
        .import(
            MemoryRequirements { size: 4096, align: 1, type_bits: 0 },
            SharedMemParams {
                handle: ImportHandle::HostPtr(0x10000 as *mut u8),
                offset: 0,
                size: 8192,
            },
        )
        .unwrap_err();
    assert_eq!(err, Error::HandleUnsupported);
}

#[test]
fn handle_caps_probe_each_handle_type() {
    let a = Allocator::new(StubDriver::new());
    assert_eq!(a.handle_caps(true), HandleCaps::HOST_PTR);
    assert_eq!(a.handle_caps(false), HandleCaps::empty());
}

#[test]
fn exporting_heaps_fail_fast_when_unsupported() {
    let mut a = Allocator::new(StubDriver::new());
    let err = a
        .buffer(
            BufferUsage::TRANSFER_DST,
            MemoryFlags::DEVICE_LOCAL,
            4096,
            16,
            Some(HandleType::Fd),
        )
        .unwrap_err();
    assert_eq!(err, Error::HandleUnsupported);
}

#[test]
fn drop_releases_all_slabs() {
    let driver = StubDriver::new();
    let counters = driver.counters.clone();
    {
        let mut a = Allocator::new(driver);
        let s1 = alloc(&mut a, 1024, 16);
        let s2 = alloc(&mut a, 2048, 16);
        a.free(s1);
        a.free(s2);
    }
    let c = counters.borrow();
    assert_eq!(c.allocs, 1);
    assert_eq!(c.frees, 1, "the allocator released its slab on drop");
}
