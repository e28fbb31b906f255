//! Arena allocator for JITs, with reuse of released allocations.
use std::marker::PhantomData;
use std::ptr::NonNull;

#[cfg(target_family = "unix")]
use rustix::mm::{self as mman, MapFlags, MprotectFlags, ProtFlags};
#[cfg(target_family = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache, Memory, Threading::GetCurrentProcess,
};

const REGION_MIN_LEN: usize = 1 << 16;

#[cfg(target_family = "unix")]
fn page_size() -> usize {
    rustix::param::page_size()
}

#[cfg(target_family = "windows")]
fn page_size() -> usize {
    0x1000
}

/// A memory mapped region.
#[derive(Clone, Copy)]
struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: changing the protection can be done from any thread
unsafe impl Send for Region {}

impl Region {
    fn new(addr_hint: Option<usize>, len: usize) -> Self {
        let len = len.max(REGION_MIN_LEN).next_multiple_of(page_size());

        #[cfg(target_family = "unix")]
        let region = unsafe {
            mman::mmap_anonymous(
                addr_hint
                    .map(std::ptr::without_provenance_mut)
                    .unwrap_or_default(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .unwrap();

        #[cfg(target_family = "windows")]
        let region = unsafe {
            let addr_hint_ptr = addr_hint.map(|addr| std::ptr::without_provenance(addr));
            let result = Memory::VirtualAlloc(
                addr_hint_ptr,
                len,
                Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                Memory::PAGE_NOACCESS,
            );

            if !result.is_null() {
                result
            } else {
                Memory::VirtualAlloc(
                    None,
                    len,
                    Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                    Memory::PAGE_NOACCESS,
                )
            }
        };

        Self {
            ptr: region.cast(),
            len,
        }
    }

    #[inline(always)]
    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.addr();
        (start..start + self.len).contains(&ptr.addr())
    }

    /// Changes the protection of every page overlapping `start..start + length`.
    unsafe fn protect(&self, start: *mut u8, length: usize, protection: Protection) {
        let page = page_size();
        let offset = start.addr() - self.ptr.addr();
        let first = offset - offset % page;
        let end = (offset + length).next_multiple_of(page).min(self.len);
        let ptr = unsafe { self.ptr.add(first) };
        let length = end - first;

        #[cfg(target_family = "unix")]
        unsafe {
            let flags = match protection {
                Protection::ReadExec => MprotectFlags::READ | MprotectFlags::EXEC,
                Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            };

            mman::mprotect(ptr.cast(), length, flags).unwrap()
        }

        #[cfg(target_family = "windows")]
        unsafe {
            let mut previous = Memory::PAGE_PROTECTION_FLAGS(0);
            let flags = match protection {
                Protection::ReadExec => Memory::PAGE_EXECUTE_READ,
                Protection::ReadWrite => Memory::PAGE_READWRITE,
            };

            Memory::VirtualProtect(ptr.cast(), length, flags, &raw mut previous).unwrap()
        }
    }
}

/// Makes freshly written code at `ptr..ptr + len` visible to instruction fetch.
#[allow(unused_variables)]
unsafe fn flush_icache(ptr: *const u8, len: usize) {
    #[cfg(target_family = "windows")]
    unsafe {
        let process = GetCurrentProcess();
        FlushInstructionCache(process, Some(ptr.cast()), len).unwrap();
    }

    #[cfg(all(target_arch = "aarch64", not(target_family = "windows")))]
    unsafe {
        use std::arch::asm;

        let ctr: u64;
        asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack));
        let dline = 4usize << ((ctr >> 16) & 0xF);
        let iline = 4usize << (ctr & 0xF);

        let start = ptr.addr();
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr, options(nostack));
            addr += dline;
        }
        asm!("dsb ish", options(nostack));

        let mut addr = start & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr, options(nostack));
            addr += iline;
        }
        asm!("dsb ish", "isb", options(nostack));
    }
}

/// # Safety considerations
/// The allocator this allocation comes from must not be modified while the allocation
/// is accessed. This is specially important for multi-threaded contexts.
pub struct Allocation<K>(NonNull<[u8]>, PhantomData<K>);

impl<K> Allocation<K> {
    /// Returns a pointer to the allocation.
    ///
    /// # Safety
    /// In order to access the data behind the pointer, accesses to the underlying allocator must
    /// be synchronized, as stated in the type docs.
    #[inline(always)]
    pub unsafe fn as_ptr(&self) -> NonNull<[u8]> {
        self.0
    }

    /// Length of the allocation, in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

// SAFETY: safe to send to another thread as long as accesses to the allocation are synchronized
// with accesses to the allocator, which is the user's responsibility
unsafe impl<K> Send for Allocation<K> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadExec,
    ReadWrite,
}

pub trait AllocKind {
    const PROTECTION: Protection;
}

pub struct Exec;
impl AllocKind for Exec {
    const PROTECTION: Protection = Protection::ReadExec;
}

pub struct ReadWrite;
impl AllocKind for ReadWrite {
    const PROTECTION: Protection = Protection::ReadWrite;
}

/// A released chunk of some region, available for reuse.
#[derive(Clone, Copy)]
struct FreeChunk {
    /// Index of the region the chunk lives in. Chunks of different regions never merge, even if
    /// the regions happen to be contiguous.
    region: usize,
    start: usize,
    len: usize,
}

pub struct Allocator<K> {
    /// Every region mapped so far. The last one is the active bump region.
    regions: Vec<Region>,
    /// Offset into the active region
    offset: usize,
    /// Released chunks, sorted by address
    free: Vec<FreeChunk>,
    /// Phantom
    _phantom: PhantomData<K>,
}

impl<K> Default for Allocator<K>
where
    K: AllocKind,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Allocator<K>
where
    K: AllocKind,
{
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            offset: 0,
            free: Vec::new(),
            _phantom: PhantomData,
        }
    }

    fn region_index(&self, ptr: *const u8) -> usize {
        self.regions
            .iter()
            .position(|r| r.contains(ptr))
            .expect("pointer does not belong to this allocator")
    }

    fn region_of(&self, ptr: *const u8) -> Region {
        self.regions[self.region_index(ptr)]
    }

    /// Tries to carve an allocation out of a released chunk.
    fn reuse(&mut self, alignment: usize, length: usize) -> Option<NonNull<[u8]>> {
        let index = self.free.iter().position(|chunk| {
            let aligned = chunk.start.next_multiple_of(alignment);
            aligned + length <= chunk.start + chunk.len
        })?;

        let chunk = self.free.remove(index);
        let aligned = chunk.start.next_multiple_of(alignment);

        let head = aligned - chunk.start;
        let tail = chunk.start + chunk.len - (aligned + length);
        if tail > 0 {
            self.free.insert(
                index,
                FreeChunk {
                    region: chunk.region,
                    start: aligned + length,
                    len: tail,
                },
            );
        }
        if head > 0 {
            self.free.insert(
                index,
                FreeChunk {
                    region: chunk.region,
                    start: chunk.start,
                    len: head,
                },
            );
        }

        let region = self.regions[chunk.region];
        let ptr = region.ptr.with_addr(aligned);
        Some(NonNull::slice_from_raw_parts(
            NonNull::new(ptr).unwrap(),
            length,
        ))
    }

    fn bump(&mut self, alignment: usize, length: usize) -> NonNull<[u8]> {
        loop {
            let Some(region) = self.regions.last().copied() else {
                self.regions.push(Region::new(None, length));
                continue;
            };

            let effective_offset = self.offset.next_multiple_of(alignment);
            let remaining = region.len.checked_sub(effective_offset);
            if remaining.is_none_or(|r| r < length) {
                let end = unsafe { region.ptr.add(region.len) };
                self.regions.push(Region::new(Some(end.addr()), length));
                self.offset = 0;
                continue;
            }

            let start = unsafe { region.ptr.add(effective_offset) };
            self.offset = effective_offset + length;

            return NonNull::slice_from_raw_parts(NonNull::new(start).unwrap(), length);
        }
    }

    fn allocate_inner(&mut self, alignment: usize, length: usize) -> Allocation<K> {
        assert!(length > 0);

        let alignment = alignment.max(1).next_power_of_two();
        let ptr = match self.reuse(alignment, length) {
            Some(ptr) => ptr,
            None => self.bump(alignment, length),
        };

        Allocation(ptr, PhantomData)
    }

    pub fn allocate_uninit(&mut self, alignment: usize, length: usize) -> Allocation<K> {
        let alloc = self.allocate_inner(alignment, length);
        let start = alloc.0.as_ptr().cast::<u8>();
        let region = self.region_of(start);
        unsafe { region.protect(start, length, K::PROTECTION) };

        alloc
    }

    pub fn allocate(&mut self, alignment: usize, data: &[u8]) -> Allocation<K> {
        let alloc = self.allocate_inner(alignment, data.len());
        let start = alloc.0.as_ptr().cast::<u8>();
        let region = self.region_of(start);

        unsafe {
            region.protect(start, data.len(), Protection::ReadWrite);
            std::ptr::copy_nonoverlapping(data.as_ptr(), start, data.len());
            if K::PROTECTION != Protection::ReadWrite {
                region.protect(start, data.len(), K::PROTECTION);
            }

            if K::PROTECTION == Protection::ReadExec {
                flush_icache(start, data.len());
            }
        }

        alloc
    }

    /// Returns the memory of `alloc` to the allocator. The memory keeps its protection until
    /// it is handed out again.
    ///
    /// # Safety
    /// Nothing may access the allocation after it has been released (for executable allocations,
    /// this means no thread may be running its code).
    pub unsafe fn release(&mut self, alloc: Allocation<K>) {
        let ptr = alloc.0.as_ptr().cast::<u8>();
        let region = self.region_index(ptr);
        let start = ptr.addr();
        let len = alloc.0.len();

        let index = self.free.partition_point(|c| c.start < start);
        self.free.insert(index, FreeChunk { region, start, len });

        // coalesce with the following chunk, then with the preceding one
        if index + 1 < self.free.len() {
            let next = self.free[index + 1];
            if next.region == region && start + len == next.start {
                self.free[index].len += next.len;
                self.free.remove(index + 1);
            }
        }

        if index > 0 {
            let prev = self.free[index - 1];
            if prev.region == region && prev.start + prev.len == start {
                self.free[index - 1].len += self.free[index].len;
                self.free.remove(index);
            }
        }
    }

    /// Total amount of bytes currently sitting in the free list.
    pub fn released_bytes(&self) -> usize {
        self.free.iter().map(|c| c.len).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn copies_data() {
        let mut alloc = Allocator::<ReadWrite>::new();
        let a = alloc.allocate(16, &[1, 2, 3, 4]);
        let bytes = unsafe { a.as_ptr().as_ref() };
        assert_eq!(bytes, &[1, 2, 3, 4]);
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn reuses_released_memory() {
        let mut alloc = Allocator::<ReadWrite>::new();
        let a = alloc.allocate(64, &[0xAA; 128]);
        let _b = alloc.allocate(64, &[0xBB; 128]);
        let a_ptr = unsafe { a.as_ptr() }.cast::<u8>();

        unsafe { alloc.release(a) };
        assert_eq!(alloc.released_bytes(), 128);

        let c = alloc.allocate(64, &[0xCC; 100]);
        assert_eq!(unsafe { c.as_ptr() }.cast::<u8>(), a_ptr);
        assert_eq!(alloc.released_bytes(), 28);
    }

    #[test]
    fn coalesces_neighbours() {
        let mut alloc = Allocator::<ReadWrite>::new();
        let a = alloc.allocate(1, &[1; 32]);
        let b = alloc.allocate(1, &[2; 32]);
        let c = alloc.allocate(1, &[3; 32]);

        unsafe {
            alloc.release(a);
            alloc.release(c);
            alloc.release(b);
        }

        assert_eq!(alloc.free.len(), 1);
        assert_eq!(alloc.released_bytes(), 96);
    }

    #[test]
    fn chunks_of_contiguous_regions_stay_apart() {
        let mut alloc = Allocator::<ReadWrite>::new();

        // split one mapping in two, so the regions are contiguous
        let mapping = Region::new(None, 2 * REGION_MIN_LEN);
        let half = mapping.len / 2;
        let first = Region {
            ptr: mapping.ptr,
            len: half,
        };
        let second = Region {
            ptr: unsafe { mapping.ptr.add(half) },
            len: mapping.len - half,
        };
        alloc.regions.extend([first, second]);
        alloc.offset = 64;

        let tail = unsafe { first.ptr.add(first.len - 64) };
        let head = second.ptr;
        unsafe {
            alloc.release(Allocation(
                NonNull::slice_from_raw_parts(NonNull::new(tail).unwrap(), 64),
                PhantomData,
            ));
            alloc.release(Allocation(
                NonNull::slice_from_raw_parts(NonNull::new(head).unwrap(), 64),
                PhantomData,
            ));
        }

        assert_eq!(alloc.free.len(), 2);
        assert_eq!(alloc.released_bytes(), 128);

        // too big for either chunk, so it must come from the bump region
        let c = alloc.allocate(1, &[9; 128]);
        let c_ptr = unsafe { c.as_ptr() }.cast::<u8>().as_ptr();
        assert_eq!(c_ptr, unsafe { second.ptr.add(64) });
        assert!(unsafe { c.as_ptr().as_ref() }.iter().all(|&x| x == 9));
        assert_eq!(alloc.free.len(), 2);
    }

    #[test]
    fn grows_past_region() {
        let mut alloc = Allocator::<ReadWrite>::new();
        let big = vec![7u8; REGION_MIN_LEN];
        let a = alloc.allocate(1, &big);
        let b = alloc.allocate(1, &big);

        let a = unsafe { a.as_ptr().as_ref() };
        let b = unsafe { b.as_ptr().as_ref() };
        assert!(a.iter().chain(b).all(|&x| x == 7));
    }
}
