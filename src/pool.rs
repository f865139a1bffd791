//! Region layout and init (spec §4.1), and the public `init`/`alloc`/
//! `alloc_locked`/`free`/`free_locked` surface (spec §6.1).
//!
//! Grounded on `ngx_slab_init`/`ngx_slab_alloc`/`ngx_slab_alloc_locked`/
//! `ngx_slab_free`/`ngx_slab_free_locked` in
//! `examples/original_source/src/core/ngx_slab.c`: this module owns the
//! region layout decision (spec §2's four-part split) and dispatches each
//! request to `pages` (page-run sized) or `slab` (sub-page sized), exactly
//! as `ngx_slab_alloc_locked` does with its `if (size >= pool->max_size)`
//! branch.

use crate::config::PoolConfig;
use crate::descriptor::{Descriptor, Link, PageIndex, RegimeTag, SlotIndex, RUN_BUSY, RUN_START_FLAG};
use crate::error::{self, SlabError};
use crate::layout::Layout;
use crate::mutex::{ShmMutex, ShmMutexState};
use crate::pages;
use crate::region::Region;
use crate::slab;
use crate::stats::PoolStats;
use std::mem;

/// Fixed-layout prefix of the region (spec §6.2 offsets 0.. up to
/// `header_end`): the mutex state the spec places at offset 0, the tunables
/// every process must agree on, and the free-run-list sentinel (spec §2's
/// "bookkeeping pointers").
#[repr(C)]
struct PoolHeader {
    mutex: ShmMutexState,
    min_shift: u32,
    pages_total: u32,
    free: Descriptor,
}

/// A process's handle onto an initialized shared-memory pool. Carries the
/// `Region` so the mapping outlives every pointer `Layout` resolves into it.
pub struct Pool {
    region: Region,
    layout: Layout,
    mutex: ShmMutex,
    config: PoolConfig,
    stats: PoolStats,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

fn round_up(value: usize, align: usize) -> usize {
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

impl Pool {
    /// Lays out and zero-initializes a fresh region (spec §4.1): slot
    /// directory, then page-descriptor array sized by the upper-estimate
    /// `pages · (P + sizeof(descriptor)) ≤ remaining_bytes`, then the
    /// page-aligned data area with one free run spanning every page.
    ///
    /// `owner_id` identifies this process to the mutex (an OS process id);
    /// every other process that opens the same region later should call
    /// [`Pool::open`] instead, never `init` again.
    pub fn init(mut region: Region, config: PoolConfig, owner_id: usize) -> Result<Pool, SlabError> {
        let page_size = Region::os_page_size();
        let page_shift = page_size.trailing_zeros();
        if config.min_shift >= page_shift {
            return Err(SlabError::RegionInit("min_shift must be smaller than the platform page shift"));
        }
        let n_classes = page_shift - config.min_shift;

        let base = region.as_mut_ptr() as usize;
        let region_end = base + region.len();
        let header_size = round_up(mem::size_of::<PoolHeader>(), mem::align_of::<Descriptor>());
        let slot_dir_bytes = n_classes as usize * mem::size_of::<Descriptor>();

        let pages_base = base
            .checked_add(header_size)
            .and_then(|v| v.checked_add(slot_dir_bytes))
            .ok_or(SlabError::RegionInit("region too small for pool header and slot directory"))?;
        let remaining = region_end
            .checked_sub(pages_base)
            .ok_or(SlabError::RegionInit("region too small for pool header and slot directory"))?;
        let mut pages = (remaining / (page_size + mem::size_of::<Descriptor>())) as u32;
        if pages == 0 {
            return Err(SlabError::RegionInit("region too small to hold a single data page"));
        }

        let mut data_start = pages_base + pages as usize * mem::size_of::<Descriptor>();
        data_start = round_up(data_start, page_size);
        if data_start + pages as usize * page_size > region_end {
            pages -= 1;
            if pages == 0 {
                return Err(SlabError::RegionInit("region too small after data-area alignment"));
            }
        }

        let header_ptr = base as *mut PoolHeader;
        let slot_dir_ptr = (base + header_size) as *mut Descriptor;
        let page_desc_ptr = pages_base as *mut Descriptor;

        unsafe {
            ShmMutexState::init(core::ptr::addr_of_mut!((*header_ptr).mutex));
            (*header_ptr).min_shift = config.min_shift;
            (*header_ptr).pages_total = pages;
            (*header_ptr).free = Descriptor::sentinel(Link::Free);

            for i in 0..n_classes {
                *slot_dir_ptr.add(i as usize) = Descriptor::sentinel(Link::Slot(SlotIndex(i)));
            }

            // Zero the whole descriptor array first (ngx_slab_init's
            // ngx_memzero): every index must hold a valid Descriptor before
            // pages.rs is allowed to form a &mut Descriptor over it, not
            // just the one free-run head written below.
            for i in 0..pages {
                *page_desc_ptr.add(i as usize) = Descriptor::empty();
            }

            *page_desc_ptr = Descriptor {
                slab: pages as usize,
                next: Link::Free,
                prev: Link::Free,
                tag: RegimeTag::Page,
            };
            (*header_ptr).free.next = Link::Page(PageIndex(0));
        }

        let free_ptr = unsafe { core::ptr::addr_of_mut!((*header_ptr).free) };
        let layout = unsafe {
            Layout::new(slot_dir_ptr, n_classes, page_desc_ptr, pages, free_ptr, data_start, page_shift)
        };
        let mutex = unsafe { ShmMutex::create(core::ptr::addr_of_mut!((*header_ptr).mutex), owner_id) };

        Ok(Pool { region, layout, mutex, config, stats: PoolStats::new() })
    }

    /// Attaches to a region a previous `init` call already laid out,
    /// recomputing this process's own `Layout` (its pointers differ from
    /// the initializing process's whenever the region is mapped at a
    /// different base address (spec §9's Position independence).
    pub fn open(mut region: Region, log_label: impl Into<String>, owner_id: usize) -> Result<Pool, SlabError> {
        let page_size = Region::os_page_size();
        let page_shift = page_size.trailing_zeros();
        let base = region.as_mut_ptr() as usize;
        let header_ptr = base as *mut PoolHeader;
        let (min_shift, pages) = unsafe { ((*header_ptr).min_shift, (*header_ptr).pages_total) };
        let n_classes = page_shift - min_shift;

        let header_size = round_up(mem::size_of::<PoolHeader>(), mem::align_of::<Descriptor>());
        let slot_dir_ptr = (base + header_size) as *mut Descriptor;
        let slot_dir_bytes = n_classes as usize * mem::size_of::<Descriptor>();
        let page_desc_ptr = (base + header_size + slot_dir_bytes) as *mut Descriptor;
        let mut data_start = base + header_size + slot_dir_bytes + pages as usize * mem::size_of::<Descriptor>();
        data_start = round_up(data_start, page_size);

        let free_ptr = unsafe { core::ptr::addr_of_mut!((*header_ptr).free) };
        let layout = unsafe {
            Layout::new(slot_dir_ptr, n_classes, page_desc_ptr, pages, free_ptr, data_start, page_shift)
        };
        let mutex = unsafe { ShmMutex::create(core::ptr::addr_of_mut!((*header_ptr).mutex), owner_id) };
        let config = PoolConfig::new(min_shift, log_label)
            .map_err(|_| SlabError::RegionInit("region header carries an invalid min_shift"))?;

        Ok(Pool { region, layout, mutex, config, stats: PoolStats::new() })
    }

    #[inline]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Supervisor-initiated release after reaping a worker that died while
    /// holding the pool mutex (spec §4.4/§5).
    pub fn force_unlock(&self, owner: usize) -> bool {
        self.mutex.force_unlock(owner)
    }

    /// Locks internally (spec §6.1).
    pub fn alloc(&self, size: usize) -> Option<usize> {
        self.mutex.lock();
        let result = self.alloc_locked(size);
        self.mutex.unlock();
        result
    }

    /// Caller already holds the pool mutex (spec §6.1). `size == 0` is
    /// coerced up to `min_size` (spec §8's boundary case).
    pub fn alloc_locked(&self, size: usize) -> Option<usize> {
        let size = size.max(self.config.min_size());
        let max_size = slab::max_size(&self.layout);

        let (addr, pages_requested) = if size >= max_size {
            let page_size = self.layout.page_size();
            let pages_needed = ((size + page_size - 1) / page_size) as u32;
            let addr = pages::alloc_pages(&self.layout, pages_needed).map(|idx| self.layout.page_base(idx));
            if addr.is_some() {
                self.stats.record_pages_reserved(pages_needed);
            }
            (addr, pages_needed)
        } else {
            let shift = slab::shift_for_size(self.config.min_shift, size);
            let slot_index = shift - self.config.min_shift;
            let was_empty = unsafe {
                let sentinel = Link::Slot(SlotIndex(slot_index));
                (*self.layout.link_mut(sentinel)).next == sentinel
            };
            let addr = slab::alloc_slot(&self.layout, self.config.min_shift, shift);
            if addr.is_some() && was_empty {
                self.stats.record_pages_reserved(1);
            }
            (addr, 1)
        };

        self.stats.record_alloc();
        if addr.is_none() {
            self.stats.record_out_of_memory();
            error::log_error(&self.config.log_label, &SlabError::OutOfMemory { pages_requested });
        }
        addr
    }

    /// Locks internally (spec §6.1).
    pub fn free(&self, addr: usize) {
        self.mutex.lock();
        self.free_locked(addr);
        self.mutex.unlock();
    }

    /// Caller already holds the pool mutex (spec §6.1). Dispatches on the
    /// addressed page's regime tag: a `Page`-regime address frees whole
    /// pages, anything else frees one sub-page slot.
    pub fn free_locked(&self, addr: usize) {
        self.stats.record_free();
        let result = match self.layout.index_of_addr(addr) {
            None => Err(SlabError::OutsidePool { addr }),
            Some(idx) => {
                let tag = unsafe { (*self.layout.page_mut(idx)).tag };
                if tag == RegimeTag::Page {
                    self.free_page_run(idx, addr)
                } else {
                    slab::free_slot(&self.layout, self.config.min_shift, addr)
                }
            }
        };
        if let Err(err) = result {
            self.stats.record_corruption();
            error::log_error(&self.config.log_label, &err);
        }
    }

    fn free_page_run(&self, idx: PageIndex, addr: usize) -> Result<(), SlabError> {
        if addr != self.layout.page_base(idx) {
            return Err(SlabError::WrongChunk { addr, expected_align: self.layout.page_size() });
        }
        let pd = unsafe { &*self.layout.page_mut(idx) };
        let pages = pd.slab;
        if pages == RUN_BUSY {
            return Err(SlabError::WrongPage { addr });
        }
        if pages & RUN_START_FLAG == 0 {
            return Err(SlabError::PageAlreadyFree { addr });
        }
        let pages = (pages & !RUN_START_FLAG) as u32;
        pages::free_pages(&self.layout, idx, pages);
        self.stats.record_pages_released(pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(len: usize, min_shift: u32) -> Pool {
        let region = Region::anonymous(len).expect("mmap should succeed in CI sandboxes");
        let config = PoolConfig::new(min_shift, "test-pool").unwrap();
        Pool::init(region, config, 1).expect("region should be large enough to init")
    }

    #[test]
    fn alloc_then_free_single_small_block_returns_same_address() {
        let pool = test_pool(64 * 1024, 3);
        let a = pool.alloc(8).unwrap();
        pool.free(a);
        let b = pool.alloc(8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn alloc_zero_is_coerced_to_min_size() {
        let pool = test_pool(64 * 1024, 3);
        let a = pool.alloc(0).unwrap();
        let b = pool.alloc(0).unwrap();
        assert_ne!(a, b); // two distinct min_size blocks, neither null
    }

    #[test]
    fn page_run_alloc_is_page_aligned_and_free_roundtrips() {
        let pool = test_pool(64 * 1024, 3);
        let page_size = pool.layout.page_size();
        let max_size = slab::max_size(&pool.layout);
        let a = pool.alloc(max_size).unwrap();
        assert_eq!(a % page_size, 0);
        pool.free(a);
        let b = pool.alloc(max_size).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhausting_the_region_reports_out_of_memory() {
        let pool = test_pool(16 * 1024, 3);
        let mut last = None;
        for _ in 0..100_000 {
            match pool.alloc(8) {
                Some(a) => last = Some(a),
                None => break,
            }
        }
        assert!(last.is_some(), "pool should hand out at least one block before exhausting");
        assert!(pool.alloc(8).is_none());
        assert!(pool.stats().out_of_memory_count() >= 1);
    }

    #[test]
    fn freeing_an_address_outside_the_pool_is_reported_and_absorbed() {
        let pool = test_pool(64 * 1024, 3);
        let outside = pool.layout.data_end();
        pool.free(outside); // must not panic
        assert_eq!(pool.stats().corruption_count(), 1);
    }

    #[test]
    fn open_resolves_a_second_handle_against_the_same_region() {
        let region = Region::anonymous(64 * 1024).unwrap();
        let config = PoolConfig::new(3, "shared").unwrap();
        let pool = Pool::init(region, config, 1).unwrap();
        let a = pool.alloc(8).unwrap();

        // A second handle reusing the same already-initialized bytes (as a
        // forked worker would, minus the actual fork) must see the same
        // allocation and be able to free it.
        let region2 = unsafe {
            Region::from_raw_for_test(pool.region.as_ptr() as *mut u8, pool.region.len())
        };
        let pool2 = Pool::open(region2, "shared", 2).unwrap();
        pool2.free(a);
        let b = pool.alloc(8).unwrap();
        assert_eq!(a, b);
    }
}
