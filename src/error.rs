//! Error kinds emitted by the slab allocator (spec §7).
//!
//! Every variant corresponds to one of the `goto` labels in the original
//! `ngx_slab_free_locked`/`ngx_slab_alloc_locked` plus the OS-level mapping
//! failures this crate adds on top. All of them are "absorbed" errors: the
//! allocator logs and returns one of these to the caller, it never aborts
//! the process.

use core::fmt;

/// Corruption and resource-exhaustion conditions the allocator can report.
///
/// `alloc` returning `OutOfMemory` is the only variant that indicates no
/// caller bug occurred; every other variant indicates the caller passed the
/// allocator an address it did not hand out, or handed it back twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// No free run of pages was large enough to satisfy the request.
    OutOfMemory { pages_requested: u32 },
    /// `free`'s address lies outside `[data_start, data_end)`.
    OutsidePool { addr: usize },
    /// `free`'s address is not aligned to the size class its descriptor
    /// implies.
    WrongChunk { addr: usize, expected_align: usize },
    /// The bitmap bit for this address was already clear.
    DoubleFree { addr: usize },
    /// `free`'s address points into the interior of a multi-page run.
    WrongPage { addr: usize },
    /// `free`'s page-granularity address names a descriptor that is
    /// already on the free-run list.
    PageAlreadyFree { addr: usize },
    /// The region could not be mapped or sized as requested.
    RegionInit(&'static str),
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SlabError::OutOfMemory { pages_requested } => {
                write!(f, "slab alloc() failed: no memory for {} page(s)", pages_requested)
            }
            SlabError::OutsidePool { addr } => {
                write!(f, "slab free(): 0x{:x} is outside of pool", addr)
            }
            SlabError::WrongChunk { addr, expected_align } => {
                write!(
                    f,
                    "slab free(): 0x{:x} is not aligned to {} (pointer to wrong chunk)",
                    addr, expected_align
                )
            }
            SlabError::DoubleFree { addr } => {
                write!(f, "slab free(): chunk at 0x{:x} is already free", addr)
            }
            SlabError::WrongPage { addr } => {
                write!(f, "slab free(): 0x{:x} points into a run continuation page", addr)
            }
            SlabError::PageAlreadyFree { addr } => {
                write!(f, "slab free(): page at 0x{:x} is already free", addr)
            }
            SlabError::RegionInit(msg) => write!(f, "slab region init failed: {}", msg),
        }
    }
}

impl std::error::Error for SlabError {}

/// Writes `err` through the `log` facade at the severity spec.md §7
/// assigns it (CRIT for out-of-memory, ALERT for everything else), with
/// `label` as a prefix so multiple pools in one process stay distinguishable
/// in the log stream (the analogue of nginx's `pool->log_ctx`).
pub(crate) fn log_error(label: &str, err: &SlabError) {
    match err {
        SlabError::OutOfMemory { .. } => log::error!("[{}] {}", label, err),
        SlabError::RegionInit(_) => log::error!("[{}] {}", label, err),
        _ => log::warn!("[{}] {}", label, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_address() {
        let e = SlabError::DoubleFree { addr: 0x1000 };
        assert!(format!("{}", e).contains("1000"));
    }

    #[test]
    fn out_of_memory_is_distinguishable_from_corruption() {
        let oom = SlabError::OutOfMemory { pages_requested: 4 };
        let corrupt = SlabError::WrongChunk { addr: 8, expected_align: 16 };
        assert_ne!(oom, SlabError::OutOfMemory { pages_requested: 5 });
        assert_ne!(format!("{}", oom), format!("{}", corrupt));
    }
}
