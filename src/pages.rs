//! Page-run allocator: a doubly-linked free list of whole data pages (spec
//! §4.2).
//!
//! Grounded line-for-line on `ngx_slab_alloc_pages`/`ngx_slab_free_pages`
//! in `examples/original_source/src/core/ngx_slab.c`: first-fit scan,
//! split-on-allocate with the tail remaining free, LIFO insert-at-head on
//! free, and, deliberately, no coalescing of adjacent free runs (spec
//! §9's Open Question; see the doc comment on `free_pages`).

use crate::descriptor::{Descriptor, Link, PageIndex, RegimeTag, RUN_BUSY, RUN_START_FLAG};
use crate::layout::Layout;

/// Scans the free-run list head-to-tail for the first run with `slab >=
/// pages` (first-fit, not best-fit), splits it if it is larger than
/// needed, and marks the head `pages` descriptors as an allocated run.
///
/// Returns `None` (logged by the caller as `SlabError::OutOfMemory`) if
/// no run is big enough.
pub fn alloc_pages(layout: &Layout, pages: u32) -> Option<PageIndex> {
    debug_assert!(pages > 0);
    let mut cursor = unsafe { (*layout.free_mut()).next };
    while let Link::Page(idx) = cursor {
        let d = unsafe { &mut *layout.page_mut(idx) };
        let run_len = d.slab as u32;
        if run_len >= pages {
            if run_len > pages {
                split_run(layout, idx, pages);
            } else {
                unlink(layout, Link::Page(idx));
            }
            mark_run_head(layout, idx, pages);
            return Some(idx);
        }
        cursor = d.next;
    }
    None
}

/// Splits a free run at `head` into an allocated-sized piece (claimed by
/// the caller) and a tail piece of `old_len - pages` remaining pages, which
/// stays on the free list at the same position in the list that `head`
/// occupied (its `next`/`prev` links are transplanted onto the tail).
fn split_run(layout: &Layout, head: PageIndex, pages: u32) {
    let old_len = unsafe { (*layout.page_mut(head)).slab as u32 };
    let tail = PageIndex(head.0 + pages);
    let (next, prev) = unsafe {
        let d = &*layout.page_mut(head);
        (d.next, d.prev)
    };
    unsafe {
        *layout.page_mut(tail) =
            Descriptor { slab: (old_len - pages) as usize, next, prev, tag: RegimeTag::Page };
    }
    splice_replace(layout, prev, next, Link::Page(tail));
}

/// Removes `victim` from whichever list it is currently on (free-run list
/// or a slot's partial-page list) by splicing its neighbors directly
/// together, closing the gap `victim` leaves.
pub(crate) fn unlink(layout: &Layout, victim: Link) {
    let (next, prev) = unsafe {
        let d = &*layout.link_mut(victim);
        (d.next, d.prev)
    };
    splice_out(layout, prev, next);
    unsafe {
        let d = &mut *layout.link_mut(victim);
        d.next = Link::None;
        d.prev = Link::None;
    }
}

/// Closes the gap `victim` leaves: `prev.next = next`, `next.prev = prev`.
fn splice_out(layout: &Layout, prev: Link, next: Link) {
    unsafe {
        (*layout.link_mut(prev)).next = next;
        (*layout.link_mut(next)).prev = prev;
    }
}

/// Inserts `new_node` between `prev` and `next`, replacing whatever
/// previously sat there: `prev.next = new_node`, `next.prev = new_node`.
fn splice_replace(layout: &Layout, prev: Link, next: Link, new_node: Link) {
    unsafe {
        (*layout.link_mut(prev)).next = new_node;
        (*layout.link_mut(next)).prev = new_node;
    }
}

fn mark_run_head(layout: &Layout, head: PageIndex, pages: u32) {
    unsafe {
        *layout.page_mut(head) = Descriptor {
            slab: (pages as usize) | RUN_START_FLAG,
            next: Link::None,
            prev: Link::Page(head), // tag-equivalent of PAGE; see descriptor::RegimeTag::Page
            tag: RegimeTag::Page,
        };
    }
    for i in 1..pages {
        let idx = PageIndex(head.0 + i);
        unsafe {
            *layout.page_mut(idx) =
                Descriptor { slab: RUN_BUSY, next: Link::None, prev: Link::Page(head), tag: RegimeTag::Page };
        }
    }
}

/// Returns a run of `pages` pages starting at `head` to the free list.
///
/// Interior descriptors are zeroed, `head` is unlinked from whatever list
/// it was on (always the implicit "nowhere" state for an allocated run,
/// spec §3.4 invariant 2), and relinked at the **head** of the free-run
/// list (LIFO).
///
/// No coalescing of `head` with an adjacent free run is attempted, even if
/// one directly follows or precedes it in the descriptor array; this is
/// the same tradeoff `ngx_slab_free_pages` makes. Combined with first-fit
/// allocation this can fragment the address space under adversarial
/// alloc/free size patterns; the design accepts that because the expected
/// traffic is either page-sized sub-page backing (reclaimed promptly by
/// `slab::free_slot`) or stable same-size multi-page caches, neither of
/// which benefits much from coalescing. See spec.md §9's Open Question.
pub fn free_pages(layout: &Layout, head: PageIndex, pages: u32) {
    debug_assert!(pages > 0);
    for i in 1..pages {
        let idx = PageIndex(head.0 + i);
        unsafe {
            *layout.page_mut(idx) = Descriptor::empty();
        }
    }
    unsafe {
        let d = &mut *layout.page_mut(head);
        d.slab = pages as usize;
        d.tag = RegimeTag::Page;
    }
    link_at_head(layout, Link::Free, Link::Page(head));
}

/// Inserts `node` as the new head of the circular sentinel-headed list
/// `sentinel` heads (used both for the free-run list here and for a size
/// class's partial-page list in `slab`): `node.next = sentinel.next (old
/// head)`, `node.prev = sentinel`, and the old head's `prev` and the
/// sentinel's `next` are updated to point at `node`.
pub(crate) fn link_at_head(layout: &Layout, sentinel: Link, node: Link) {
    let old_head = unsafe { (*layout.link_mut(sentinel)).next };
    unsafe {
        let d = &mut *layout.link_mut(node);
        d.prev = sentinel;
        d.next = old_head;
    }
    unsafe {
        (*layout.link_mut(old_head)).prev = node;
        (*layout.link_mut(sentinel)).next = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    fn fresh_layout(npages: u32) -> Layout {
        let l = Layout::for_test(0, npages, 12);
        unsafe {
            (*l.free_mut()) = Descriptor::sentinel(Link::Free);
            *l.page_mut(PageIndex(0)) =
                Descriptor { slab: npages as usize, next: Link::Free, prev: Link::Free, tag: RegimeTag::Page };
            (*l.free_mut()).next = Link::Page(PageIndex(0));
        }
        l
    }

    #[test]
    fn alloc_then_free_single_page_returns_same_index() {
        let l = fresh_layout(4);
        let a = alloc_pages(&l, 1).unwrap();
        free_pages(&l, a, 1);
        let b = alloc_pages(&l, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn first_fit_splits_larger_run() {
        let l = fresh_layout(4);
        let a = alloc_pages(&l, 1).unwrap();
        assert_eq!(a, PageIndex(0));
        let remaining = unsafe { (*l.page_mut(PageIndex(1))).slab };
        assert_eq!(remaining, 3);
    }

    #[test]
    fn exhausting_all_pages_then_alloc_fails() {
        let l = fresh_layout(2);
        assert!(alloc_pages(&l, 2).is_some());
        assert!(alloc_pages(&l, 1).is_none());
    }

    #[test]
    fn free_links_at_head_lifo() {
        let l = fresh_layout(4);
        let a = alloc_pages(&l, 1).unwrap();
        let b = alloc_pages(&l, 1).unwrap();
        free_pages(&l, a, 1);
        free_pages(&l, b, 1);
        // b was freed last, so it must be returned first (LIFO head insert).
        let next = alloc_pages(&l, 1).unwrap();
        assert_eq!(next, b);
    }
}
