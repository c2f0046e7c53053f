#![allow(clippy::cast_sign_loss)]

use std::sync::atomic::{AtomicU64, Ordering};

/// GPU page size used by the VM page tables.
pub const GPU_PAGE_SHIFT: u32 = 12;
pub const GPU_PAGE_SIZE: u64 = 1 << GPU_PAGE_SHIFT;

/// Span covered by a single page-table BO (one PDE worth of PTEs).
pub const PT_SPAN_SHIFT: u32 = 21;
pub const PT_SPAN: u64 = 1 << PT_SPAN_SHIFT;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Inclusive index range of the page-table BOs covering `[va, va + size)`.
#[must_use]
pub const fn pt_indices(va: u64, size: u64) -> (u64, u64) {
    let first = va >> PT_SPAN_SHIFT;
    let last = (va + size - 1) >> PT_SPAN_SHIFT;
    (first, last)
}

/// Whether `[a_start, a_last]` and `[b_start, b_last]` intersect (inclusive bounds).
#[must_use]
pub const fn ranges_overlap(a_start: u64, a_last: u64, b_start: u64, b_last: u64) -> bool {
    a_start <= b_last && b_start <= a_last
}

/// Host page size as reported by the OS.
#[must_use]
pub fn host_page_size() -> u64 {
    static PAGE_SIZE: AtomicU64 = AtomicU64::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let size = if ret > 0 { ret as u64 } else { 4096 };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Process-wide id source for buffer objects, VMs and allocations.
pub fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
