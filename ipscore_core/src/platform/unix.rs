//! Unix-specific memory hints

/// Ask the kernel to back `addr..addr+len` with transparent huge pages.
///
/// The bitmap is exactly one 2 MiB huge page; a single TLB entry covers it.
/// Purely advisory: failure (old kernel, THP disabled, non-Linux) is
/// ignored and the region stays on 4 KiB pages.
pub fn hugepage_hint(addr: *mut u8, len: usize) {
    #[cfg(target_os = "linux")]
    // SAFETY: addr points at a live, page-aligned allocation of `len` bytes
    // owned by the caller; MADV_HUGEPAGE does not alter its contents.
    unsafe {
        let _ = libc::madvise(addr as *mut libc::c_void, len, libc::MADV_HUGEPAGE);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (addr, len);
    }
}
