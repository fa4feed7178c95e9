//! Windows stubs for platform memory hints

/// Large-page backing on Windows needs SeLockMemoryPrivilege and a
/// dedicated VirtualAlloc path; not worth it for one 2 MiB region.
pub fn hugepage_hint(addr: *mut u8, len: usize) {
    let _ = (addr, len);
}
