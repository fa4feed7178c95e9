#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use unix::hugepage_hint;
#[cfg(windows)]
pub use windows::hugepage_hint;
