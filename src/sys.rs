//! Rust bindings for the kernel surfaces the allocator needs: the
//! program-break primitive and the page size.
use std::ffi::c_void;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Returns the current program break.
pub fn current_break() -> usize {
    unsafe { libc::sbrk(0) as usize }
}

/// Extends the program break by `size` bytes and returns the previous
/// break, i.e. the first byte of the new region.
pub fn extend_break(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && size <= isize::MAX as usize,
        "Bad growth size={}",
        size
    );

    let old = unsafe { libc::sbrk(size as libc::intptr_t) };

    if old as isize == -1 {
        Err(errno())
    } else {
        NonNull::new(old as *mut c_void).ok_or_else(errno)
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Sets the conventional process-wide error indicator to "no memory".
pub fn set_no_memory() {
    unsafe { *errno_location() = libc::ENOMEM };
}

#[cfg(target_os = "linux")]
fn errno_location() -> *mut i32 {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn errno_location() -> *mut i32 {
    unsafe { libc::__error() }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

#[test]
fn extend_break_advances_the_break() {
    let size = page_size();
    let base = extend_break(size).expect("break should extend");

    assert!(current_break() >= base.as_ptr() as usize + size);
}

#[test]
fn no_memory_indicator_is_visible() {
    set_no_memory();

    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ENOMEM)
    );
}
