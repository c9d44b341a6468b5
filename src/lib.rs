//! Breakwater is a first-fit, boundary-tagged heap allocator that
//! grows by raising the program break, behind the classical
//! malloc/free/calloc/realloc entry points.  One process-wide mutex
//! serialises every entry point; callers may be arbitrary threads.
mod arena_source;
mod chunk;
mod fence;
mod freelist;
mod global;
mod growth;
mod heap;
mod source;
mod sys;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_heap_walk;

use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

pub use arena_source::ArenaSource;
pub use global::allocate;
pub use global::release;
pub use global::resize;
pub use global::zero_allocate;
pub use heap::Heap;
pub use source::register_break_source;
pub use source::BreakSource;

/// Returns at least `size` bytes of 16-byte-aligned memory, or NULL
/// with `errno` set to `ENOMEM`.
#[no_mangle]
pub extern "C" fn breakwater_allocate(size: usize) -> *mut c_void {
    match global::allocate(size) {
        Some(payload) => payload.as_ptr(),
        None => {
            sys::set_no_memory();
            ptr::null_mut()
        }
    }
}

/// Returns `ptr` to the pool; NULL is a no-op.
///
/// # Safety
///
/// `ptr` is NULL or a live allocation returned by a breakwater entry
/// point.
#[no_mangle]
pub unsafe extern "C" fn breakwater_release(ptr: *mut c_void) {
    if let Some(payload) = NonNull::new(ptr) {
        global::release(payload);
    }
}

/// Returns `count * size` zero-filled bytes, or NULL with `errno` set
/// to `ENOMEM` on overflow or exhaustion.
#[no_mangle]
pub extern "C" fn breakwater_zero_allocate(count: usize, size: usize) -> *mut c_void {
    match global::zero_allocate(count, size) {
        Some(payload) => payload.as_ptr(),
        None => {
            sys::set_no_memory();
            ptr::null_mut()
        }
    }
}

/// Resizes `ptr` to `size` bytes: NULL allocates, size zero releases
/// and returns NULL, and on allocation failure the original stays
/// intact and NULL comes back with `errno` set.
///
/// # Safety
///
/// `ptr` is NULL or a live allocation returned by a breakwater entry
/// point.
#[no_mangle]
pub unsafe extern "C" fn breakwater_resize(ptr: *mut c_void, size: usize) -> *mut c_void {
    match global::resize(NonNull::new(ptr), size) {
        Some(payload) => payload.as_ptr(),
        None => {
            if size != 0 {
                sys::set_no_memory();
            }

            ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn c_entry_points_round_trip() {
        let p = breakwater_allocate(24);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);

        unsafe { std::ptr::write_bytes(p as *mut u8, 7, 24) };

        let q = unsafe { breakwater_resize(p, 2000) };
        assert!(!q.is_null());

        let bytes = unsafe { std::slice::from_raw_parts(q as *const u8, 24) };
        assert!(bytes.iter().all(|&b| b == 7));

        let z = breakwater_zero_allocate(4, 8);
        assert!(!z.is_null());

        let zeroes = unsafe { std::slice::from_raw_parts(z as *const u8, 32) };
        assert!(zeroes.iter().all(|&b| b == 0));

        unsafe {
            breakwater_release(z);
            assert!(breakwater_resize(q, 0).is_null());
            breakwater_release(std::ptr::null_mut());
        }
    }

    #[test]
    fn overflowing_zero_allocate_returns_null() {
        assert!(breakwater_zero_allocate(usize::MAX, 2).is_null());
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ENOMEM)
        );
    }
}
