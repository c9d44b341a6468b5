//! The process-wide allocator: one `Heap` behind one mutex, created
//! lazily on first use and never torn down.  Every entry point runs
//! start to finish under the lock, so callers observe them in lock
//! acquisition order.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::heap::Heap;

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<Heap<'static>> = Mutex::new(make_global_heap());
}

#[cfg(not(test))]
fn make_global_heap() -> Heap<'static> {
    Heap::from_source_name(None).expect("the default break source always exists")
}

// The test build's global heap draws from a private arena, so the
// suite never moves the real program break.
#[cfg(test)]
fn make_global_heap() -> Heap<'static> {
    use crate::arena_source::ArenaSource;

    Heap::new(Box::leak(Box::new(ArenaSource::new(1 << 22))))
}

fn lock() -> MutexGuard<'static, Heap<'static>> {
    GLOBAL.lock().unwrap()
}

/// Attempts to return a payload of at least `n` bytes from the
/// process-wide heap.
#[inline]
pub fn allocate(n: usize) -> Option<NonNull<c_void>> {
    lock().allocate(n)
}

/// Returns a payload to the process-wide heap.
///
/// # Safety
///
/// `payload` must be a live allocation of the process-wide heap.
#[inline]
pub unsafe fn release(payload: NonNull<c_void>) {
    lock().release(payload)
}

/// `allocate(count * size)` with a zero-filled payload, or `None`
/// when the product overflows.
#[inline]
pub fn zero_allocate(count: usize, size: usize) -> Option<NonNull<c_void>> {
    lock().zero_allocate(count, size)
}

/// Grows or shrinks an allocation of the process-wide heap.
///
/// # Safety
///
/// A non-`None` `payload` must be a live allocation of the
/// process-wide heap.
#[inline]
pub unsafe fn resize(payload: Option<NonNull<c_void>>, n: usize) -> Option<NonNull<c_void>> {
    lock().resize(payload, n)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smoke_test() {
        let p0 = allocate(8).expect("Should allocate");
        let p1 = allocate(8).expect("Should allocate");

        unsafe { release(p0) };

        let p2 = allocate(8).expect("Should allocate");

        unsafe {
            release(p2);
            release(p1);
        }
    }

    // Hammer the global heap from several threads; the mutex makes
    // every entry point atomic, so each thread's bytes stay its own.
    #[test]
    fn concurrent_mutators() {
        let threads: Vec<_> = (0..4)
            .map(|t: usize| {
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let size = 1 + (t * 37 + i * 13) % 300;
                        let payload = allocate(size).expect("Should allocate");

                        unsafe {
                            std::ptr::write_bytes(payload.as_ptr() as *mut u8, t as u8, size)
                        };

                        let bytes = unsafe {
                            std::slice::from_raw_parts(payload.as_ptr() as *const u8, size)
                        };
                        assert!(bytes.iter().all(|&b| b == t as u8));

                        unsafe { release(payload) };
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().expect("worker should not panic");
        }
    }

    #[test]
    fn resize_round_trip() {
        let payload = allocate(40).expect("Should allocate");

        unsafe {
            std::ptr::write_bytes(payload.as_ptr() as *mut u8, 9, 40);

            let grown = resize(Some(payload), 4000).expect("Should resize");
            let bytes = std::slice::from_raw_parts(grown.as_ptr() as *const u8, 40);
            assert!(bytes.iter().all(|&b| b == 9));

            assert_eq!(resize(Some(grown), 0), None);
        }
    }
}
