//! A `BreakSource` drawn from a fixed in-process buffer.  This is the
//! source to use when the real program break must not move: sandboxed
//! embeddings, and every test in this crate.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::fence::round_up;
use crate::fence::ALIGNMENT;
use crate::source::BreakSource;

/// The growth granularity an arena emulates.
const ARENA_PAGE_SIZE: usize = 4096;

/// A bump-the-offset segment over one owned buffer.  Regions are
/// handed out low to high and never reclaimed individually, exactly
/// like the data segment under the break primitive.
#[derive(Debug)]
pub struct ArenaSource {
    base: usize,
    capacity: usize,
    next: AtomicUsize,
    raw: *mut u8,
    raw_len: usize,
}

// The bump offset is atomic, and the buffer bytes are only ever
// written through the regions handed out to a single heap.
unsafe impl Send for ArenaSource {}
unsafe impl Sync for ArenaSource {}

impl ArenaSource {
    /// Builds an arena able to deliver `capacity` bytes, rounded up to
    /// a whole number of pages.
    pub fn new(capacity: usize) -> ArenaSource {
        let capacity = round_up(capacity.max(ARENA_PAGE_SIZE), ARENA_PAGE_SIZE);
        let raw_len = capacity + ALIGNMENT;
        let raw = Box::into_raw(vec![0u8; raw_len].into_boxed_slice()) as *mut u8;

        ArenaSource {
            base: round_up(raw as usize, ALIGNMENT),
            capacity,
            next: AtomicUsize::new(0),
            raw,
            raw_len,
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.capacity - self.next.load(Ordering::Relaxed)
    }
}

impl Drop for ArenaSource {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.raw, self.raw_len))) };
    }
}

#[contract_trait]
impl BreakSource for ArenaSource {
    fn page_size(&self) -> usize {
        ARENA_PAGE_SIZE
    }

    fn grow(&self, bytes: usize) -> Result<NonNull<c_void>, i32> {
        let offset = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                next.checked_add(bytes).filter(|&end| end <= self.capacity)
            })
            .map_err(|_| libc::ENOMEM)?;

        Ok(NonNull::new((self.base + offset) as *mut c_void)
            .expect("arena regions are never null"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regions_are_contiguous_and_aligned() {
        let arena = ArenaSource::new(1 << 16);

        let first = arena.grow(4096).expect("arena has room");
        let second = arena.grow(8192).expect("arena has room");

        assert_eq!(first.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 4096);
        assert_eq!(arena.remaining(), (1 << 16) - 4096 - 8192);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let arena = ArenaSource::new(8192);

        arena.grow(8192).expect("arena has room");
        assert_eq!(arena.grow(4096), Err(libc::ENOMEM));
    }

    #[test]
    fn capacity_rounds_up_to_pages() {
        let arena = ArenaSource::new(1);

        assert_eq!(arena.remaining(), ARENA_PAGE_SIZE);
    }
}
