//! The placement engine: first-fit allocation with high-end splits,
//! and release with coalescing into both neighbours.  One `Heap` owns
//! the free list and the growth adapter for one backing segment.
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

use std::cmp;
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_heap_walk;

use crate::chunk::Chunk;
use crate::fence::checked_round_up;
use crate::fence::Fence;
use crate::fence::ALIGNMENT;
use crate::fence::FENCE;
use crate::fence::MIN_CHUNK;
use crate::fence::NODE;
use crate::freelist::FreeList;
use crate::growth::Growth;
use crate::source::BreakSource;

/// One allocator instance over one contiguous, growable extent.
///
/// The process-wide allocator in `global` is exactly one of these
/// behind a mutex; private instances over an `ArenaSource` are how the
/// tests run without touching the program break.
pub struct Heap<'a> {
    growth: Growth<'a>,
    free: FreeList,
}

// A `Heap` is raw pointers into its backing segment, but they are only
// ever dereferenced through `&mut self`, so handing the whole value to
// another thread is sound.
unsafe impl<'a> Send for Heap<'a> {}

impl<'a> Heap<'a> {
    pub fn new(source: &'a dyn BreakSource) -> Heap<'a> {
        Heap {
            growth: Growth::new(source),
            free: FreeList::new(),
        }
    }

    /// Builds a heap over the registered source `name`, or over the
    /// program break if `name` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no source goes by `name`.
    pub fn from_source_name(name: Option<&str>) -> Result<Heap<'static>, &'static str> {
        Ok(Heap::new(crate::source::get_break_source(name)?))
    }

    /// Total bytes obtained from the backing source so far.
    pub fn footprint(&self) -> usize {
        self.growth.delivered()
    }

    /// Only used for tests and contracts.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn growth(&self) -> &Growth<'a> {
        &self.growth
    }

    /// Only used for tests and contracts.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn free(&self) -> &FreeList {
        &self.free
    }

    /// The chunk size that can host an `n`-byte payload: fences
    /// included, never smaller than what a free node needs, aligned.
    fn request_size(n: usize) -> Option<usize> {
        checked_round_up(
            cmp::max(n, NODE - FENCE).checked_add(2 * FENCE)?,
            ALIGNMENT,
        )
    }

    /// Attempts to return a payload of at least `n` bytes.
    #[ensures(debug_heap_walk::check(self).is_ok(),
              "Heap invariants hold after allocation")]
    #[ensures(ret.is_some() -> ret.unwrap().as_ptr() as usize % ALIGNMENT == 0,
              "Payloads are aligned")]
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<c_void>> {
        let req = Self::request_size(n)?;

        unsafe {
            let fit = match self.free.first_fit(req) {
                Some(fit) => fit,
                None => {
                    let grown = self.growth.grow(req).ok()?;
                    self.free.insert_by_address(grown);
                    grown
                }
            };

            Some(self.place(fit, req).payload())
        }
    }

    /// Carves `req` bytes from the low end of `fit`.  A remainder
    /// worth keeping becomes a free chunk in `fit`'s list slot;
    /// otherwise the caller gets the whole chunk.
    unsafe fn place(&mut self, fit: Chunk, req: usize) -> Chunk {
        let total = fit.size();

        if total - req >= MIN_CHUNK {
            let rest = Chunk::from_addr(fit.addr() + req);

            rest.set_fences(Fence::free(total - req));
            self.free.replace(fit, rest);
            fit.set_fences(Fence::used(req));
        } else {
            self.free.remove(fit);
            fit.set_fences(Fence::used(total));
        }

        fit
    }

    /// Returns `payload` to the pool and fuses it with any free
    /// neighbour.
    ///
    /// # Safety
    ///
    /// `payload` must have come from this heap's `allocate`,
    /// `zero_allocate` or `resize`, and must not have been released
    /// since.
    pub unsafe fn release(&mut self, payload: NonNull<c_void>) {
        self.reclaim(payload)
    }

    #[requires(debug_heap_walk::is_live_payload(self, payload).is_ok(),
               "Released payloads are live allocations of this heap")]
    #[ensures(debug_heap_walk::check(self).is_ok(),
              "Heap invariants hold after release")]
    fn reclaim(&mut self, payload: NonNull<c_void>) {
        unsafe {
            let chunk = Chunk::from_payload(payload);

            chunk.set_fences(Fence::free(chunk.size()));
            self.free.insert_by_address(chunk);

            let chunk = self.fuse_up(chunk);
            self.fuse_down(chunk);
        }
    }

    /// Merges `chunk` into its lower neighbour if that one is free.
    /// Both sentinels read as used, so fusion stops at the heap
    /// boundary on its own.
    unsafe fn fuse_up(&mut self, chunk: Chunk) -> Chunk {
        if chunk.fence_before().is_used() {
            return chunk;
        }

        let into = chunk.chunk_before();

        self.free.remove(chunk);
        into.set_fences(Fence::free(into.size() + chunk.size()));

        into
    }

    /// Merges the upper neighbour into `chunk` if that one is free.
    unsafe fn fuse_down(&mut self, chunk: Chunk) {
        if chunk.fence_after().is_used() {
            return;
        }

        let eaten = chunk.chunk_after();

        self.free.remove(eaten);
        chunk.set_fences(Fence::free(chunk.size() + eaten.size()));
    }

    /// `allocate(count * size)` with a zero-filled payload, or `None`
    /// when the product overflows.
    ///
    /// Only the requested `count * size` bytes are zeroed; padding up
    /// to the chunk's capacity stays indeterminate.
    #[ensures(debug_heap_walk::check(self).is_ok(),
              "Heap invariants hold after allocation")]
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<c_void>> {
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;

        unsafe { ptr::write_bytes(payload.as_ptr() as *mut u8, 0, total) };

        Some(payload)
    }

    /// Grows or shrinks an allocation to `n` bytes.
    ///
    /// `None` for the payload allocates; `n == 0` releases and returns
    /// `None`; a chunk that already has the capacity keeps its payload
    /// unchanged; otherwise the contents move to a fresh allocation
    /// and the old payload is released.  When the fresh allocation
    /// fails, the original stays intact and `None` is returned.
    ///
    /// # Safety
    ///
    /// A non-`None` `payload` must be a live allocation of this heap.
    pub unsafe fn resize(
        &mut self,
        payload: Option<NonNull<c_void>>,
        n: usize,
    ) -> Option<NonNull<c_void>> {
        self.reallocate(payload, n)
    }

    #[ensures(debug_heap_walk::check(self).is_ok(),
              "Heap invariants hold after resize")]
    fn reallocate(
        &mut self,
        payload: Option<NonNull<c_void>>,
        n: usize,
    ) -> Option<NonNull<c_void>> {
        let payload = match payload {
            None => return self.allocate(n),
            Some(payload) => payload,
        };

        if n == 0 {
            self.reclaim(payload);
            return None;
        }

        let capacity = unsafe { Chunk::from_payload(payload).capacity() };

        if capacity >= n {
            return Some(payload);
        }

        let fresh = self.allocate(n)?;

        unsafe {
            ptr::copy_nonoverlapping(
                payload.as_ptr() as *const u8,
                fresh.as_ptr() as *mut u8,
                cmp::min(n, capacity),
            );
        }
        self.reclaim(payload);

        Some(fresh)
    }
}

impl<'a> fmt::Debug for Heap<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut used_chunks = 0usize;
        let mut free_chunks = 0usize;
        let mut free_bytes = 0usize;

        if self.growth.is_grown() {
            let mut cursor = self.growth.low_fence() + FENCE;

            while cursor < self.growth.high_fence() {
                let header = unsafe { Chunk::from_addr(cursor).header() };

                if header.is_used() {
                    used_chunks += 1;
                } else {
                    free_chunks += 1;
                    free_bytes += header.size();
                }

                cursor += header.size();
            }
        }

        f.debug_struct("Heap")
            .field("footprint", &self.footprint())
            .field("used_chunks", &used_chunks)
            .field("free_chunks", &free_chunks)
            .field("free_bytes", &free_bytes)
            .finish()
    }
}

// The tests lean on `debug_heap_walk`, which only exists when
// contract checking is compiled in.
#[cfg(test)]
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod test {
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::ffi::c_void;
    use std::ptr::NonNull;

    use super::Heap;
    use crate::arena_source::ArenaSource;
    use crate::debug_heap_walk;
    use crate::fence::ALIGNMENT;
    use crate::fence::FENCE;

    fn fill(payload: NonNull<c_void>, len: usize, byte: u8) {
        unsafe { std::ptr::write_bytes(payload.as_ptr() as *mut u8, byte, len) };
    }

    fn is_filled(payload: NonNull<c_void>, len: usize, byte: u8) -> bool {
        let bytes = unsafe { std::slice::from_raw_parts(payload.as_ptr() as *const u8, len) };

        bytes.iter().all(|&b| b == byte)
    }

    #[test]
    fn virgin_heap_first_allocation() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let payload = heap.allocate(1).expect("Should allocate");
        assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);

        // One page came in; the walk sees the caller's chunk and the
        // remainder, nothing else.
        let stats = debug_heap_walk::check(&heap).expect("heap should be well formed");
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.used_chunks, 1);
        assert_eq!(stats.free_chunks, 1);

        unsafe { heap.release(payload) };
    }

    #[test]
    fn first_fit_returns_the_lowest_hole() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let p = heap.allocate(32).expect("Should allocate");
        let q = heap.allocate(32).expect("Should allocate");

        unsafe { heap.release(p) };

        let r = heap.allocate(32).expect("Should allocate");
        assert_eq!(r, p);

        unsafe {
            heap.release(q);
            heap.release(r);
        }
    }

    #[test]
    fn coalesced_neighbours_serve_a_larger_request() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let a = heap.allocate(1000).expect("Should allocate");
        let b = heap.allocate(1000).expect("Should allocate");
        let footprint = heap.footprint();

        unsafe {
            heap.release(a);
            heap.release(b);
        }

        // 3000 bytes fit in the fused hole only because the two
        // releases merged with each other and with the tail remainder.
        let c = heap.allocate(3000).expect("Should allocate");
        assert_eq!(heap.footprint(), footprint);

        unsafe { heap.release(c) };
    }

    #[test]
    fn release_order_does_not_matter() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let payloads: Vec<_> = (0..8)
            .map(|_| heap.allocate(200).expect("Should allocate"))
            .collect();

        for &payload in payloads.iter().step_by(2) {
            unsafe { heap.release(payload) };
        }

        for &payload in payloads.iter().skip(1).step_by(2) {
            unsafe { heap.release(payload) };
        }

        let stats = debug_heap_walk::check(&heap).expect("heap should be well formed");
        assert_eq!(stats.used_chunks, 0);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.free_bytes, heap.footprint() - 2 * FENCE);
    }

    #[test]
    fn overflow_in_zero_allocate_never_grows() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        assert_eq!(heap.zero_allocate(usize::MAX, 2), None);
        assert_eq!(heap.footprint(), 0);
    }

    #[test]
    fn zero_allocate_clears_the_payload() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let p = heap.zero_allocate(16, 8).expect("Should allocate");
        assert!(is_filled(p, 128, 0));

        // Dirty the chunk, recycle it, and make sure the next
        // zero_allocate scrubs it again.
        fill(p, 128, 0xa5);
        unsafe { heap.release(p) };

        let q = heap.zero_allocate(16, 8).expect("Should allocate");
        assert!(is_filled(q, 128, 0));

        unsafe { heap.release(q) };
    }

    #[test]
    fn resize_of_null_allocates() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let payload = unsafe { heap.resize(None, 64) }.expect("Should allocate");
        assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);

        unsafe { heap.release(payload) };
    }

    #[test]
    fn resize_to_zero_releases() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let p = heap.allocate(64).expect("Should allocate");
        assert_eq!(unsafe { heap.resize(Some(p), 0) }, None);

        // The chunk went back to the pool: first fit hands it out
        // again.
        let q = heap.allocate(64).expect("Should allocate");
        assert_eq!(q, p);

        unsafe { heap.release(q) };
    }

    #[test]
    fn resize_within_capacity_keeps_the_payload() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        // 100 rounds up to a 112-byte capacity.
        let p = heap.allocate(100).expect("Should allocate");
        fill(p, 100, 0x17);

        let q = unsafe { heap.resize(Some(p), 112) }.expect("Should resize");
        assert_eq!(q, p);
        assert!(is_filled(q, 100, 0x17));

        unsafe { heap.release(q) };
    }

    #[test]
    fn resize_moves_and_copies() {
        let arena = ArenaSource::new(1 << 20);
        let mut heap = Heap::new(&arena);

        let p = heap.allocate(16).expect("Should allocate");
        fill(p, 16, 0x42);

        let q = unsafe { heap.resize(Some(p), 64) }.expect("Should resize");
        assert_ne!(q, p);
        assert!(is_filled(q, 16, 0x42));

        // The donor chunk was released: it is the lowest hole again.
        let r = heap.allocate(16).expect("Should allocate");
        assert_eq!(r, p);

        unsafe {
            heap.release(q);
            heap.release(r);
        }
    }

    #[test]
    fn exhausted_source_reports_out_of_memory() {
        let arena = ArenaSource::new(8192);
        let mut heap = Heap::new(&arena);

        let p = heap.allocate(4000).expect("the first page fits");
        assert_eq!(heap.allocate(100_000), None);

        // The failure left the heap consistent and the allocation
        // untouched.
        debug_heap_walk::check(&heap).expect("heap should be well formed");

        unsafe { heap.release(p) };
    }

    proptest! {
        // Allocate and release in random-ish order, re-deriving the
        // heap shape after every step and checking payload bytes
        // survive their neighbours' churn.
        #[test]
        fn random_order(actions in vec((0..20usize, 1..400usize), 1..60)) {
            let arena = ArenaSource::new(1 << 20);
            let mut heap = Heap::new(&arena);

            let mut slots: Vec<Option<(NonNull<c_void>, usize, u8)>> = vec![None; 20];

            for (step, (index, size)) in actions.iter().cloned().enumerate() {
                match slots[index].take() {
                    Some((payload, size, byte)) => {
                        prop_assert!(is_filled(payload, size, byte));
                        unsafe { heap.release(payload) };
                    }
                    None => {
                        let payload = heap.allocate(size);
                        prop_assert!(payload.is_some());

                        let payload = payload.unwrap();
                        prop_assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);

                        let byte = (step % 251) as u8;
                        fill(payload, size, byte);
                        slots[index] = Some((payload, size, byte));
                    }
                }

                prop_assert!(debug_heap_walk::check(&heap).is_ok());
            }

            for slot in slots.iter_mut() {
                if let Some((payload, _, _)) = slot.take() {
                    unsafe { heap.release(payload) };
                }
            }

            // Everything released: coalescing leaves at most one hole.
            let stats = debug_heap_walk::check(&heap).expect("heap should be well formed");
            prop_assert_eq!(stats.used_chunks, 0);
            prop_assert!(stats.free_chunks <= 1);
        }

        // Grow and shrink one allocation while a neighbour pins the
        // heap, checking the prefix survives every move.
        #[test]
        fn resize_preserves_the_prefix(sizes in vec(1..600usize, 2..30)) {
            let arena = ArenaSource::new(1 << 20);
            let mut heap = Heap::new(&arena);

            let pin = heap.allocate(32).expect("Should allocate");

            let mut size = sizes[0];
            let mut payload = heap.allocate(size).expect("Should allocate");
            fill(payload, size, 0x5a);

            for new_size in sizes.iter().cloned().skip(1) {
                let moved = unsafe { heap.resize(Some(payload), new_size) };
                prop_assert!(moved.is_some());
                payload = moved.unwrap();

                prop_assert!(is_filled(payload, size.min(new_size), 0x5a));

                fill(payload, new_size, 0x5a);
                size = new_size;

                prop_assert!(debug_heap_walk::check(&heap).is_ok());
            }

            unsafe {
                heap.release(payload);
                heap.release(pin);
            }
        }

        #[test]
        fn zero_allocate_is_zero(count in 1..64usize, size in 1..64usize) {
            let arena = ArenaSource::new(1 << 20);
            let mut heap = Heap::new(&arena);

            let payload = heap.zero_allocate(count, size).expect("Should allocate");
            prop_assert!(is_filled(payload, count * size, 0));

            unsafe { heap.release(payload) };
        }
    }
}
