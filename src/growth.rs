//! The brk adapter: turns "host a chunk of at least this many bytes"
//! into page-multiple extensions of the backing segment, and maintains
//! the sentinel fences at both extremities of the heap.
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

use crate::chunk::write_fence;
use crate::chunk::Chunk;
use crate::fence::checked_round_up;
use crate::fence::Fence;
use crate::fence::FENCE;
use crate::source::BreakSource;

pub struct Growth<'a> {
    source: &'a dyn BreakSource,

    /// Cached on first growth; zero doubles as the "never grown" flag.
    page_size: usize,

    /// Addresses of the two sentinel words; zero until first growth.
    low_fence: usize,
    high_fence: usize,

    /// Total bytes ever delivered by the source.
    delivered: usize,
}

impl<'a> Growth<'a> {
    pub fn new(source: &'a dyn BreakSource) -> Growth<'a> {
        Growth {
            source,
            page_size: 0,
            low_fence: 0,
            high_fence: 0,
            delivered: 0,
        }
    }

    pub fn is_grown(&self) -> bool {
        self.page_size != 0
    }

    pub fn low_fence(&self) -> usize {
        self.low_fence
    }

    pub fn high_fence(&self) -> usize {
        self.high_fence
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Extends the heap enough to host a free chunk of at least
    /// `requested` bytes and returns that chunk, fences written, not
    /// yet on any free list.  The fresh region is exclusively ours to
    /// write: the source's contiguity and alignment contract says so.
    #[ensures(ret.is_ok() -> self.is_grown(),
              "A successful growth leaves the heap initialised")]
    pub fn grow(&mut self, requested: usize) -> Result<Chunk, i32> {
        if self.page_size == 0 {
            self.first_grow(requested)
        } else {
            self.next_grow(requested)
        }
    }

    /// First touch: queries and caches the page size, brackets the new
    /// extent with both sentinels, and hands back the interior.
    fn first_grow(&mut self, requested: usize) -> Result<Chunk, i32> {
        let page_size = self.source.page_size();
        let bytes = requested
            .checked_add(2 * FENCE)
            .and_then(|fenced| checked_round_up(fenced, page_size))
            .ok_or(libc::ENOMEM)?;
        let base = self.source.grow(bytes)?.as_ptr() as usize;

        self.page_size = page_size;
        self.low_fence = base;
        self.high_fence = base + bytes - FENCE;
        self.delivered = bytes;

        let chunk = Chunk::from_addr(base + FENCE);

        unsafe {
            write_fence(self.low_fence, Fence::SENTINEL);
            write_fence(self.high_fence, Fence::SENTINEL);
            chunk.set_fences(Fence::free(bytes - 2 * FENCE));
        }

        Ok(chunk)
    }

    /// Subsequent growths reuse the old high sentinel's slot as the
    /// new chunk's header and write a fresh sentinel at the new
    /// boundary, so the whole extension becomes chunk bytes.
    fn next_grow(&mut self, requested: usize) -> Result<Chunk, i32> {
        let bytes = checked_round_up(requested, self.page_size).ok_or(libc::ENOMEM)?;
        let base = self.source.grow(bytes)?.as_ptr() as usize;

        assert_eq!(
            base,
            self.high_fence + FENCE,
            "the backing segment moved between growths"
        );

        let chunk = Chunk::from_addr(self.high_fence);
        self.high_fence = chunk.addr() + bytes;
        self.delivered += bytes;

        unsafe {
            chunk.set_fences(Fence::free(bytes));
            write_fence(self.high_fence, Fence::SENTINEL);
        }

        Ok(chunk)
    }
}

#[cfg(test)]
mod test {
    use super::Growth;
    use crate::arena_source::ArenaSource;
    use crate::chunk::read_fence;
    use crate::fence::FENCE;

    #[test]
    fn first_growth_installs_both_sentinels() {
        let arena = ArenaSource::new(1 << 16);
        let mut growth = Growth::new(&arena);

        let chunk = growth.grow(100).expect("arena has room");

        assert!(growth.is_grown());
        assert_eq!(growth.delivered(), 4096);
        assert_eq!(chunk.addr(), growth.low_fence() + FENCE);

        unsafe {
            assert_eq!(chunk.size(), 4096 - 2 * FENCE);
            assert!(!chunk.is_used());
            assert!(read_fence(growth.low_fence()).is_sentinel());
            assert!(read_fence(growth.high_fence()).is_sentinel());
        }
    }

    #[test]
    fn later_growth_reuses_the_high_sentinel_slot() {
        let arena = ArenaSource::new(1 << 16);
        let mut growth = Growth::new(&arena);

        let first = growth.grow(100).expect("arena has room");
        let old_high = growth.high_fence();
        let second = growth.grow(5000).expect("arena has room");

        assert_eq!(second.addr(), old_high);
        assert_eq!(growth.delivered(), 4096 + 8192);
        assert_eq!(growth.high_fence(), second.addr() + 8192);

        unsafe {
            assert_eq!(second.size(), 8192);
            assert_eq!(first.chunk_after().addr(), second.addr());
            assert!(read_fence(growth.high_fence()).is_sentinel());
        }
    }

    #[test]
    fn failed_growth_reports_no_memory() {
        let arena = ArenaSource::new(4096);
        let mut growth = Growth::new(&arena);

        growth.grow(64).expect("the first page fits");
        assert_eq!(growth.grow(64), Err(libc::ENOMEM));
    }
}
