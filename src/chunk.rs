//! A typed handle over one chunk of heap.  All raw reads and writes of
//! fence words and free-list links happen here, so the rest of the
//! crate never touches byte offsets directly.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::fence::Fence;
use crate::fence::FENCE;
use crate::fence::WORD;

/// One contiguous unit of heap accounting, addressed by its header
/// fence.  Copying the handle copies an address, never the chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Chunk(NonNull<u8>);

impl Chunk {
    pub fn from_addr(addr: usize) -> Chunk {
        Chunk(NonNull::new(addr as *mut u8).expect("chunk addresses are never null"))
    }

    /// Recovers the handle for the chunk behind a payload pointer: the
    /// header fence sits one word before the payload.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by `Chunk::payload`.
    pub unsafe fn from_payload(payload: NonNull<c_void>) -> Chunk {
        Chunk::from_addr(payload.as_ptr() as usize - FENCE)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub unsafe fn header(self) -> Fence {
        read_fence(self.addr())
    }

    pub unsafe fn size(self) -> usize {
        self.header().size()
    }

    /// Only used for tests and contracts.
    #[cfg(any(test, feature = "check_contracts"))]
    pub unsafe fn is_used(self) -> bool {
        self.header().is_used()
    }

    /// Only used for tests and contracts.
    #[cfg(any(test, feature = "check_contracts"))]
    pub unsafe fn footer(self) -> Fence {
        read_fence(self.addr() + self.size() - WORD)
    }

    /// Writes `fence` to both ends of the chunk it describes.
    pub unsafe fn set_fences(self, fence: Fence) {
        write_fence(self.addr(), fence);
        write_fence(self.addr() + fence.size() - WORD, fence);
    }

    /// The caller-visible region, one word past the header.
    pub fn payload(self) -> NonNull<c_void> {
        NonNull::new((self.addr() + FENCE) as *mut c_void).expect("payloads are never null")
    }

    /// Caller-usable bytes: everything between the two fences.
    pub unsafe fn capacity(self) -> usize {
        self.size() - 2 * FENCE
    }

    /// The fence word immediately after this chunk: the next chunk's
    /// header, or the high sentinel.
    pub unsafe fn fence_after(self) -> Fence {
        read_fence(self.addr() + self.size())
    }

    /// The fence word immediately before this chunk: the previous
    /// chunk's footer, or the low sentinel.
    pub unsafe fn fence_before(self) -> Fence {
        read_fence(self.addr() - WORD)
    }

    pub unsafe fn chunk_after(self) -> Chunk {
        Chunk::from_addr(self.addr() + self.size())
    }

    /// Only meaningful when `fence_before` is a real footer.
    pub unsafe fn chunk_before(self) -> Chunk {
        Chunk::from_addr(self.addr() - self.fence_before().size())
    }

    // While a chunk is free, the first two payload words hold the
    // addresses of its free-list neighbours; zero encodes "none".

    pub unsafe fn link_prev(self) -> Option<Chunk> {
        read_link(self.addr() + FENCE)
    }

    pub unsafe fn link_next(self) -> Option<Chunk> {
        read_link(self.addr() + FENCE + WORD)
    }

    pub unsafe fn set_link_prev(self, link: Option<Chunk>) {
        write_link(self.addr() + FENCE, link)
    }

    pub unsafe fn set_link_next(self, link: Option<Chunk>) {
        write_link(self.addr() + FENCE + WORD, link)
    }
}

pub(crate) unsafe fn read_fence(addr: usize) -> Fence {
    Fence::from_raw(*(addr as *const usize))
}

pub(crate) unsafe fn write_fence(addr: usize, fence: Fence) {
    *(addr as *mut usize) = fence.raw();
}

unsafe fn read_link(addr: usize) -> Option<Chunk> {
    match *(addr as *const usize) {
        0 => None,
        raw => Some(Chunk::from_addr(raw)),
    }
}

unsafe fn write_link(addr: usize, link: Option<Chunk>) {
    *(addr as *mut usize) = link.map_or(0, Chunk::addr);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fence::MIN_CHUNK;

    #[test]
    fn fences_agree_at_both_ends() {
        let mut buffer = [0usize; 8];
        let chunk = Chunk::from_addr(buffer.as_mut_ptr() as usize);

        unsafe {
            chunk.set_fences(Fence::used(2 * MIN_CHUNK));

            assert_eq!(chunk.header(), chunk.footer());
            assert_eq!(chunk.size(), 2 * MIN_CHUNK);
            assert!(chunk.is_used());
            assert_eq!(chunk.capacity(), 2 * MIN_CHUNK - 2 * FENCE);
        }
    }

    #[test]
    fn payload_round_trip() {
        let mut buffer = [0usize; 4];
        let chunk = Chunk::from_addr(buffer.as_mut_ptr() as usize);

        unsafe { chunk.set_fences(Fence::free(MIN_CHUNK)) };

        let payload = chunk.payload();
        assert_eq!(payload.as_ptr() as usize, chunk.addr() + FENCE);
        assert_eq!(unsafe { Chunk::from_payload(payload) }, chunk);
    }

    #[test]
    fn neighbour_traversal() {
        let mut buffer = [0usize; 8];
        let low = Chunk::from_addr(buffer.as_mut_ptr() as usize);

        unsafe {
            low.set_fences(Fence::used(MIN_CHUNK));
            let high = low.chunk_after();
            high.set_fences(Fence::free(MIN_CHUNK));

            assert_eq!(high.addr(), low.addr() + MIN_CHUNK);
            assert_eq!(high.fence_before(), low.footer());
            assert_eq!(high.chunk_before(), low);
            assert_eq!(low.fence_after(), high.header());
        }
    }

    #[test]
    fn links_store_none_as_zero() {
        let mut buffer = [0usize; 8];
        let chunk = Chunk::from_addr(buffer.as_mut_ptr() as usize);
        let other = Chunk::from_addr(buffer.as_mut_ptr() as usize + MIN_CHUNK);

        unsafe {
            chunk.set_fences(Fence::free(MIN_CHUNK));
            chunk.set_link_prev(None);
            chunk.set_link_next(Some(other));

            assert_eq!(chunk.link_prev(), None);
            assert_eq!(chunk.link_next(), Some(other));
        }
    }
}
