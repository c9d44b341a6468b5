//! The address-ordered, doubly linked list of free chunks.  The list
//! is threaded through the payloads of the chunks themselves: it is a
//! view over heap memory and owns nothing.
use crate::chunk::Chunk;

pub struct FreeList {
    head: Option<Chunk>,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None }
    }

    /// Only used for tests and contracts.
    #[cfg(any(test, feature = "check_contracts"))]
    pub fn head(&self) -> Option<Chunk> {
        self.head
    }

    /// Returns the first chunk whose size covers `required`, lowest
    /// address first, or `None` on exhaustion.
    pub unsafe fn first_fit(&self, required: usize) -> Option<Chunk> {
        let mut cursor = self.head;

        while let Some(chunk) = cursor {
            if chunk.size() >= required {
                return Some(chunk);
            }

            cursor = chunk.link_next();
        }

        None
    }

    /// Splices `chunk` in at the position its address dictates.  The
    /// chunk must be free, fenced, and not already listed.
    pub unsafe fn insert_by_address(&mut self, chunk: Chunk) {
        // Find the last listed chunk below the insertee.
        let mut below = None;
        let mut cursor = self.head;

        while let Some(other) = cursor {
            if other.addr() > chunk.addr() {
                break;
            }

            below = cursor;
            cursor = other.link_next();
        }

        match below {
            None => {
                chunk.set_link_prev(None);
                chunk.set_link_next(self.head);

                if let Some(old_head) = self.head {
                    old_head.set_link_prev(Some(chunk));
                }

                self.head = Some(chunk);
            }
            Some(prev) => {
                let next = prev.link_next();

                chunk.set_link_prev(Some(prev));
                chunk.set_link_next(next);
                prev.set_link_next(Some(chunk));

                if let Some(next) = next {
                    next.set_link_prev(Some(chunk));
                }
            }
        }
    }

    /// Splices a known-present chunk out.
    pub unsafe fn remove(&mut self, chunk: Chunk) {
        let prev = chunk.link_prev();
        let next = chunk.link_next();

        match prev {
            None => self.head = next,
            Some(prev) => prev.set_link_next(next),
        }

        if let Some(next) = next {
            next.set_link_prev(prev);
        }
    }

    /// Replaces `old` with `new` in place.  The caller guarantees the
    /// swap preserves address order; this is how a split leaves its
    /// remainder exactly where the donor chunk sat.
    pub unsafe fn replace(&mut self, old: Chunk, new: Chunk) {
        let prev = old.link_prev();
        let next = old.link_next();

        new.set_link_prev(prev);
        new.set_link_next(next);

        match prev {
            None => self.head = Some(new),
            Some(prev) => prev.set_link_next(Some(new)),
        }

        if let Some(next) = next {
            next.set_link_prev(Some(new));
        }
    }
}

#[cfg(test)]
mod test {
    use super::FreeList;
    use crate::chunk::Chunk;
    use crate::fence::Fence;
    use crate::fence::MIN_CHUNK;
    use crate::fence::WORD;

    // Carves free chunks of the given sizes out of a local buffer and
    // returns their handles, in address order.
    fn carve(buffer: &mut Vec<usize>, sizes: &[usize]) -> Vec<Chunk> {
        let total: usize = sizes.iter().sum();
        buffer.resize(total / WORD, 0);

        let mut addr = buffer.as_mut_ptr() as usize;
        sizes
            .iter()
            .map(|&size| {
                let chunk = Chunk::from_addr(addr);
                unsafe { chunk.set_fences(Fence::free(size)) };
                addr += size;
                chunk
            })
            .collect()
    }

    fn addresses(list: &FreeList) -> Vec<usize> {
        let mut ret = Vec::new();
        let mut cursor = list.head();

        while let Some(chunk) = cursor {
            ret.push(chunk.addr());
            cursor = unsafe { chunk.link_next() };
        }

        ret
    }

    #[test]
    fn insert_keeps_address_order() {
        let mut buffer = Vec::new();
        let chunks = carve(&mut buffer, &[MIN_CHUNK; 4]);
        let mut list = FreeList::new();

        for &i in &[2usize, 0, 3, 1] {
            unsafe { list.insert_by_address(chunks[i]) };
        }

        let expected: Vec<usize> = chunks.iter().map(|c| c.addr()).collect();
        assert_eq!(addresses(&list), expected);
    }

    #[test]
    fn remove_splices_any_position() {
        let mut buffer = Vec::new();
        let chunks = carve(&mut buffer, &[MIN_CHUNK; 4]);
        let mut list = FreeList::new();

        for &chunk in &chunks {
            unsafe { list.insert_by_address(chunk) };
        }

        unsafe { list.remove(chunks[1]) };
        assert_eq!(
            addresses(&list),
            vec![chunks[0].addr(), chunks[2].addr(), chunks[3].addr()]
        );

        unsafe { list.remove(chunks[0]) };
        assert_eq!(addresses(&list), vec![chunks[2].addr(), chunks[3].addr()]);

        unsafe { list.remove(chunks[3]) };
        assert_eq!(addresses(&list), vec![chunks[2].addr()]);

        unsafe { list.remove(chunks[2]) };
        assert!(list.head().is_none());
    }

    #[test]
    fn first_fit_takes_the_lowest_match() {
        let mut buffer = Vec::new();
        let chunks = carve(
            &mut buffer,
            &[MIN_CHUNK, MIN_CHUNK, 2 * MIN_CHUNK, MIN_CHUNK],
        );
        let mut list = FreeList::new();

        for &chunk in &chunks {
            unsafe { list.insert_by_address(chunk) };
        }

        unsafe {
            assert_eq!(list.first_fit(MIN_CHUNK), Some(chunks[0]));
            assert_eq!(list.first_fit(MIN_CHUNK + 1), Some(chunks[2]));
            assert_eq!(list.first_fit(2 * MIN_CHUNK), Some(chunks[2]));
            assert_eq!(list.first_fit(2 * MIN_CHUNK + 1), None);
        }
    }

    #[test]
    fn replace_preserves_the_neighbours() {
        let mut buffer = Vec::new();
        let chunks = carve(&mut buffer, &[MIN_CHUNK; 4]);
        let mut list = FreeList::new();

        unsafe {
            list.insert_by_address(chunks[0]);
            list.insert_by_address(chunks[1]);
            list.insert_by_address(chunks[3]);

            list.replace(chunks[1], chunks[2]);
        }

        assert_eq!(
            addresses(&list),
            vec![chunks[0].addr(), chunks[2].addr(), chunks[3].addr()]
        );

        unsafe { list.replace(chunks[0], chunks[1]) };
        assert_eq!(
            addresses(&list),
            vec![chunks[1].addr(), chunks[2].addr(), chunks[3].addr()]
        );
    }
}
