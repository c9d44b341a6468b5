//! This module re-derives a heap's shape from its boundary tags and
//! cross-checks the free list against it, in debug builds.  Contract
//! expressions and tests are the only callers.
use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::chunk::read_fence;
use crate::chunk::Chunk;
use crate::fence::ALIGNMENT;
use crate::fence::FENCE;
use crate::fence::MIN_CHUNK;
use crate::heap::Heap;

/// Aggregates of one full fence walk, low sentinel to high sentinel.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub chunks: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
    pub interior_bytes: usize,
}

/// Walks every chunk between the sentinels, checks the structural
/// invariants of the heap, and confirms the free list describes
/// exactly the free chunks the walk saw.
pub fn check(heap: &Heap) -> Result<WalkStats, &'static str> {
    let growth = heap.growth();

    if !growth.is_grown() {
        if heap.free().head().is_some() {
            return Err("untouched heap with a non-empty free list");
        }

        return Ok(WalkStats::default());
    }

    let low = growth.low_fence();
    let high = growth.high_fence();

    unsafe {
        if !read_fence(low).is_sentinel() || !read_fence(high).is_sentinel() {
            return Err("missing sentinel fence");
        }

        let mut stats = WalkStats::default();
        let mut free_by_walk = Vec::new();
        let mut previous_free = false;
        let mut cursor = low + FENCE;

        while cursor < high {
            let chunk = Chunk::from_addr(cursor);
            let header = chunk.header();
            let size = header.size();

            if size < MIN_CHUNK || size % ALIGNMENT != 0 {
                return Err("chunk size out of range");
            }

            if cursor + size > high {
                return Err("chunk overruns the high sentinel");
            }

            if chunk.footer() != header {
                return Err("header and footer fences disagree");
            }

            if header.is_used() {
                stats.used_chunks += 1;
            } else {
                if previous_free {
                    return Err("two adjacent free chunks escaped coalescing");
                }

                stats.free_chunks += 1;
                stats.free_bytes += size;
                free_by_walk.push(cursor);
            }

            previous_free = !header.is_used();
            stats.chunks += 1;
            stats.interior_bytes += size;
            cursor += size;
        }

        if cursor != high {
            return Err("chunks do not tile the heap exactly");
        }

        if stats.interior_bytes + 2 * FENCE != growth.delivered() {
            return Err("chunk sizes do not add up to the delivered bytes");
        }

        // Now the list itself: sorted, back links consistent, and in
        // one-to-one correspondence with the free chunks of the walk.
        let walked: HashSet<usize> = free_by_walk.iter().cloned().collect();
        let mut listed = HashSet::new();
        let mut previous: Option<Chunk> = None;
        let mut cursor = heap.free().head();

        while let Some(chunk) = cursor {
            if chunk.header().is_used() {
                return Err("used chunk on the free list");
            }

            if chunk.link_prev().map(Chunk::addr) != previous.map(Chunk::addr) {
                return Err("free-list back link is wrong");
            }

            if let Some(previous) = previous {
                if previous.addr() >= chunk.addr() {
                    return Err("free list is not sorted by address");
                }
            }

            if !walked.contains(&chunk.addr()) {
                return Err("free-list entry is not a free chunk of the heap");
            }

            if !listed.insert(chunk.addr()) {
                return Err("free chunk listed twice");
            }

            previous = cursor;
            cursor = chunk.link_next();
        }

        if listed.len() != free_by_walk.len() {
            return Err("free chunk missing from the free list");
        }

        Ok(stats)
    }
}

/// Confirms `payload` is the caller-visible region of a used chunk of
/// this heap.
pub fn is_live_payload(heap: &Heap, payload: NonNull<c_void>) -> Result<(), &'static str> {
    let growth = heap.growth();
    let addr = payload.as_ptr() as usize;

    if !growth.is_grown() {
        return Err("payload cannot come from an untouched heap");
    }

    if addr % ALIGNMENT != 0 {
        return Err("payload is misaligned");
    }

    let target = addr - FENCE;

    unsafe {
        let mut cursor = growth.low_fence() + FENCE;

        while cursor < growth.high_fence() {
            let chunk = Chunk::from_addr(cursor);

            if cursor == target {
                return if chunk.is_used() {
                    Ok(())
                } else {
                    Err("payload's chunk is not in use")
                };
            }

            // Never step by zero.
            cursor += chunk.size().max(MIN_CHUNK);
        }
    }

    Err("payload is not a chunk of this heap")
}
