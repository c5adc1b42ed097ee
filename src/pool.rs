#![allow(clippy::arithmetic_side_effects)]

// buffer pool: one contiguous data region plus a header arena, a backing
// free list and the per-worker stash that readers claim from.
//
// buffers move free -> stash (refill) -> claimed (claim) -> free (release).
// the stash is refilled at least a whole frame at a time so the per-packet
// path only pops a vector.

use {
    crate::{
        buffer::{Buffer, BufferHandle},
        FRAME_SIZE,
    },
    crossbeam_channel::{Receiver, Sender},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Stashed,
    Claimed,
}

/// cumulative pool accounting. `claimed - released` is what live chains and
/// pending pre-claims hold right now.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub claimed: u64,
    pub released: u64,
    pub refills: u64,
    pub refill_shortfall: u64,
    pub rejected_releases: u64,
}

impl PoolStats {
    #[inline]
    pub fn held(&self) -> u64 {
        self.claimed - self.released
    }
}

/// cross-thread release path. a consumer that is not the owning worker sends
/// chain heads back here; the pool frees them on its next refill.
#[derive(Clone)]
pub struct Recycler {
    tx: Sender<BufferHandle>,
}

impl Recycler {
    /// hand a whole chain back to its pool
    pub fn free_chain(&self, head: BufferHandle) {
        // the pool owns the receiver for as long as any chain can exist
        let _ = self.tx.send(head);
    }
}

pub struct BufferPool {
    buffer_size: usize,
    data: Box<[u8]>,
    headers: Vec<Buffer>,
    state: Vec<SlotState>,
    free: Vec<BufferHandle>,
    stash: Vec<BufferHandle>,
    refill_batch: usize,
    recycle_tx: Sender<BufferHandle>,
    recycle_rx: Receiver<BufferHandle>,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(n_buffers: usize, buffer_size: usize) -> Self {
        Self::with_refill_batch(n_buffers, buffer_size, FRAME_SIZE)
    }

    pub fn with_refill_batch(n_buffers: usize, buffer_size: usize, refill_batch: usize) -> Self {
        assert!(buffer_size > 0, "buffer size must be non-zero");
        assert!(n_buffers <= u32::MAX as usize, "too many buffers");

        let (recycle_tx, recycle_rx) = crossbeam_channel::unbounded();

        // pop() hands out low handles first
        let free = (0..n_buffers as u32).rev().map(BufferHandle).collect();

        Self {
            buffer_size,
            data: vec![0u8; n_buffers * buffer_size].into_boxed_slice(),
            headers: vec![Buffer::default(); n_buffers],
            state: vec![SlotState::Free; n_buffers],
            free,
            stash: Vec::with_capacity(refill_batch.max(1) * 2),
            refill_batch: refill_batch.max(1),
            recycle_tx,
            recycle_rx,
            stats: PoolStats::default(),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// total number of buffers owned by the pool
    #[inline]
    pub fn capacity(&self) -> usize {
        self.headers.len()
    }

    /// buffers claimable without a refill
    #[inline]
    pub fn available(&self) -> usize {
        self.stash.len()
    }

    /// buffers left in the backing allocator
    #[inline]
    pub fn unallocated(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn recycler(&self) -> Recycler {
        Recycler {
            tx: self.recycle_tx.clone(),
        }
    }

    /// top the stash up from the backing allocator if it holds fewer than
    /// `watermark` buffers: at least one refill batch, and never less than
    /// what reaches the watermark. returns buffers added.
    pub fn refill_if_below(&mut self, watermark: usize) -> usize {
        self.reclaim_recycled();

        if self.stash.len() >= watermark {
            return 0;
        }

        let want = self.refill_batch.max(watermark - self.stash.len());
        let take = want.min(self.free.len());
        for _ in 0..take {
            let Some(bi) = self.free.pop() else { break };
            self.state[bi.index()] = SlotState::Stashed;
            self.stash.push(bi);
        }

        self.stats.refills += 1;
        if take < want {
            self.stats.refill_shortfall += 1;
            log::debug!(
                "buffer refill short: wanted {want}, got {take}, stash {}",
                self.stash.len()
            );
        }
        take
    }

    /// claim one buffer from the stash. never touches the backing allocator.
    #[inline]
    pub fn claim(&mut self) -> Option<BufferHandle> {
        let bi = self.stash.pop()?;
        self.state[bi.index()] = SlotState::Claimed;
        self.headers[bi.index()].reset();
        self.stats.claimed += 1;
        Some(bi)
    }

    /// claim up to `n` buffers, appending them to `out`. returns the count.
    pub fn claim_batch(&mut self, n: usize, out: &mut Vec<BufferHandle>) -> usize {
        let mut got = 0;
        while got < n {
            let Some(bi) = self.claim() else { break };
            out.push(bi);
            got += 1;
        }
        got
    }

    /// return a claimed buffer to the backing allocator. a handle that is
    /// not currently claimed is rejected so it can never be owned twice.
    pub fn release(&mut self, bi: BufferHandle) -> bool {
        match self.state.get(bi.index()) {
            Some(SlotState::Claimed) => {
                self.state[bi.index()] = SlotState::Free;
                self.free.push(bi);
                self.stats.released += 1;
                true
            }
            other => {
                self.stats.rejected_releases += 1;
                log::warn!("release of {bi} rejected: state {other:?}");
                false
            }
        }
    }

    /// release every segment of the chain starting at `head`
    pub fn release_chain(&mut self, head: BufferHandle) -> usize {
        let mut n = 0;
        let mut cursor = Some(head);
        while let Some(bi) = cursor {
            if self.state.get(bi.index()) != Some(&SlotState::Claimed) {
                // a broken link; stop rather than free someone else's buffer
                self.release(bi);
                break;
            }
            cursor = self.headers[bi.index()].next;
            self.release(bi);
            n += 1;
        }
        n
    }

    /// put unused pre-claimed buffers back in the stash
    pub(crate) fn unclaim(&mut self, handles: &[BufferHandle]) {
        for &bi in handles.iter().rev() {
            debug_assert_eq!(self.state[bi.index()], SlotState::Claimed);
            self.state[bi.index()] = SlotState::Stashed;
            self.stash.push(bi);
            self.stats.released += 1;
        }
    }

    fn reclaim_recycled(&mut self) {
        while let Ok(head) = self.recycle_rx.try_recv() {
            self.release_chain(head);
        }
    }

    #[inline]
    pub fn is_claimed(&self, bi: BufferHandle) -> bool {
        self.state.get(bi.index()) == Some(&SlotState::Claimed)
    }

    #[inline]
    pub fn header(&self, bi: BufferHandle) -> &Buffer {
        &self.headers[bi.index()]
    }

    #[inline]
    pub(crate) fn header_mut(&mut self, bi: BufferHandle) -> &mut Buffer {
        &mut self.headers[bi.index()]
    }

    /// valid payload of one segment
    #[inline]
    pub fn payload(&self, bi: BufferHandle) -> &[u8] {
        let b = &self.headers[bi.index()];
        let start = bi.index() * self.buffer_size + b.current_data;
        &self.data[start..start + b.current_length]
    }

    /// the whole data area of one buffer
    #[inline]
    pub(crate) fn data_mut(&mut self, bi: BufferHandle) -> &mut [u8] {
        let start = bi.index() * self.buffer_size;
        &mut self.data[start..start + self.buffer_size]
    }

    /// raw data pointer for scatter reads. the region never moves.
    #[inline]
    pub(crate) fn data_ptr(&mut self, bi: BufferHandle) -> *mut u8 {
        self.data_mut(bi).as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_needs_refill() {
        let mut pool = BufferPool::with_refill_batch(8, 128, 4);
        assert_eq!(pool.claim(), None);

        assert_eq!(pool.refill_if_below(4), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.unallocated(), 4);

        // above the watermark nothing moves
        assert_eq!(pool.refill_if_below(2), 0);
    }

    #[test]
    fn test_refill_reaches_watermark_above_batch() {
        let mut pool = BufferPool::with_refill_batch(64, 128, 4);
        assert_eq!(pool.refill_if_below(12), 12);
        assert_eq!(pool.available(), 12);
        assert_eq!(pool.stats().refill_shortfall, 0);

        let mut out = Vec::new();
        pool.claim_batch(10, &mut out);
        // two left in the stash, topped back up to the watermark
        assert_eq!(pool.refill_if_below(12), 10);
        assert_eq!(pool.available(), 12);
    }

    #[test]
    fn test_claim_batch_stops_when_empty() {
        let mut pool = BufferPool::with_refill_batch(3, 64, 8);
        pool.refill_if_below(8);

        let mut out = Vec::new();
        assert_eq!(pool.claim_batch(5, &mut out), 3);
        assert_eq!(out.len(), 3);
        assert_eq!(pool.stats().refill_shortfall, 1);
        assert_eq!(pool.claim(), None);
    }

    #[test]
    fn test_double_release_rejected() {
        let mut pool = BufferPool::with_refill_batch(2, 64, 2);
        pool.refill_if_below(2);
        let bi = pool.claim().unwrap();

        assert!(pool.release(bi));
        assert!(!pool.release(bi));
        assert_eq!(pool.stats().rejected_releases, 1);
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_unclaim_returns_to_stash() {
        let mut pool = BufferPool::with_refill_batch(4, 64, 4);
        pool.refill_if_below(4);

        let mut out = Vec::new();
        pool.claim_batch(3, &mut out);
        pool.unclaim(&out[1..]);

        assert_eq!(pool.available(), 3);
        assert_eq!(pool.stats().held(), 1);
        assert!(pool.is_claimed(out[0]));
        assert!(!pool.is_claimed(out[1]));
    }

    #[test]
    fn test_recycler_frees_on_refill() {
        let mut pool = BufferPool::with_refill_batch(2, 64, 2);
        pool.refill_if_below(2);
        let a = pool.claim().unwrap();
        let _b = pool.claim().unwrap();

        let recycler = pool.recycler();
        std::thread::spawn(move || recycler.free_chain(a))
            .join()
            .unwrap();

        assert_eq!(pool.unallocated(), 0);
        assert_eq!(pool.refill_if_below(1), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().held(), 1);
    }

    #[test]
    fn test_conservation_never_exceeds_capacity() {
        let mut pool = BufferPool::with_refill_batch(16, 32, 4);
        let mut live = Vec::new();
        for round in 0..20 {
            pool.refill_if_below(4);
            if let Some(bi) = pool.claim() {
                live.push(bi);
            }
            if round % 3 == 0 {
                if let Some(bi) = live.pop() {
                    pool.release(bi);
                }
            }
            let stats = pool.stats();
            assert_eq!(stats.held() as usize, live.len());
            assert!(stats.held() as usize <= pool.capacity());
        }
    }
}
