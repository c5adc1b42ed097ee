#![allow(clippy::arithmetic_side_effects)]

// buffer chains: one frame spread over linked pool buffers.
//
// the head carries TOTAL_LENGTH_VALID, the frame metadata and the
// overflow length (bytes in every segment after the head). every non-tail
// segment has NEXT_PRESENT and a next handle; the tail has neither.

use {
    crate::{
        buffer::{BufferFlags, BufferHandle, FrameMeta},
        error::{ChainError, RxError},
        pool::BufferPool,
    },
    ahash::AHashSet,
};

/// a linked chain as handed to the dispatcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub head: BufferHandle,
    /// bytes across all segments
    pub length: usize,
    pub segments: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltChain {
    Complete(ChainHead),
    /// the pool ran dry mid-frame; still a valid, shorter frame
    Truncated(ChainHead),
}

impl BuiltChain {
    #[inline]
    pub fn chain(&self) -> &ChainHead {
        match self {
            BuiltChain::Complete(c) | BuiltChain::Truncated(c) => c,
        }
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        matches!(self, BuiltChain::Truncated(_))
    }
}

#[inline]
fn init_head(pool: &mut BufferPool, bi: BufferHandle, meta: FrameMeta) {
    let b = pool.header_mut(bi);
    b.overflow_length = 0;
    b.flags = BufferFlags::TOTAL_LENGTH_VALID;
    b.meta = meta;
}

/// link `bi` after `prev` and account its bytes on `first`
#[inline]
fn add_to_chain(pool: &mut BufferPool, bi: BufferHandle, first: BufferHandle, prev: BufferHandle) {
    let len = pool.header(bi).current_length;
    pool.header_mut(first).overflow_length += len;

    let p = pool.header_mut(prev);
    p.next = Some(bi);
    p.flags |= BufferFlags::NEXT_PRESENT;

    pool.header_mut(bi).next = None;
}

/// copy `frame` into as many pool buffers as it needs.
///
/// stops early if the stash runs out; the partial chain is still linked and
/// returned as [`BuiltChain::Truncated`]. fails only when not even the head
/// buffer could be claimed, or the frame is empty.
pub fn build_chain(
    pool: &mut BufferPool,
    frame: &[u8],
    mut meta: FrameMeta,
) -> Result<BuiltChain, RxError> {
    if frame.is_empty() {
        return Err(RxError::EmptyFrame);
    }

    let cap = pool.buffer_size();
    let mut offset = 0;
    let mut first: Option<BufferHandle> = None;
    let mut prev: Option<BufferHandle> = None;
    let mut segments = 0;

    while offset < frame.len() {
        let Some(bi) = pool.claim() else { break };

        let n = (frame.len() - offset).min(cap);
        pool.data_mut(bi)[..n].copy_from_slice(&frame[offset..offset + n]);
        {
            let b = pool.header_mut(bi);
            b.current_data = 0;
            b.current_length = n;
            b.clone_count = 0;
        }

        match (first, prev) {
            (Some(f), Some(p)) => add_to_chain(pool, bi, f, p),
            _ => {
                init_head(pool, bi, meta);
                first = Some(bi);
            }
        }

        prev = Some(bi);
        offset += n;
        segments += 1;
    }

    let Some(head) = first else {
        return Err(RxError::PoolExhausted);
    };

    let chain = ChainHead {
        head,
        length: offset,
        segments,
    };
    if offset < frame.len() {
        meta.truncated = true;
        pool.header_mut(head).meta = meta;
        Ok(BuiltChain::Truncated(chain))
    } else {
        Ok(BuiltChain::Complete(chain))
    }
}

/// turn buffers already filled by a scatter read into a chain of `n_bytes`.
///
/// each segment gets `min(remaining, capacity)`; the last segment takes the
/// remainder, so a read that is an exact multiple of the capacity never
/// leaves an empty tail. returns the chain and the number of handles used.
pub fn link_segments(
    pool: &mut BufferPool,
    handles: &[BufferHandle],
    n_bytes: usize,
    meta: FrameMeta,
) -> (ChainHead, usize) {
    let cap = pool.buffer_size();
    debug_assert!(n_bytes > 0 && !handles.is_empty());
    debug_assert!(n_bytes <= handles.len() * cap);

    let first = handles[0];
    let mut left = n_bytes;
    let mut used = 0;

    for &bi in handles {
        {
            let b = pool.header_mut(bi);
            b.current_data = 0;
            b.current_length = left.min(cap);
            b.clone_count = 0;
            b.next = None;
        }
        if used > 0 {
            let p = handles[used - 1];
            let pb = pool.header_mut(p);
            pb.next = Some(bi);
            pb.flags |= BufferFlags::NEXT_PRESENT;
        }
        left -= left.min(cap);
        used += 1;
        if left == 0 {
            break;
        }
    }

    let b = pool.header_mut(first);
    b.overflow_length = n_bytes.saturating_sub(cap);
    b.flags |= BufferFlags::TOTAL_LENGTH_VALID;
    b.meta = meta;

    (
        ChainHead {
            head: first,
            length: n_bytes - left,
            segments: used,
        },
        used,
    )
}

/// walk the segments of a chain
pub struct Segments<'a> {
    pool: &'a BufferPool,
    next: Option<BufferHandle>,
}

impl Iterator for Segments<'_> {
    type Item = BufferHandle;

    fn next(&mut self) -> Option<BufferHandle> {
        let bi = self.next?;
        let b = self.pool.header(bi);
        self.next = if b.has_next() { b.next() } else { None };
        Some(bi)
    }
}

pub fn chain_segments(pool: &BufferPool, head: BufferHandle) -> Segments<'_> {
    Segments {
        pool,
        next: Some(head),
    }
}

/// frame length, from the head when it is authoritative
pub fn chain_len(pool: &BufferPool, head: BufferHandle) -> usize {
    let b = pool.header(head);
    if b.flags().contains(BufferFlags::TOTAL_LENGTH_VALID) {
        b.length() + b.overflow_length()
    } else {
        chain_segments(pool, head).map(|bi| pool.header(bi).length()).sum()
    }
}

/// gather a chain into one contiguous vector
pub fn copy_chain(pool: &BufferPool, head: BufferHandle) -> Vec<u8> {
    let mut out = Vec::with_capacity(chain_len(pool, head));
    for bi in chain_segments(pool, head) {
        out.extend_from_slice(pool.payload(bi));
    }
    out
}

pub fn validate_chain(pool: &BufferPool, head: BufferHandle) -> Result<(), ChainError> {
    let mut seen = AHashSet::new();
    let mut total = 0;
    let mut cursor = Some(head);

    while let Some(bi) = cursor {
        if !pool.is_claimed(bi) {
            return Err(ChainError::NotClaimed(bi));
        }
        if !seen.insert(bi) {
            return Err(ChainError::Duplicated(bi));
        }
        let b = pool.header(bi);
        if b.clone_count() != 0 {
            return Err(ChainError::Cloned(bi));
        }
        match (b.has_next(), b.next()) {
            (true, None) => return Err(ChainError::DanglingNext(bi)),
            (false, Some(_)) => return Err(ChainError::MissingNextFlag(bi)),
            _ => {}
        }
        total += b.length();
        cursor = b.next();
    }

    let h = pool.header(head);
    let declared = h.length() + h.overflow_length();
    if declared != total {
        return Err(ChainError::LengthMismatch {
            declared,
            actual: total,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::device::DeviceId};

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn meta() -> FrameMeta {
        FrameMeta {
            rx_device: DeviceId(7),
            ..FrameMeta::default()
        }
    }

    #[test]
    fn test_chain_integrity_across_lengths() {
        let cap = 256;
        for len in [1, 255, 256, 257, 512, 513, 1000, 2048] {
            let mut pool = BufferPool::with_refill_batch(64, cap, 64);
            pool.refill_if_below(64);
            let data = frame(len);

            let built = build_chain(&mut pool, &data, meta()).unwrap();
            assert!(!built.is_truncated());
            let c = *built.chain();

            assert_eq!(c.segments, len.div_ceil(cap), "len {len}");
            assert_eq!(c.length, len);
            assert_eq!(pool.header(c.head).overflow_length(), len.saturating_sub(cap));
            assert_eq!(chain_len(&pool, c.head), len);
            assert_eq!(copy_chain(&pool, c.head), data);
            validate_chain(&pool, c.head).unwrap();
            assert_eq!(pool.header(c.head).meta().rx_device, DeviceId(7));
        }
    }

    #[test]
    fn test_scenario_1500_over_512_with_four_buffers() {
        let mut pool = BufferPool::with_refill_batch(4, 512, 256);
        pool.refill_if_below(256);

        let built = build_chain(&mut pool, &frame(1500), meta()).unwrap();
        let c = *built.chain();

        let lens: Vec<_> = chain_segments(&pool, c.head)
            .map(|bi| pool.header(bi).length())
            .collect();
        assert_eq!(lens, vec![512, 512, 476]);
        assert_eq!(pool.header(c.head).overflow_length(), 988);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_truncated_chain_is_still_valid() {
        let mut pool = BufferPool::with_refill_batch(2, 100, 2);
        pool.refill_if_below(2);

        let built = build_chain(&mut pool, &frame(350), meta()).unwrap();
        assert!(built.is_truncated());
        let c = *built.chain();
        assert_eq!(c.segments, 2);
        assert_eq!(c.length, 200);
        assert!(pool.header(c.head).meta().truncated);
        validate_chain(&pool, c.head).unwrap();

        assert!(matches!(
            build_chain(&mut pool, &frame(10), meta()),
            Err(RxError::PoolExhausted)
        ));
    }

    #[test]
    fn test_empty_frame_claims_nothing() {
        let mut pool = BufferPool::with_refill_batch(2, 100, 2);
        pool.refill_if_below(2);
        assert!(matches!(
            build_chain(&mut pool, &[], meta()),
            Err(RxError::EmptyFrame)
        ));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_no_handle_shared_between_chains() {
        let mut pool = BufferPool::with_refill_batch(32, 64, 32);
        pool.refill_if_below(32);

        let mut seen = AHashSet::new();
        for len in [10, 100, 200, 64, 300] {
            let c = *build_chain(&mut pool, &frame(len), meta()).unwrap().chain();
            for bi in chain_segments(&pool, c.head) {
                assert!(seen.insert(bi), "{bi} reused");
            }
        }
    }

    #[test]
    fn test_link_segments_exact_multiple_has_no_empty_tail() {
        let mut pool = BufferPool::with_refill_batch(4, 512, 4);
        pool.refill_if_below(4);
        let mut handles = Vec::new();
        pool.claim_batch(3, &mut handles);

        let (c, used) = link_segments(&mut pool, &handles, 1024, meta());
        assert_eq!(used, 2);
        assert_eq!(c.segments, 2);
        assert_eq!(c.length, 1024);

        let tail = handles[1];
        assert_eq!(pool.header(tail).length(), 512);
        assert!(!pool.header(tail).has_next());
        assert_eq!(pool.header(c.head).overflow_length(), 512);

        pool.unclaim(&handles[used..]);
        validate_chain(&pool, c.head).unwrap();
    }

    #[test]
    fn test_validate_catches_bad_length() {
        let mut pool = BufferPool::with_refill_batch(4, 64, 4);
        pool.refill_if_below(4);
        let c = *build_chain(&mut pool, &frame(100), meta()).unwrap().chain();
        pool.header_mut(c.head).overflow_length = 1;

        assert_eq!(
            validate_chain(&pool, c.head),
            Err(ChainError::LengthMismatch {
                declared: 65,
                actual: 100
            })
        );
    }

    #[test]
    fn test_release_chain_returns_every_segment() {
        let mut pool = BufferPool::with_refill_batch(8, 64, 8);
        pool.refill_if_below(8);
        let c = *build_chain(&mut pool, &frame(200), meta()).unwrap().chain();

        assert_eq!(pool.release_chain(c.head), 4);
        assert_eq!(pool.stats().held(), 0);
    }
}
