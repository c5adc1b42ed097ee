#![allow(clippy::arithmetic_side_effects)]

// receive from message descriptors: pre-claim enough buffers for one MTU,
// scatter-read straight into them, then slice the byte count into a chain.

use {
    crate::{
        buffer::{BufferHandle, FrameMeta},
        chain::link_segments,
        descriptor::RxDescriptor,
        device::{DeviceCommon, DrainContext, DrainResult},
        error::RxError,
        trace_log::TraceEvent,
    },
    libc::{c_void, iovec},
    std::io,
};

pub const DEFAULT_MTU_BYTES: usize = 1500;

pub struct DescriptorDevice {
    fd: RxDescriptor,
    buffer_size: usize,
    mtu_bytes: usize,
    mtu_buffers: usize,
    iovecs: Vec<iovec>,
    claimed: Vec<BufferHandle>,
}

// safety: the iovec scratch only holds pointers between building it and the
// readv that consumes it, all inside one drain call
unsafe impl Send for DescriptorDevice {}

impl DescriptorDevice {
    pub fn new(fd: RxDescriptor, mtu_bytes: usize, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer size must be non-zero");
        let mut dev = Self {
            fd,
            buffer_size,
            mtu_bytes: 0,
            mtu_buffers: 0,
            iovecs: Vec::new(),
            claimed: Vec::new(),
        };
        dev.set_mtu(mtu_bytes);
        dev
    }

    /// buffers pre-claimed per read: `ceil(mtu / buffer size)`, at least one
    pub fn set_mtu(&mut self, mtu_bytes: usize) {
        self.mtu_bytes = mtu_bytes;
        self.mtu_buffers = mtu_bytes.div_ceil(self.buffer_size).max(1);
        self.iovecs.reserve(self.mtu_buffers);
        self.claimed.reserve(self.mtu_buffers);
    }

    #[inline]
    pub fn mtu_bytes(&self) -> usize {
        self.mtu_bytes
    }

    #[inline]
    pub fn mtu_buffers(&self) -> usize {
        self.mtu_buffers
    }

    pub fn descriptor(&self) -> &RxDescriptor {
        &self.fd
    }

    fn read_frame(&self) -> Result<usize, RxError> {
        match self.fd.readv(&self.iovecs) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(RxError::ReadWouldBlock),
            Err(e) => Err(RxError::ReadFailed(e)),
        }
    }

    pub(crate) fn drain(&mut self, common: &DeviceCommon, ctx: &mut DrainContext<'_>) -> DrainResult {
        debug_assert_eq!(ctx.pool.buffer_size(), self.buffer_size);

        let frame_size = ctx.dispatcher.frame_size();
        let trace = ctx.dispatcher.trace().clone();
        let next = common.next_node();
        let cap = self.buffer_size;

        let mut frames = 0;
        let mut more = false;

        loop {
            if frames >= frame_size {
                more = true;
                break;
            }

            ctx.pool.refill_if_below(self.mtu_buffers);
            self.claimed.clear();
            let k = ctx.pool.claim_batch(self.mtu_buffers, &mut self.claimed);
            if k == 0 {
                more = true;
                break;
            }

            self.iovecs.clear();
            for &bi in &self.claimed {
                self.iovecs.push(iovec {
                    iov_base: ctx.pool.data_ptr(bi) as *mut c_void,
                    iov_len: cap,
                });
            }

            let n = match self.read_frame() {
                Ok(0) | Err(RxError::ReadWouldBlock) => {
                    ctx.pool.unclaim(&self.claimed);
                    break;
                }
                Ok(n) => n,
                Err(RxError::ReadFailed(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    ctx.pool.unclaim(&self.claimed);
                    more = true;
                    break;
                }
                Err(e) => {
                    ctx.pool.unclaim(&self.claimed);
                    common.counters.add_error();
                    let errno = match &e {
                        RxError::ReadFailed(io) => io.raw_os_error().unwrap_or(0),
                        _ => 0,
                    };
                    trace.log(TraceEvent::ReadFailed as u32, common.id.0 as u64, errno as u64);
                    log::debug!("{}: read failed: {e}", common.name);
                    break;
                }
            };

            // short stash and a completely filled vector: the frame may have
            // been longer than what we could take. readv cannot tell, so a
            // frame of exactly k * cap bytes is counted truncated as well.
            let truncated = k < self.mtu_buffers && n == k * cap;
            let meta = FrameMeta {
                rx_device: common.id,
                truncated,
                ..FrameMeta::default()
            };
            let (chain, used) = link_segments(ctx.pool, &self.claimed, n, meta);
            ctx.pool.unclaim(&self.claimed[used..]);

            if truncated {
                common.counters.add_truncated();
                trace.log(TraceEvent::Truncated as u32, common.id.0 as u64, n as u64);
            }
            common.account(next, n);
            ctx.dispatcher.enqueue(ctx.pool, ctx.graph, next, common.id, &chain);
            frames += 1;
        }

        trace.log(TraceEvent::DeviceDrain as u32, common.id.0 as u64, frames as u64);
        DrainResult { frames, more }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            chain::{chain_segments, copy_chain, validate_chain},
            descriptor::send_frame,
            device::{AdminFlag, AdminState, CounterSnapshot, Device, DeviceKind, NextNode, ReadyHandle},
            dispatch::Dispatcher,
            pool::BufferPool,
            trace_log::TraceLog,
            FRAME_SIZE,
        },
        std::{
            os::fd::{FromRawFd, OwnedFd},
            sync::Arc,
        },
    };

    struct Seen {
        next: NextNode,
        data: Vec<u8>,
        seg_lens: Vec<usize>,
        truncated: bool,
    }

    fn device(mtu: usize, buffer_size: usize) -> (Device, OwnedFd) {
        let (rx, peer) = RxDescriptor::seqpacket_pair(0).unwrap();
        let dev = Device::new(
            "tap0",
            ReadyHandle(-1),
            AdminFlag::new(AdminState::Up),
            DeviceKind::Descriptor(DescriptorDevice::new(rx, mtu, buffer_size)),
        );
        (dev, peer)
    }

    fn drain(dev: &mut Device, pool: &mut BufferPool, out: &mut Vec<Seen>) -> DrainResult {
        drain_batch(dev, pool, out, FRAME_SIZE)
    }

    fn drain_batch(
        dev: &mut Device,
        pool: &mut BufferPool,
        out: &mut Vec<Seen>,
        frame_size: usize,
    ) -> DrainResult {
        let mut dispatcher = Dispatcher::with_frame_size(frame_size, Arc::new(TraceLog::new()));
        let mut graph = |pool: &mut BufferPool, next: NextNode, heads: &[BufferHandle]| {
            for &h in heads {
                validate_chain(pool, h).unwrap();
                out.push(Seen {
                    next,
                    data: copy_chain(pool, h),
                    seg_lens: chain_segments(pool, h).map(|bi| pool.header(bi).length()).collect(),
                    truncated: pool.header(h).meta().truncated,
                });
                pool.release_chain(h);
            }
        };
        let mut ctx = DrainContext {
            pool,
            dispatcher: &mut dispatcher,
            graph: &mut graph,
        };
        dev.drain(&mut ctx)
    }

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_full_mtu_frame_spans_three_buffers() {
        let (mut dev, peer) = device(1500, 512);
        let mut pool = BufferPool::new(64, 512);
        send_frame(&peer, &frame(1500)).unwrap();

        let mut out = Vec::new();
        let r = drain(&mut dev, &mut pool, &mut out);
        assert_eq!(r, DrainResult { frames: 1, more: false });
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seg_lens, vec![512, 512, 476]);
        assert_eq!(out[0].data, frame(1500));
        assert!(!out[0].truncated);

        let c = dev.counters().snapshot();
        assert_eq!((c.rx_packets, c.rx_bytes, c.truncated), (1, 1500, 0));
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_short_stash_truncates_without_error() {
        let (mut dev, peer) = device(1500, 512);
        let mut pool = BufferPool::new(2, 512);
        send_frame(&peer, &frame(1500)).unwrap();

        let mut out = Vec::new();
        drain(&mut dev, &mut pool, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seg_lens, vec![512, 512]);
        assert!(out[0].truncated);

        let c = dev.counters().snapshot();
        assert_eq!(c.truncated, 1);
        assert_eq!(c.errors, 0);
    }

    #[test]
    fn test_mtu_wider_than_refill_batch_is_not_truncated() {
        // twelve buffers per frame, refilled four at a time
        let (mut dev, peer) = device(1500, 128);
        let mut pool = BufferPool::with_refill_batch(64, 128, 4);
        send_frame(&peer, &frame(1500)).unwrap();

        let mut out = Vec::new();
        let r = drain_batch(&mut dev, &mut pool, &mut out, 4);
        assert_eq!(r, DrainResult { frames: 1, more: false });
        assert_eq!(out[0].seg_lens.len(), 12);
        assert_eq!(out[0].seg_lens[11], 1500 - 11 * 128);
        assert_eq!(out[0].data, frame(1500));
        assert!(!out[0].truncated);

        let c = dev.counters().snapshot();
        assert_eq!((c.rx_bytes, c.truncated), (1500, 0));
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_exact_multiple_read_has_no_empty_tail() {
        let (mut dev, peer) = device(1500, 512);
        let mut pool = BufferPool::new(8, 512);
        send_frame(&peer, &frame(1024)).unwrap();

        let mut out = Vec::new();
        drain(&mut dev, &mut pool, &mut out);
        assert_eq!(out[0].seg_lens, vec![512, 512]);
        assert!(!out[0].truncated);
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_would_block_ends_quietly() {
        let (mut dev, _peer) = device(1500, 512);
        let mut pool = BufferPool::new(8, 512);

        let mut out = Vec::new();
        let r = drain(&mut dev, &mut pool, &mut out);
        assert_eq!(r, DrainResult { frames: 0, more: false });
        assert_eq!(dev.counters().snapshot(), CounterSnapshot::default());
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_read_failure_counts_error() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        drop(read_end);

        // reading the write end of a pipe fails with EBADF
        let mut dev = Device::new(
            "tap1",
            ReadyHandle(-1),
            AdminFlag::new(AdminState::Up),
            DeviceKind::Descriptor(DescriptorDevice::new(RxDescriptor::from_fd(write_end), 1500, 512)),
        );
        let mut pool = BufferPool::new(8, 512);
        let mut out = Vec::new();
        let r = drain(&mut dev, &mut pool, &mut out);

        assert_eq!(r.frames, 0);
        assert_eq!(dev.counters().snapshot().errors, 1);
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_batch_limit_asks_for_more() {
        let (mut dev, peer) = device(100, 128);
        for _ in 0..10 {
            send_frame(&peer, &frame(64)).unwrap();
        }
        let mut pool = BufferPool::new(64, 128);

        let mut out = Vec::new();
        let r = drain_batch(&mut dev, &mut pool, &mut out, 8);
        assert_eq!(r, DrainResult { frames: 8, more: true });

        let r = drain_batch(&mut dev, &mut pool, &mut out, 8);
        assert_eq!(r, DrainResult { frames: 2, more: false });
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|s| s.next == NextNode::EthernetInput));
    }

    #[test]
    fn test_set_mtu_recomputes_buffers() {
        let (rx, _peer) = RxDescriptor::seqpacket_pair(0).unwrap();
        let mut d = DescriptorDevice::new(rx, 1500, 2048);
        assert_eq!(d.mtu_buffers(), 1);
        d.set_mtu(9000);
        assert_eq!(d.mtu_buffers(), 5);
        d.set_mtu(0);
        assert_eq!(d.mtu_buffers(), 1);
    }
}
