#![allow(clippy::arithmetic_side_effects)]

// receive from memory-mapped slot rings. every ready slot becomes one chain;
// the slots go back to the producer once the sub-ring has been scanned.

use {
    crate::{
        buffer::FrameMeta,
        chain::build_chain,
        device::{DeviceCommon, DrainContext, DrainResult},
        error::RxError,
        ring::{Doorbell, MappedRing},
        trace_log::TraceEvent,
    },
    std::{
        io,
        os::fd::{AsRawFd, OwnedFd},
        sync::Arc,
    },
};

/// netmap `_IO('i', 149)`: tell the kernel which rx slots were consumed
pub const NIOCRXSYNC: libc::c_ulong = 0x6995;

pub struct RingDevice {
    rings: Vec<Arc<MappedRing>>,
    first_ring: usize,
    last_ring: usize,
    sync_fd: Option<OwnedFd>,
    doorbell: Option<Doorbell>,
}

impl RingDevice {
    /// a device serving every ring in `rings`
    pub fn new(rings: Vec<Arc<MappedRing>>) -> Self {
        assert!(!rings.is_empty(), "ring device needs at least one ring");
        let last_ring = rings.len() - 1;
        Self {
            rings,
            first_ring: 0,
            last_ring,
            sync_fd: None,
            doorbell: None,
        }
    }

    /// only serve sub-rings `first..=last`
    pub fn with_ring_range(mut self, first: usize, last: usize) -> Self {
        assert!(first <= last && last < self.rings.len(), "bad ring range");
        self.first_ring = first;
        self.last_ring = last;
        self
    }

    /// descriptor the rx sync ioctl is issued on after a productive drain
    pub fn with_sync_fd(mut self, fd: OwnedFd) -> Self {
        self.sync_fd = Some(fd);
        self
    }

    /// wakeup source cleared at the start of every drain
    pub fn with_doorbell(mut self, doorbell: Doorbell) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn rings(&self) -> &[Arc<MappedRing>] {
        &self.rings
    }

    pub fn ring_range(&self) -> (usize, usize) {
        (self.first_ring, self.last_ring)
    }

    fn sync(&self) -> io::Result<()> {
        let Some(fd) = &self.sync_fd else {
            return Ok(());
        };
        if unsafe { libc::ioctl(fd.as_raw_fd(), NIOCRXSYNC as _, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn drain(&mut self, common: &DeviceCommon, ctx: &mut DrainContext<'_>) -> DrainResult {
        if let Some(bell) = &self.doorbell {
            if let Err(e) = bell.clear() {
                log::debug!("{}: doorbell clear failed: {e}", common.name);
            }
        }

        ctx.pool.refill_if_below(ctx.dispatcher.frame_size());

        let next = common.next_node();
        let meta = FrameMeta {
            rx_device: common.id,
            ..FrameMeta::default()
        };
        let trace = ctx.dispatcher.trace().clone();

        let mut frames = 0;
        let mut more = false;

        for ring in &self.rings[self.first_ring..=self.last_ring] {
            let mut avail = ring.space();
            if avail == 0 {
                continue;
            }
            if ctx.pool.available() == 0 {
                more = true;
                break;
            }

            let mut cursor = ring.cur();
            while avail > 0 {
                // an unread slot is never consumed without a buffer for it
                if ctx.pool.available() == 0 {
                    more = true;
                    break;
                }

                let slot = ring.slot(cursor);
                match build_chain(ctx.pool, ring.payload(&slot), meta) {
                    Ok(built) => {
                        let chain = *built.chain();
                        if built.is_truncated() {
                            common.counters.add_truncated();
                            trace.log(TraceEvent::Truncated as u32, common.id.0 as u64, chain.length as u64);
                        }
                        common.account(next, usize::from(slot.len));
                        ctx.dispatcher.enqueue(ctx.pool, ctx.graph, next, common.id, &chain);
                        frames += 1;
                    }
                    // zero-length slot: nothing to deliver
                    Err(RxError::EmptyFrame) => {}
                    Err(e) => {
                        log::debug!("{}: slot {cursor} not consumed: {e}", common.name);
                        more = true;
                        break;
                    }
                }

                cursor = ring.next_slot(cursor);
                avail -= 1;
            }
            ring.release_to(cursor);

            if more {
                break;
            }
        }

        if frames > 0 {
            if let Err(e) = self.sync() {
                common.counters.add_error();
                log::warn!("{}: rx sync failed: {e}", common.name);
            }
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
            buffer::BufferHandle,
            chain::{copy_chain, validate_chain},
            device::{AdminFlag, AdminState, Device, DeviceKind, NextNode, ReadyHandle},
            dispatch::Dispatcher,
            pool::BufferPool,
            trace_log::TraceLog,
        },
    };

    fn frame(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    fn drain_collect(
        dev: &mut Device,
        pool: &mut BufferPool,
        dispatcher: &mut Dispatcher,
        out: &mut Vec<(NextNode, Vec<u8>)>,
    ) -> DrainResult {
        let mut graph = |pool: &mut BufferPool, next: NextNode, heads: &[BufferHandle]| {
            for &h in heads {
                validate_chain(pool, h).unwrap();
                out.push((next, copy_chain(pool, h)));
                pool.release_chain(h);
            }
        };
        let mut ctx = DrainContext {
            pool,
            dispatcher,
            graph: &mut graph,
        };
        dev.drain(&mut ctx)
    }

    #[test]
    fn test_drains_every_ready_slot() {
        let (ring, mut producer) = MappedRing::new(8, 2048).unwrap();
        let sent = [frame(60, 1), frame(600, 2), frame(1500, 3)];
        for f in &sent {
            assert!(producer.push(f));
        }

        let mut dev = Device::new(
            "ring0",
            ReadyHandle(-1),
            AdminFlag::new(AdminState::Up),
            DeviceKind::Ring(RingDevice::new(vec![ring.clone()])),
        );
        let mut pool = BufferPool::with_refill_batch(64, 512, 64);
        let mut dispatcher = Dispatcher::new(Arc::new(TraceLog::new()));
        let mut out = Vec::new();

        let r = drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);
        assert_eq!(r, DrainResult { frames: 3, more: false });
        assert_eq!(ring.space(), 0);
        assert_eq!(ring.head(), 3);

        let got: Vec<_> = out.iter().map(|(_, d)| d.clone()).collect();
        assert_eq!(got, sent.to_vec());
        assert!(out.iter().all(|(n, _)| *n == NextNode::EthernetInput));

        let c = dev.counters().snapshot();
        assert_eq!(c.rx_packets, 3);
        assert_eq!(c.rx_bytes, 2160);
        assert_eq!(pool.stats().held(), 0);
    }

    #[test]
    fn test_dry_pool_leaves_slots_and_asks_for_more() {
        let (ring, mut producer) = MappedRing::new(8, 256).unwrap();
        for i in 0..3 {
            assert!(producer.push(&frame(100, i)));
        }

        let mut dev = Device::new(
            "ring0",
            ReadyHandle(-1),
            AdminFlag::new(AdminState::Up),
            DeviceKind::Ring(RingDevice::new(vec![ring.clone()])),
        );
        let mut pool = BufferPool::with_refill_batch(2, 256, 256);
        let mut dispatcher = Dispatcher::new(Arc::new(TraceLog::new()));
        let mut out = Vec::new();

        let r = drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);
        assert_eq!(r, DrainResult { frames: 2, more: true });
        assert_eq!(ring.space(), 1);

        let r = drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);
        assert_eq!(r, DrainResult { frames: 1, more: false });
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].1, frame(100, 2));
        assert_eq!(dev.counters().snapshot().truncated, 0);
    }

    #[test]
    fn test_truncated_slot_is_consumed_once() {
        let trace = Arc::new(TraceLog::new());
        trace.configure(16, true).unwrap();

        let (ring, mut producer) = MappedRing::new(8, 2048).unwrap();
        assert!(producer.push(&frame(1500, 5)));
        assert!(producer.push(&frame(100, 6)));

        let mut dev = Device::new(
            "ring0",
            ReadyHandle(-1),
            AdminFlag::new(AdminState::Up),
            DeviceKind::Ring(RingDevice::new(vec![ring.clone()])),
        );
        // two 512-byte buffers: room for part of the first slot only
        let mut pool = BufferPool::with_refill_batch(2, 512, 2);
        let mut dispatcher = Dispatcher::new(trace.clone());
        let mut out = Vec::new();

        let r = drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);
        assert_eq!(r, DrainResult { frames: 1, more: true });
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, frame(1500, 5)[..1024].to_vec());
        assert_eq!(ring.space(), 1);

        let c = dev.counters().snapshot();
        assert_eq!((c.rx_packets, c.rx_bytes, c.truncated), (1, 1500, 1));

        let cut = trace.dump(None, Some(1024));
        assert_eq!(cut.len(), 1);
        assert_eq!(cut[0].kind, TraceEvent::Truncated as u32);

        // the truncated slot is not read again
        let r = drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);
        assert_eq!(r, DrainResult { frames: 1, more: false });
        assert_eq!(out[1].1, frame(100, 6));
        assert_eq!(ring.space(), 0);
        assert_eq!(dev.counters().snapshot().truncated, 1);
    }

    #[test]
    fn test_sub_ring_range_and_admin_down() {
        let mut rings = Vec::new();
        let mut producers = Vec::new();
        for _ in 0..3 {
            let (ring, producer) = MappedRing::new(4, 128).unwrap();
            rings.push(ring);
            producers.push(producer);
        }
        for (i, p) in producers.iter_mut().enumerate() {
            assert!(p.push(&frame(40, i as u8)));
        }

        let admin = AdminFlag::new(AdminState::Down);
        let mut dev = Device::new(
            "ring0",
            ReadyHandle(-1),
            admin,
            DeviceKind::Ring(RingDevice::new(rings.clone()).with_ring_range(1, 2)),
        );
        let mut pool = BufferPool::with_refill_batch(16, 128, 16);
        let mut dispatcher = Dispatcher::new(Arc::new(TraceLog::new()));
        let mut out = Vec::new();

        let r = drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);
        assert_eq!(r.frames, 2);
        assert_eq!(rings[0].space(), 1, "ring outside the range is untouched");
        assert!(out.iter().all(|(n, _)| *n == NextNode::Drop));

        let c = dev.counters().snapshot();
        assert_eq!(c.drops, 2);
        assert_eq!(c.rx_packets, 0);
    }

    #[test]
    fn test_drain_is_traced() {
        let trace = Arc::new(TraceLog::new());
        trace.configure(16, true).unwrap();

        let (ring, mut producer) = MappedRing::new(4, 128).unwrap();
        assert!(producer.push(&frame(10, 0)));

        let mut dev = Device::new(
            "ring0",
            ReadyHandle(-1),
            AdminFlag::new(AdminState::Up),
            DeviceKind::Ring(RingDevice::new(vec![ring])),
        );
        let mut pool = BufferPool::with_refill_batch(4, 128, 4);
        let mut dispatcher = Dispatcher::new(trace.clone());
        let mut out = Vec::new();
        drain_collect(&mut dev, &mut pool, &mut dispatcher, &mut out);

        let records = trace.dump(None, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, TraceEvent::DeviceDrain as u32);
        assert_eq!(records[0].data, [0, 1]);
    }
}
