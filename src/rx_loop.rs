#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        config::RxConfig,
        device::{Device, DeviceId},
        dispatch::{Dispatcher, Graph},
        epoll::ReadinessPoller,
        error::RxError,
        pool::BufferPool,
        scheduler::{CycleReport, Scheduler},
        set_cpu_affinity,
        trace_log::TraceLog,
    },
    caps::{CapSet, Capability::CAP_SYS_NICE},
    std::{
        io,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
    },
};

const DEFAULT_POLL_TIMEOUT_MS: i32 = 100;

#[derive(Default)]
pub struct RxStats {
    pub cycles: AtomicU64,
    pub frames: AtomicU64,
    pub wakeups: AtomicU64,
}

/// everything one receive thread owns
pub struct RxWorker {
    pub pool: BufferPool,
    pub scheduler: Scheduler,
    poller: ReadinessPoller,
    poll_timeout_ms: i32,
}

impl RxWorker {
    pub fn new(cfg: &RxConfig, trace: Arc<TraceLog>) -> io::Result<Self> {
        let mut dispatcher = Dispatcher::with_frame_size(cfg.frame_size, trace);
        dispatcher.set_trace_budget(cfg.trace_budget);

        Ok(Self {
            pool: BufferPool::with_refill_batch(cfg.pool_buffers, cfg.buffer_size, cfg.frame_size),
            scheduler: Scheduler::new(cfg.max_devices, dispatcher),
            poller: ReadinessPoller::new(cfg.max_devices)?,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        })
    }

    pub fn set_poll_timeout(&mut self, timeout_ms: i32) {
        self.poll_timeout_ms = timeout_ms;
    }

    /// register with the scheduler and the poller. the device starts out
    /// pending: input queued before registration raises no edge.
    pub fn add_device(&mut self, device: Device) -> Result<DeviceId, RxError> {
        let handle = device.ready_handle();
        let id = self.scheduler.add_device(device)?;
        if let Err(e) = self.poller.register(handle) {
            self.scheduler.remove_device(id);
            return Err(RxError::Poller(e));
        }
        self.scheduler.notifier().mark_device(id);
        Ok(id)
    }

    pub fn remove_device(&mut self, id: DeviceId) -> Option<Device> {
        let dev = self.scheduler.remove_device(id)?;
        if let Err(e) = self.poller.deregister(dev.ready_handle()) {
            log::warn!("{id}: deregister failed: {e}");
        }
        Some(dev)
    }

    /// wait for readiness unless work is already pending, then run one cycle
    pub fn poll_once(&mut self, graph: &mut dyn Graph) -> io::Result<CycleReport> {
        let timeout = if self.scheduler.has_pending() {
            0
        } else {
            self.poll_timeout_ms
        };
        self.poller.poll(timeout, &self.scheduler.notifier())?;
        Ok(self.scheduler.run_cycle(&mut self.pool, graph))
    }
}

#[inline(never)]
pub fn rx_loop(
    cpu_id: Option<usize>,
    realtime: bool,
    worker: &mut RxWorker,
    graph: &mut dyn Graph,
    stats: Arc<RxStats>,
    exit: Arc<AtomicBool>,
) -> io::Result<()> {
    log::info!(
        "starting rx loop on cpu {cpu_id:?}, {} devices",
        worker.scheduler.devices().len()
    );

    if let Some(cpu) = cpu_id {
        set_cpu_affinity([cpu])?;
    }

    if realtime {
        if let Err(e) = caps::raise(None, CapSet::Effective, CAP_SYS_NICE) {
            log::warn!("could not raise CAP_SYS_NICE: {e}");
        }
        let (_min, max) = fifo_priority_bounds()?;
        if let Err(e) = set_current_thread_sched_fifo(max) {
            log::warn!("staying on the default scheduler: {e}");
        }
    }

    // main receive loop
    loop {
        if exit.load(Ordering::Relaxed) {
            break;
        }

        let report = worker.poll_once(graph)?;

        stats.cycles.fetch_add(1, Ordering::Relaxed);
        if report.drained > 0 {
            stats.wakeups.fetch_add(1, Ordering::Relaxed);
            stats.frames.fetch_add(report.frames as u64, Ordering::Relaxed);
        }
    }

    log::info!(
        "rx loop stopped after {} cycles, {} frames",
        stats.cycles.load(Ordering::Relaxed),
        stats.frames.load(Ordering::Relaxed)
    );
    Ok(())
}

/// return min/max valid priorities for SCHED_FIFO on this system.
fn fifo_priority_bounds() -> io::Result<(i32, i32)> {
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if min == -1 || max == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok((min, max))
    }
}

/// set the calling thread to SCHED_FIFO with the given priority.
pub fn set_current_thread_sched_fifo(priority: i32) -> io::Result<()> {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
