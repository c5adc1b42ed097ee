//! Receive side of a vector packet engine.
//!
//! Frames arrive from memory-mapped slot rings or from message descriptors,
//! are copied or scatter-read into chains of fixed-size pool buffers, and
//! leave in frames of up to [`FRAME_SIZE`] chain heads per destination node.
//! Readiness is reported into an atomic pending set that a per-worker
//! [`scheduler::Scheduler`] drains; a lock-free [`trace_log::TraceLog`]
//! records short events along the way.

pub mod buffer;
pub mod chain;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod epoll;
pub mod error;
pub mod fd_rx;
pub mod pending;
pub mod pool;
pub mod provision;
pub mod ring;
pub mod ring_rx;
pub mod rx_loop;
pub mod scheduler;
pub mod trace_log;

use std::{io, mem};

pub use {
    buffer::{BufferHandle, FrameMeta},
    device::{AdminState, Device, DeviceId, NextNode, ReadyHandle},
    dispatch::{Dispatcher, Graph},
    error::{ConfigError, ProvisionError, RxError},
    pool::BufferPool,
    scheduler::{Notifier, Scheduler},
    trace_log::{TraceEvent, TraceLog},
};

/// chain heads per dispatched frame, and buffers per pool refill
pub const FRAME_SIZE: usize = 256;

/// pin the calling thread to `cpus`
pub fn set_cpu_affinity(cpus: impl IntoIterator<Item = usize>) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        for cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// cpu the calling thread runs on, 0 if unknown
#[inline]
pub fn current_cpu() -> u32 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as u32
    }
}
