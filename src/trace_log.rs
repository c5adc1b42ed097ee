#![allow(clippy::arithmetic_side_effects)]

//! Circular event trace log.
//!
//! A fixed, power-of-two array of short records plus a monotonically
//! increasing tail. Any thread may append: the tail is bumped with one
//! atomic add and the record fields are stored with relaxed atomics, so a
//! writer never blocks, allocates or fails. When the log wraps, the oldest
//! records are overwritten.
//!
//! Lifecycle: disabled at startup, sized (and optionally enabled) by
//! [`TraceLog::configure`], stoppable with [`TraceLog::stop`]. A live log is
//! never resized; stored records survive `stop` for later dumping.

use {
    crate::{current_cpu, error::ConfigError},
    itertools::Itertools,
    parking_lot::RwLock,
    std::{
        fmt,
        sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        time::Instant,
    },
};

/// every field of an unwritten record holds all-ones
const EMPTY: u64 = u64::MAX;

/// event tags emitted by the receive path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TraceEvent {
    /// data0 = device, data1 = head handle << 32 | frame length
    RxChain = 1,
    /// data0 = device, data1 = frames produced by the drain
    DeviceDrain = 2,
    /// data0 = device, data1 = errno
    ReadFailed = 3,
    /// data0 = device, data1 = truncated frame length
    Truncated = 4,
}

/// one dumped record
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceRecord {
    /// seconds since the log was created
    pub time: f64,
    pub cpu: u32,
    pub kind: u32,
    pub data: [u64; 2],
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]: {:10.6} T{:02} {:x} {:x}",
            self.cpu, self.time, self.kind, self.data[0], self.data[1]
        )
    }
}

struct Slot {
    time_ns: AtomicU64,
    cpu: AtomicU32,
    kind: AtomicU32,
    data: [AtomicU64; 2],
}

impl Slot {
    fn empty() -> Self {
        Slot {
            time_ns: AtomicU64::new(EMPTY),
            cpu: AtomicU32::new(EMPTY as u32),
            kind: AtomicU32::new(EMPTY as u32),
            data: [AtomicU64::new(EMPTY), AtomicU64::new(EMPTY)],
        }
    }

    fn load(&self) -> TraceRecord {
        TraceRecord {
            time: self.time_ns.load(Ordering::Relaxed) as f64 / 1e9,
            cpu: self.cpu.load(Ordering::Relaxed),
            kind: self.kind.load(Ordering::Relaxed),
            data: [
                self.data[0].load(Ordering::Relaxed),
                self.data[1].load(Ordering::Relaxed),
            ],
        }
    }
}

pub struct TraceLog {
    epoch: Instant,
    /// newest stamp handed out; stamps strictly increase
    last_ns: AtomicU64,
    enabled: AtomicBool,
    /// index of the newest record; all-ones before the first one
    tail: AtomicU64,
    records: RwLock<Box<[Slot]>>,
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceLog {
    /// an unconfigured, disabled log
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ns: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            tail: AtomicU64::new(EMPTY),
            records: RwLock::new(Box::default()),
        }
    }

    /// size the log to `records` rounded up to a power of two, clear it and
    /// optionally enable it. returns the capacity in effect.
    pub fn configure(&self, records: usize, enable: bool) -> Result<usize, ConfigError> {
        if records == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let capacity = records
            .checked_next_power_of_two()
            .ok_or(ConfigError::CapacityOverflow(records))?;

        if self.enabled.load(Ordering::Acquire) {
            return Err(ConfigError::LogLive);
        }

        let mut slots = self.records.write();
        *slots = (0..capacity).map(|_| Slot::empty()).collect();
        self.tail.store(EMPTY, Ordering::Release);
        self.enabled.store(enable, Ordering::Release);

        log::info!("trace log configured: {capacity} records, enabled {enable}");
        Ok(capacity)
    }

    /// turn logging on or off without touching stored records
    pub fn set_enabled(&self, enable: bool) -> Result<(), ConfigError> {
        if self.capacity() == 0 {
            return Err(ConfigError::NotConfigured);
        }
        self.enabled.store(enable, Ordering::Release);
        Ok(())
    }

    /// stop logging; stored records are kept for dumping
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.records.read().len()
    }

    /// number of records logged since the last configure
    pub fn logged(&self) -> u64 {
        self.tail.load(Ordering::Acquire).wrapping_add(1)
    }

    /// append one record. no-op while disabled, and when racing a reconfigure.
    #[inline]
    pub fn log(&self, kind: u32, data0: u64, data1: u64) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(slots) = self.records.try_read() else {
            return;
        };
        if slots.is_empty() {
            return;
        }

        let tail = self.tail.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let slot = &slots[tail as usize & (slots.len() - 1)];

        slot.time_ns.store(self.stamp(), Ordering::Relaxed);
        slot.cpu.store(current_cpu(), Ordering::Relaxed);
        slot.kind.store(kind, Ordering::Relaxed);
        slot.data[0].store(data0, Ordering::Relaxed);
        slot.data[1].store(data1, Ordering::Relaxed);
    }

    /// monotonic nanoseconds, bumped past the previous stamp when the clock
    /// has not moved
    #[inline]
    fn stamp(&self) -> u64 {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let prev = self
            .last_ns
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |last| {
                Some(now.max(last.wrapping_add(1)))
            })
            .unwrap_or(now);
        now.max(prev.wrapping_add(1))
    }

    /// records oldest to newest, keeping those that match every filter given
    pub fn dump(&self, filter0: Option<u64>, filter1: Option<u64>) -> Vec<TraceRecord> {
        let slots = self.records.read();
        let tail = self.tail.load(Ordering::Acquire);
        if slots.is_empty() || tail == EMPTY {
            return Vec::new();
        }

        let cap = slots.len() as u64;
        let end = (tail % cap) as usize;
        let wrapped = tail >= cap;

        let order: Box<dyn Iterator<Item = usize>> = if wrapped {
            Box::new((end + 1..slots.len()).chain(0..=end))
        } else {
            Box::new(0..=end)
        };

        order
            .map(|i| slots[i].load())
            .filter(|r| filter0.map_or(true, |f| r.data[0] == f))
            .filter(|r| filter1.map_or(true, |f| r.data[1] == f))
            .collect()
    }

    /// one line per record, in the `[cpu]: time Ttype data0 data1` layout
    pub fn render(records: &[TraceRecord]) -> String {
        records.iter().join("\n")
    }
}
