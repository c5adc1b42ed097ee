#![allow(clippy::arithmetic_side_effects)]

// packet sources known to the scheduler. a device is either a memory-mapped
// slot ring or a message descriptor; both drain through the same entry point.

use {
    crate::{
        dispatch::{Dispatcher, Graph},
        fd_rx::DescriptorDevice,
        pool::BufferPool,
        ring_rx::RingDevice,
    },
    std::{
        fmt,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
    },
};

/// index of a device in the scheduler, and its bit in the pending set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// the handle readiness notifications are keyed by (a file descriptor)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReadyHandle(pub i32);

impl fmt::Display for ReadyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// downstream graph node a batch is enqueued to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NextNode {
    Drop,
    EthernetInput,
    Ip4Input,
    Ip6Input,
    /// any other node, by graph index
    Node(u32),
}

impl fmt::Display for NextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextNode::Drop => write!(f, "error-drop"),
            NextNode::EthernetInput => write!(f, "ethernet-input"),
            NextNode::Ip4Input => write!(f, "ip4-input"),
            NextNode::Ip6Input => write!(f, "ip6-input"),
            NextNode::Node(n) => write!(f, "node-{n}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminState {
    Up,
    Down,
}

/// admin-state flag shared between the provisioning side and the datapath
#[derive(Clone, Debug)]
pub struct AdminFlag(Arc<AtomicBool>);

impl AdminFlag {
    pub fn new(state: AdminState) -> Self {
        AdminFlag(Arc::new(AtomicBool::new(state == AdminState::Up)))
    }

    #[inline]
    pub fn set(&self, state: AdminState) {
        self.0.store(state == AdminState::Up, Ordering::Release);
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// cumulative per-device counters. relaxed atomics: exact even when two
/// workers drain the same device, cheap when one does.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    errors: AtomicU64,
    truncated: AtomicU64,
    drops: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub errors: u64,
    pub truncated: u64,
    pub drops: u64,
}

impl DeviceCounters {
    #[inline]
    pub fn add_rx(&self, packets: u64, bytes: u64) {
        if packets > 0 {
            self.rx_packets.fetch_add(packets, Ordering::Relaxed);
            self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_drops(&self, n: u64) {
        if n > 0 {
            self.drops.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// what one drain invocation achieved
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainResult {
    pub frames: usize,
    /// input may remain (full batch or dry pool); serve again next cycle
    pub more: bool,
}

/// everything a reader needs from its worker for one drain
pub struct DrainContext<'a> {
    pub pool: &'a mut BufferPool,
    pub dispatcher: &'a mut Dispatcher,
    pub graph: &'a mut dyn Graph,
}

pub enum DeviceKind {
    Ring(RingDevice),
    Descriptor(DescriptorDevice),
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Ring(_) => "ring",
            DeviceKind::Descriptor(_) => "descriptor",
        }
    }
}

/// state shared by both device kinds, handed to the readers
pub struct DeviceCommon {
    pub id: DeviceId,
    pub name: String,
    pub ready: ReadyHandle,
    pub next_override: Option<NextNode>,
    pub admin: AdminFlag,
    pub counters: Arc<DeviceCounters>,
}

impl DeviceCommon {
    /// admin-down wins over any redirect
    #[inline]
    pub fn next_node(&self) -> NextNode {
        if !self.admin.is_up() {
            NextNode::Drop
        } else {
            self.next_override.unwrap_or(NextNode::EthernetInput)
        }
    }

    /// count one received frame; frames sent to drop count only as drops
    #[inline]
    pub(crate) fn account(&self, next: NextNode, bytes: usize) {
        if next == NextNode::Drop {
            self.counters.add_drops(1);
        } else {
            self.counters.add_rx(1, bytes as u64);
        }
    }
}

pub struct Device {
    pub(crate) common: DeviceCommon,
    pub(crate) kind: DeviceKind,
}

impl Device {
    pub fn new(name: impl Into<String>, ready: ReadyHandle, admin: AdminFlag, kind: DeviceKind) -> Self {
        Self {
            common: DeviceCommon {
                id: DeviceId::default(),
                name: name.into(),
                ready,
                next_override: None,
                admin,
                counters: Arc::new(DeviceCounters::default()),
            },
            kind,
        }
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.common.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.common.name
    }

    #[inline]
    pub fn ready_handle(&self) -> ReadyHandle {
        self.common.ready
    }

    #[inline]
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    #[inline]
    pub fn kind_mut(&mut self) -> &mut DeviceKind {
        &mut self.kind
    }

    pub fn counters(&self) -> Arc<DeviceCounters> {
        self.common.counters.clone()
    }

    pub fn admin(&self) -> &AdminFlag {
        &self.common.admin
    }

    pub fn next_override(&self) -> Option<NextNode> {
        self.common.next_override
    }

    pub fn set_next_override(&mut self, next: Option<NextNode>) {
        self.common.next_override = next;
    }

    /// drain whatever input is ready, then flush this device's batch
    pub fn drain(&mut self, ctx: &mut DrainContext<'_>) -> DrainResult {
        let result = match &mut self.kind {
            DeviceKind::Ring(ring) => ring.drain(&self.common, ctx),
            DeviceKind::Descriptor(desc) => desc.drain(&self.common, ctx),
        };
        ctx.dispatcher.flush(ctx.pool, ctx.graph);
        result
    }
}

/// one line of the device listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub name: String,
    pub kind: &'static str,
    pub ready: ReadyHandle,
    pub admin_up: bool,
    pub next_override: Option<NextNode>,
}

impl From<&Device> for DeviceSummary {
    fn from(dev: &Device) -> Self {
        DeviceSummary {
            id: dev.id(),
            name: dev.name().to_owned(),
            kind: dev.kind.name(),
            ready: dev.ready_handle(),
            admin_up: dev.admin().is_up(),
            next_override: dev.next_override(),
        }
    }
}
