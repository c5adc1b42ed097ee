#![allow(clippy::arithmetic_side_effects)]

// device table plus the pending-set drain loop.
//
// readiness may be reported from any thread through a `Notifier`; it only
// maps the handle to a device index and sets that bit. the worker owning the
// `Scheduler` snapshots the set bits, clears each one right before draining
// that device, and re-marks devices that report more pending input.

use {
    crate::{
        device::{AdminState, Device, DeviceCounters, DeviceId, DeviceSummary, DrainContext, NextNode, ReadyHandle},
        dispatch::{Dispatcher, Graph},
        error::RxError,
        pending::PendingSet,
        pool::BufferPool,
    },
    ahash::AHashMap,
    parking_lot::RwLock,
    std::sync::Arc,
};

struct NotifyShared {
    pending: PendingSet,
    by_handle: RwLock<AHashMap<ReadyHandle, usize>>,
}

/// cheap, cloneable handle for reporting readiness from any thread
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<NotifyShared>,
}

impl Notifier {
    /// mark the device behind `handle` pending. unknown handles are ignored.
    pub fn mark_ready(&self, handle: ReadyHandle) -> bool {
        let index = self.shared.by_handle.read().get(&handle).copied();
        match index {
            Some(i) => {
                self.shared.pending.set(i);
                true
            }
            None => {
                log::warn!("readiness for unknown {handle}, ignored");
                false
            }
        }
    }

    pub fn mark_device(&self, id: DeviceId) {
        if id.index() < self.shared.pending.capacity() {
            self.shared.pending.set(id.index());
        }
    }

    pub fn is_pending(&self, id: DeviceId) -> bool {
        id.index() < self.shared.pending.capacity() && self.shared.pending.is_set(id.index())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// devices drained this cycle
    pub drained: usize,
    pub frames: usize,
    /// devices re-marked because input was left behind
    pub remarked: usize,
}

pub struct Scheduler {
    devices: Vec<Option<Device>>,
    inactive: Vec<usize>,
    max_devices: usize,
    shared: Arc<NotifyShared>,
    ready: Vec<usize>,
    dispatcher: Dispatcher,
    cycles: u64,
}

impl Scheduler {
    pub fn new(max_devices: usize, dispatcher: Dispatcher) -> Self {
        Self {
            devices: Vec::new(),
            inactive: Vec::new(),
            max_devices,
            shared: Arc::new(NotifyShared {
                pending: PendingSet::new(max_devices),
                by_handle: RwLock::new(AHashMap::new()),
            }),
            ready: Vec::with_capacity(max_devices),
            dispatcher,
            cycles: 0,
        }
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            shared: self.shared.clone(),
        }
    }

    /// register a device, reusing the most recently freed slot first
    pub fn add_device(&mut self, mut device: Device) -> Result<DeviceId, RxError> {
        let handle = device.ready_handle();
        if self.shared.by_handle.read().contains_key(&handle) {
            return Err(RxError::DuplicateHandle(handle));
        }

        let index = match self.inactive.pop() {
            Some(i) => i,
            None if self.devices.len() < self.max_devices => {
                self.devices.push(None);
                self.devices.len() - 1
            }
            None => return Err(RxError::TooManyDevices(self.max_devices)),
        };

        let id = DeviceId(index as u32);
        device.common.id = id;
        log::info!(
            "{id}: {} device {} on {handle}",
            device.kind().name(),
            device.name()
        );

        self.shared.pending.clear(index);
        self.shared.by_handle.write().insert(handle, index);
        self.devices[index] = Some(device);
        Ok(id)
    }

    /// deactivate a device; its slot is reused by the next add
    pub fn remove_device(&mut self, id: DeviceId) -> Option<Device> {
        let dev = self.devices.get_mut(id.index())?.take()?;
        self.shared.by_handle.write().remove(&dev.ready_handle());
        self.shared.pending.clear(id.index());
        self.inactive.push(id.index());
        log::info!("{id}: {} removed", dev.name());
        Some(dev)
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.index())?.as_ref()
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id.index())?.as_mut()
    }

    /// send everything received on `id` to `next`; `None` restores the default
    pub fn set_next_node(&mut self, id: DeviceId, next: Option<NextNode>) -> Result<(), RxError> {
        let dev = self.device_mut(id).ok_or(RxError::UnknownDevice(id))?;
        dev.set_next_override(next);
        Ok(())
    }

    pub fn set_admin_state(&mut self, id: DeviceId, state: AdminState) -> Result<(), RxError> {
        let dev = self.device(id).ok_or(RxError::UnknownDevice(id))?;
        dev.admin().set(state);
        Ok(())
    }

    pub fn counters(&self, id: DeviceId) -> Option<Arc<DeviceCounters>> {
        self.device(id).map(Device::counters)
    }

    /// active devices, lowest id first
    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.devices
            .iter()
            .flatten()
            .map(DeviceSummary::from)
            .collect()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn has_pending(&self) -> bool {
        !self.shared.pending.is_empty()
    }

    /// serve every device pending at the start of the cycle exactly once
    pub fn run_cycle(&mut self, pool: &mut BufferPool, graph: &mut dyn Graph) -> CycleReport {
        let mut report = CycleReport::default();
        self.cycles += 1;

        self.ready.clear();
        self.shared.pending.collect_set(&mut self.ready);

        for &index in &self.ready {
            // clear before draining: a notification landing mid-drain must
            // survive to the next cycle
            if !self.shared.pending.clear(index) {
                continue;
            }
            let Some(dev) = self.devices.get_mut(index).and_then(Option::as_mut) else {
                continue;
            };

            let mut ctx = DrainContext {
                pool: &mut *pool,
                dispatcher: &mut self.dispatcher,
                graph: &mut *graph,
            };
            let r = dev.drain(&mut ctx);

            report.drained += 1;
            report.frames += r.frames;
            if r.more {
                self.shared.pending.set(index);
                report.remarked += 1;
            }
        }

        if report.frames > 0 {
            log::debug!(
                "cycle {}: {} devices, {} frames, {} re-marked",
                self.cycles,
                report.drained,
                report.frames,
                report.remarked
            );
        }
        report
    }
}
