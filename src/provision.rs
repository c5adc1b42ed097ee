// device provisioning: create the kernel or shared-memory object behind a
// device and hand the datapath its readiness handle and reader.
//
// no kernel TAP or netmap is needed here: a seqpacket socket pair keeps
// message boundaries the way a TAP descriptor does, and rings live in an
// in-process mapping.

use {
    crate::{
        config::RxConfig,
        descriptor::{send_frame, RxDescriptor},
        device::{AdminFlag, AdminState, Device, DeviceKind, ReadyHandle},
        error::ProvisionError,
        fd_rx::DescriptorDevice,
        ring::{Doorbell, MappedRing, RingProducer},
        ring_rx::RingDevice,
    },
    ahash::AHashMap,
    std::{
        io,
        os::fd::{AsRawFd, OwnedFd},
        sync::Arc,
    },
};

pub trait Provisioner {
    /// create a device named `name`, initially admin-up
    fn open(&mut self, name: &str) -> Result<ProvisionedDevice, ProvisionError>;

    /// tear down the provisioning side of a device
    fn close(&mut self, handle: ReadyHandle) -> Result<(), ProvisionError>;

    fn set_admin_state(&mut self, handle: ReadyHandle, state: AdminState) -> Result<(), ProvisionError>;
}

pub struct ProvisionedDevice {
    pub name: String,
    pub ready: ReadyHandle,
    pub admin: AdminFlag,
    pub kind: DeviceKind,
}

impl ProvisionedDevice {
    pub fn into_device(self) -> Device {
        Device::new(self.name, self.ready, self.admin, self.kind)
    }
}

fn syscall(op: &'static str) -> impl FnOnce(io::Error) -> ProvisionError {
    move |source| ProvisionError::Syscall { op, source }
}

/// injecting end of a seqpacket device
#[derive(Clone)]
pub struct Injector {
    peer: Arc<OwnedFd>,
}

impl Injector {
    pub fn send(&self, frame: &[u8]) -> io::Result<usize> {
        send_frame(&*self.peer, frame)
    }
}

struct SeqpacketEntry {
    name: String,
    admin: AdminFlag,
    peer: Arc<OwnedFd>,
}

pub struct SeqpacketProvisioner {
    mtu_bytes: usize,
    buffer_size: usize,
    recv_buffer_size: usize,
    disabled: bool,
    open: AHashMap<ReadyHandle, SeqpacketEntry>,
}

impl SeqpacketProvisioner {
    pub fn new(mtu_bytes: usize, buffer_size: usize) -> Self {
        Self {
            mtu_bytes,
            buffer_size,
            recv_buffer_size: 0,
            disabled: false,
            open: AHashMap::new(),
        }
    }

    pub fn from_config(cfg: &RxConfig) -> Self {
        let mut p = Self::new(cfg.mtu_bytes, cfg.buffer_size);
        p.recv_buffer_size = cfg.descriptor.recv_buffer_size;
        p.disabled = cfg.descriptor.disabled;
        p
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    /// sending side of an open device
    pub fn injector(&self, handle: ReadyHandle) -> Result<Injector, ProvisionError> {
        let entry = self.open.get(&handle).ok_or(ProvisionError::UnknownHandle(handle))?;
        Ok(Injector {
            peer: entry.peer.clone(),
        })
    }
}

impl Provisioner for SeqpacketProvisioner {
    fn open(&mut self, name: &str) -> Result<ProvisionedDevice, ProvisionError> {
        if self.disabled {
            return Err(ProvisionError::Disabled);
        }
        let (rx, peer) = RxDescriptor::seqpacket_pair(self.recv_buffer_size).map_err(syscall("socketpair"))?;
        let ready = ReadyHandle(rx.as_raw_fd());
        let admin = AdminFlag::new(AdminState::Up);

        self.open.insert(
            ready,
            SeqpacketEntry {
                name: name.to_owned(),
                admin: admin.clone(),
                peer: Arc::new(peer),
            },
        );
        log::info!("{name}: seqpacket device on {ready}");

        Ok(ProvisionedDevice {
            name: name.to_owned(),
            ready,
            admin,
            kind: DeviceKind::Descriptor(DescriptorDevice::new(rx, self.mtu_bytes, self.buffer_size)),
        })
    }

    fn close(&mut self, handle: ReadyHandle) -> Result<(), ProvisionError> {
        let entry = self.open.remove(&handle).ok_or(ProvisionError::UnknownHandle(handle))?;
        log::info!("{}: seqpacket device closed", entry.name);
        Ok(())
    }

    fn set_admin_state(&mut self, handle: ReadyHandle, state: AdminState) -> Result<(), ProvisionError> {
        let entry = self.open.get(&handle).ok_or(ProvisionError::UnknownHandle(handle))?;
        entry.admin.set(state);
        Ok(())
    }
}

struct RingEntry {
    name: String,
    admin: AdminFlag,
    producers: Vec<RingProducer>,
}

pub struct RingProvisioner {
    rings: usize,
    slots: u32,
    slot_size: u16,
    open: AHashMap<ReadyHandle, RingEntry>,
}

impl RingProvisioner {
    pub fn new(rings: usize, slots: u32, slot_size: u16) -> Self {
        Self {
            rings: rings.max(1),
            slots,
            slot_size,
            open: AHashMap::new(),
        }
    }

    pub fn from_config(cfg: &RxConfig) -> Self {
        Self::new(cfg.ring.rings, cfg.ring.slots, cfg.ring.slot_size)
    }

    /// producer ends of every sub-ring, once
    pub fn take_producers(&mut self, handle: ReadyHandle) -> Result<Vec<RingProducer>, ProvisionError> {
        let entry = self.open.get_mut(&handle).ok_or(ProvisionError::UnknownHandle(handle))?;
        Ok(std::mem::take(&mut entry.producers))
    }
}

impl Provisioner for RingProvisioner {
    fn open(&mut self, name: &str) -> Result<ProvisionedDevice, ProvisionError> {
        let doorbell = Doorbell::new().map_err(syscall("eventfd"))?;

        let mut rings = Vec::with_capacity(self.rings);
        let mut producers = Vec::with_capacity(self.rings);
        for _ in 0..self.rings {
            let (ring, producer) = MappedRing::new(self.slots, self.slot_size).map_err(syscall("mmap"))?;
            let bell = doorbell.try_clone().map_err(syscall("dup"))?;
            rings.push(ring);
            producers.push(producer.with_doorbell(bell));
        }

        let ready = ReadyHandle(doorbell.as_raw_fd());
        let admin = AdminFlag::new(AdminState::Up);
        self.open.insert(
            ready,
            RingEntry {
                name: name.to_owned(),
                admin: admin.clone(),
                producers,
            },
        );
        log::info!("{name}: {} ring(s) of {} slots on {ready}", self.rings, self.slots);

        Ok(ProvisionedDevice {
            name: name.to_owned(),
            ready,
            admin,
            kind: DeviceKind::Ring(RingDevice::new(rings).with_doorbell(doorbell)),
        })
    }

    fn close(&mut self, handle: ReadyHandle) -> Result<(), ProvisionError> {
        let entry = self.open.remove(&handle).ok_or(ProvisionError::UnknownHandle(handle))?;
        log::info!("{}: ring device closed", entry.name);
        Ok(())
    }

    fn set_admin_state(&mut self, handle: ReadyHandle, state: AdminState) -> Result<(), ProvisionError> {
        let entry = self.open.get(&handle).ok_or(ProvisionError::UnknownHandle(handle))?;
        entry.admin.set(state);
        Ok(())
    }
}
