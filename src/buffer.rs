// fixed-size pooled buffer headers and the handles that name them

use {
    crate::device::DeviceId,
    bitflags::bitflags,
    std::fmt,
};

/// default payload capacity of one buffer
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// opaque handle of a buffer inside a [`crate::pool::BufferPool`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u32);

impl BufferHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// `next` names the following segment of the chain
        const NEXT_PRESENT       = 0b01;
        /// head only: `overflow_length` is authoritative
        const TOTAL_LENGTH_VALID = 0b10;
    }
}

/// frame-level metadata, meaningful on chain heads only
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub rx_device: DeviceId,
    /// set when the frame was cut short by pool exhaustion
    pub truncated: bool,
    /// classification slot for downstream nodes, 0 = none
    pub error: u16,
}

/// buffer header. payload bytes live in the pool's data region.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    pub(crate) current_data: usize,
    pub(crate) current_length: usize,
    pub(crate) flags: BufferFlags,
    pub(crate) next: Option<BufferHandle>,
    pub(crate) overflow_length: usize,
    pub(crate) clone_count: u8,
    pub(crate) meta: FrameMeta,
}

impl Buffer {
    /// offset of the first valid byte
    #[inline]
    pub fn offset(&self) -> usize {
        self.current_data
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.current_length
    }

    #[inline]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    #[inline]
    pub fn next(&self) -> Option<BufferHandle> {
        self.next
    }

    /// total chain length not counting this (head) buffer
    #[inline]
    pub fn overflow_length(&self) -> usize {
        self.overflow_length
    }

    #[inline]
    pub fn clone_count(&self) -> u8 {
        self.clone_count
    }

    #[inline]
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.flags.contains(BufferFlags::NEXT_PRESENT)
    }

    pub(crate) fn reset(&mut self) {
        *self = Buffer::default();
    }
}
