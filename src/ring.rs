#![allow(clippy::arithmetic_side_effects)]

// memory-mapped slot ring shared with a zero-copy packet source.
//
// netmap-style cursors: the producer fills slots at `tail`; slots in
// [cur, tail) belong to the consumer, which hands them back by moving
// `head` (= `cur`) forward. one slot stays empty so full != empty.

use {
    std::{
        io,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        ptr::{self, NonNull},
        slice,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    },
};

const HUGE_2MB: usize = 2 * 1024 * 1024;
const CACHE_LINE: usize = 64;

/// anonymous shared mapping, released on drop
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// safety: the mapping is plain memory; access is coordinated by the ring
// cursors that own it
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn alloc(len: usize) -> io::Result<Self> {
        Self::map(len, 0)
    }

    /// back the region with huge pages; `len` is rounded up to `page_size`
    pub fn alloc_huge(len: usize, page_size: usize) -> io::Result<Self> {
        Self::map(len.next_multiple_of(page_size), libc::MAP_HUGETLB)
    }

    fn map(len: usize, extra_flags: libc::c_int) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | extra_flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// one ring descriptor
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Slot {
    pub buf_idx: u32,
    pub len: u16,
    pub flags: u16,
}

pub struct MappedRing {
    region: MappedRegion,
    num_slots: u32,
    buf_size: u32,
    buf_offset: usize,
    head: AtomicU32,
    cur: AtomicU32,
    tail: AtomicU32,
}

impl MappedRing {
    /// map a ring of `num_slots` slots with one `buf_size` buffer each.
    /// huge pages are tried first.
    pub fn new(num_slots: u32, buf_size: u16) -> io::Result<(Arc<MappedRing>, RingProducer)> {
        if num_slots < 2 || buf_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring needs at least two slots and a non-zero buffer size",
            ));
        }

        let slots_len = (num_slots as usize * std::mem::size_of::<Slot>()).next_multiple_of(CACHE_LINE);
        let len = slots_len + num_slots as usize * buf_size as usize;

        let region = MappedRegion::alloc_huge(len, HUGE_2MB).or_else(|e| {
            log::warn!("huge page ring mapping failed ({e}), falling back to regular pages");
            MappedRegion::alloc(len)
        })?;

        let ring = MappedRing {
            region,
            num_slots,
            buf_size: u32::from(buf_size),
            buf_offset: slots_len,
            head: AtomicU32::new(0),
            cur: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        };
        for i in 0..num_slots {
            // safety: i < num_slots and the region is exclusively ours here
            unsafe {
                ptr::write(
                    ring.slot_ptr(i),
                    Slot {
                        buf_idx: i,
                        len: 0,
                        flags: 0,
                    },
                )
            };
        }

        let ring = Arc::new(ring);
        let producer = RingProducer {
            ring: ring.clone(),
            doorbell: None,
        };
        Ok((ring, producer))
    }

    #[inline]
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    #[inline]
    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    #[inline]
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cur(&self) -> u32 {
        self.cur.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub fn next_slot(&self, i: u32) -> u32 {
        if i + 1 == self.num_slots {
            0
        } else {
            i + 1
        }
    }

    #[inline]
    fn distance(&self, from: u32, to: u32) -> u32 {
        if to >= from {
            to - from
        } else {
            to + self.num_slots - from
        }
    }

    /// slots ready for the consumer
    #[inline]
    pub fn space(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        self.distance(self.cur.load(Ordering::Relaxed), tail)
    }

    #[inline]
    fn slot_ptr(&self, i: u32) -> *mut Slot {
        debug_assert!(i < self.num_slots);
        unsafe { (self.region.as_ptr() as *mut Slot).add(i as usize) }
    }

    #[inline]
    fn buf_ptr(&self, buf_idx: u32) -> *mut u8 {
        debug_assert!(buf_idx < self.num_slots);
        unsafe {
            self.region
                .as_ptr()
                .add(self.buf_offset + buf_idx as usize * self.buf_size as usize)
        }
    }

    /// copy of slot `i`. only meaningful for slots in [cur, tail).
    #[inline]
    pub(crate) fn slot(&self, i: u32) -> Slot {
        // safety: slots between cur and tail are not written by the producer
        unsafe { ptr::read(self.slot_ptr(i)) }
    }

    /// payload of a consumer-owned slot
    #[inline]
    pub(crate) fn payload(&self, slot: &Slot) -> &[u8] {
        let len = u32::from(slot.len).min(self.buf_size) as usize;
        // safety: the buffer belongs to a slot the consumer owns until it
        // moves head past it, which needs &self and ends this borrow's use
        unsafe { slice::from_raw_parts(self.buf_ptr(slot.buf_idx), len) }
    }

    /// give every slot before `cursor` back to the producer
    #[inline]
    pub(crate) fn release_to(&self, cursor: u32) {
        self.cur.store(cursor, Ordering::Relaxed);
        self.head.store(cursor, Ordering::Release);
    }
}

/// eventfd the producer rings after publishing slots; the readiness handle
/// of a ring device
pub struct Doorbell {
    fd: OwnedFd,
}

impl Doorbell {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Doorbell {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn ring(&self) -> io::Result<()> {
        let val: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // counter saturated: the consumer has a wakeup pending anyway
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// consume pending wakeups so the counter never saturates
    pub fn clear(&self) -> io::Result<u64> {
        let mut val: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(val)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Doorbell {
            fd: self.fd.try_clone()?,
        })
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// the single writer of a [`MappedRing`]
pub struct RingProducer {
    ring: Arc<MappedRing>,
    doorbell: Option<Doorbell>,
}

impl RingProducer {
    pub fn with_doorbell(mut self, doorbell: Doorbell) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn ring(&self) -> &Arc<MappedRing> {
        &self.ring
    }

    /// slots the producer may still fill
    pub fn free_slots(&self) -> u32 {
        let ring = &self.ring;
        let used = ring.distance(ring.head.load(Ordering::Acquire), ring.tail.load(Ordering::Relaxed));
        ring.num_slots - 1 - used
    }

    /// publish one frame. false if the ring is full or the frame does not fit
    /// a slot buffer.
    pub fn push(&mut self, frame: &[u8]) -> bool {
        let ring = &self.ring;
        if frame.len() > ring.buf_size as usize {
            return false;
        }

        let tail = ring.tail.load(Ordering::Relaxed);
        let next = ring.next_slot(tail);
        if next == ring.head.load(Ordering::Acquire) {
            return false;
        }

        // safety: slot `tail` is outside [head, tail), so the consumer is not
        // looking at it
        unsafe {
            let slot = ring.slot_ptr(tail);
            let buf_idx = (*slot).buf_idx;
            ptr::copy_nonoverlapping(frame.as_ptr(), ring.buf_ptr(buf_idx), frame.len());
            (*slot).len = frame.len() as u16;
            (*slot).flags = 0;
        }
        ring.tail.store(next, Ordering::Release);
        true
    }

    /// wake the consumer after a burst of pushes
    pub fn notify(&self) -> io::Result<()> {
        match &self.doorbell {
            Some(d) => d.ring(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_consume_wraps() {
        let (ring, mut producer) = MappedRing::new(4, 256).unwrap();
        assert_eq!(ring.space(), 0);
        assert_eq!(producer.free_slots(), 3);

        assert!(producer.push(&[1; 10]));
        assert!(producer.push(&[2; 20]));
        assert!(producer.push(&[3; 30]));
        assert!(!producer.push(&[4; 40]), "one slot stays empty");
        assert_eq!(ring.space(), 3);

        let cur = ring.cur();
        let s = ring.slot(cur);
        assert_eq!(s.len, 10);
        assert_eq!(ring.payload(&s), &[1; 10][..]);

        ring.release_to(ring.next_slot(cur));
        assert_eq!(ring.space(), 2);
        assert_eq!(ring.head(), 1);

        assert!(producer.push(&[4; 40]));
        assert_eq!(ring.tail(), 0);
        assert_eq!(ring.space(), 3);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (_ring, mut producer) = MappedRing::new(4, 64).unwrap();
        assert!(!producer.push(&[0; 65]));
        assert!(producer.push(&[0; 64]));
    }

    #[test]
    fn test_doorbell_rings() {
        let bell = Doorbell::new().unwrap();
        assert_eq!(bell.clear().unwrap(), 0);
        bell.ring().unwrap();
        bell.ring().unwrap();
        assert_eq!(bell.clear().unwrap(), 2);
        assert_eq!(bell.clear().unwrap(), 0);
    }
}
