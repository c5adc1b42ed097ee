// edge-triggered epoll front end: turns descriptor readiness into pending bits

use {
    crate::{device::ReadyHandle, scheduler::Notifier},
    ahash::AHashSet,
    libc::{epoll_event, EPOLLET, EPOLLIN, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL},
    std::{
        io::{self, Error},
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    },
};

pub struct ReadinessPoller {
    epfd: OwnedFd,
    events: Vec<epoll_event>,
    registered: AHashSet<ReadyHandle>,
}

impl ReadinessPoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
            registered: AHashSet::new(),
        })
    }

    /// watch `handle` for input, edge-triggered
    pub fn register(&mut self, handle: ReadyHandle) -> io::Result<()> {
        let mut ev = epoll_event {
            events: (EPOLLIN | EPOLLET) as u32,
            u64: handle.0 as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), EPOLL_CTL_ADD, handle.0, &mut ev) } < 0 {
            return Err(Error::last_os_error());
        }
        self.registered.insert(handle);
        Ok(())
    }

    pub fn deregister(&mut self, handle: ReadyHandle) -> io::Result<()> {
        if !self.registered.remove(&handle) {
            return Ok(());
        }
        let mut ev = epoll_event { events: 0, u64: 0 };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), EPOLL_CTL_DEL, handle.0, &mut ev) } < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn is_registered(&self, handle: ReadyHandle) -> bool {
        self.registered.contains(&handle)
    }

    /// wait up to `timeout_ms` (-1 blocks) and mark every ready handle.
    /// returns the number of devices marked; an interrupted wait marks none.
    pub fn poll(&mut self, timeout_ms: i32, notifier: &Notifier) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut marked = 0;
        for ev in &self.events[..n as usize] {
            // epoll_event is packed on x86_64; copy the field out
            let data = { ev.u64 };
            if notifier.mark_ready(ReadyHandle(data as i32)) {
                marked += 1;
            }
        }
        Ok(marked)
    }
}

impl AsRawFd for ReadinessPoller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}
