use {
    crate::{
        buffer::BufferHandle,
        device::{DeviceId, ReadyHandle},
    },
    std::io,
    thiserror::Error,
};

/// per-packet and per-device receive errors. none of these stop a drain loop.
#[derive(Debug, Error)]
pub enum RxError {
    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("read would block")]
    ReadWouldBlock,

    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("pending set is full ({0} devices)")]
    TooManyDevices(usize),

    #[error("readiness handle {0} already registered")]
    DuplicateHandle(ReadyHandle),

    #[error("no active device {0}")]
    UnknownDevice(DeviceId),

    #[error("readiness registration failed: {0}")]
    Poller(#[source] io::Error),
}

/// chain invariant violations reported by [`crate::chain::validate_chain`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("{0} is not owned by a chain")]
    NotClaimed(BufferHandle),

    #[error("{0} appears twice in the chain")]
    Duplicated(BufferHandle),

    #[error("{0} has a next handle but no next-present flag")]
    MissingNextFlag(BufferHandle),

    #[error("{0} has the next-present flag but no next handle")]
    DanglingNext(BufferHandle),

    #[error("{0} has a non-zero duplication count")]
    Cloned(BufferHandle),

    #[error("head declares {declared} bytes, segments hold {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("device provisioning is disabled")]
    Disabled,

    #[error("unknown device handle {0}")]
    UnknownHandle(ReadyHandle),

    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

/// trace log configuration rejected; the log keeps its previous state
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("trace log capacity must be non-zero")]
    ZeroCapacity,

    #[error("trace log capacity {0} cannot be rounded to a power of two")]
    CapacityOverflow(usize),

    #[error("trace log is enabled; stop it before reconfiguring")]
    LogLive,

    #[error("trace log is not configured")]
    NotConfigured,
}
