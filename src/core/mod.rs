//!
//! core contains the primary abstractions the volume layer is built on: the
//! reactor model, the block device registry with its descriptors, channels
//! and claims, and the error type shared by all of them.

use nix::errno::Errno;
use snafu::Snafu;

pub use bdev::{Bdev, BdevOps, BdevParams};
pub use channel::IoChannel;
pub use cpu_cores::Cores;
pub use descriptor::DescriptorGuard;
pub use env::EngineEnvironment;
pub use reactor::{Reactor, ReactorState, Reactors, REACTOR_LIST};

mod bdev;
mod channel;
mod cpu_cores;
mod descriptor;
mod env;
mod reactor;

/// the I/O types a block device may support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Unmap,
    WriteZeroes,
    Reset,
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CoreError {
    #[snafu(display("bdev {} not found", name))]
    BdevNotFound {
        name: String,
    },
    #[snafu(display("bdev {} already exists", name))]
    BdevExists {
        name: String,
    },
    #[snafu(display("failed to open bdev"))]
    OpenBdev {
        source: Errno,
    },
    #[snafu(display("bdev {} already claimed by module {}", name, claimed_by))]
    BdevClaimed {
        name: String,
        claimed_by: String,
    },
    #[snafu(display("invalid parameters for {}: {}", name, msg))]
    InvalidParams {
        name: String,
        msg: String,
    },
    #[snafu(display(
        "read failed at offset {} of length {}",
        offset,
        len
    ))]
    ReadFailed {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "write failed at offset {} of length {}",
        offset,
        len
    ))]
    WriteFailed {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display("operation not supported"))]
    NotSupported {
        source: Errno,
    },
    #[snafu(display("failed to get an io channel"))]
    GetIoChannel {
        source: Errno,
    },
}

impl CoreError {
    /// the errno this error maps onto at the API boundary
    pub fn errno(&self) -> Errno {
        match self {
            CoreError::BdevNotFound {
                ..
            } => Errno::ENODEV,
            CoreError::BdevExists {
                ..
            } => Errno::EEXIST,
            CoreError::OpenBdev {
                source,
            } => *source,
            CoreError::BdevClaimed {
                ..
            } => Errno::EPERM,
            CoreError::InvalidParams {
                ..
            } => Errno::EINVAL,
            CoreError::ReadFailed {
                source, ..
            } => *source,
            CoreError::WriteFailed {
                source, ..
            } => *source,
            CoreError::NotSupported {
                source,
            } => *source,
            CoreError::GetIoChannel {
                source,
            } => *source,
        }
    }
}
