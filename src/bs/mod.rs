//!
//! The blobstore layer: the back-device contract a blob reads its
//! unallocated clusters through, the concrete read-only back-device
//! variants, and the store of blobs the volume layer is built on.

use nix::errno::Errno;
use snafu::Snafu;

pub use blob::{Blob, BlobBsDev, BlobId, ClearMethod};
pub use bs_dev::{BsDev, BsDevChannel, ExtIoOpts, MemoryDomain};
pub use eio::EioBsDev;
pub use store::{
    BlobOpenOpts,
    BlobOpts,
    Blobstore,
    BsIoChannel,
    BsOpts,
    EsnapDevFactory,
};
pub use zeroes::ZeroesBsDev;

mod blob;
mod bs_dev;
mod eio;
mod store;
mod zeroes;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum BsError {
    #[snafu(display("write issued to a read-only back device"))]
    WriteProtected {
        source: Errno,
    },
    #[snafu(display("read failed at lba {} of count {}", lba, lba_count))]
    ReadError {
        source: Errno,
        lba: u64,
        lba_count: u64,
    },
    #[snafu(display("extended io options not supported"))]
    ExtOptsUnsupported {
        source: Errno,
    },
    #[snafu(display("no channel available"))]
    NoChannel {
        source: Errno,
    },
    #[snafu(display("blob {:#x} not found", id))]
    BlobNotFound {
        id: u64,
    },
    #[snafu(display("blob {:#x} is busy", id))]
    BlobBusy {
        id: u64,
    },
    #[snafu(display("blob {:#x} has clones", id))]
    HasClones {
        id: u64,
    },
    #[snafu(display("blob {:#x} is read-only", id))]
    ReadOnly {
        id: u64,
    },
    #[snafu(display("blobstore type mismatch"))]
    BadBsType {
        source: Errno,
    },
    #[snafu(display("invalid argument: {}", msg))]
    InvalidArgument {
        msg: String,
    },
    #[snafu(display("metadata sync failed"))]
    MdSync {
        source: Errno,
    },
    #[snafu(display("device {} not found", name))]
    NoDevice {
        name: String,
    },
    #[snafu(display("esnap device creation failed"))]
    EsnapCreate {
        source: Errno,
    },
}

impl BsError {
    /// the errno this error maps onto at the API boundary
    pub fn errno(&self) -> Errno {
        match self {
            BsError::WriteProtected {
                source,
            } => *source,
            BsError::ReadError {
                source, ..
            } => *source,
            BsError::ExtOptsUnsupported {
                source,
            } => *source,
            BsError::NoChannel {
                source,
            } => *source,
            BsError::BlobNotFound {
                ..
            } => Errno::ENOENT,
            BsError::BlobBusy {
                ..
            }
            | BsError::HasClones {
                ..
            } => Errno::EBUSY,
            BsError::ReadOnly {
                ..
            } => Errno::EPERM,
            BsError::BadBsType {
                source,
            } => *source,
            BsError::InvalidArgument {
                ..
            } => Errno::EINVAL,
            BsError::MdSync {
                source,
            } => *source,
            BsError::NoDevice {
                ..
            } => Errno::ENODEV,
            BsError::EsnapCreate {
                source,
            } => *source,
        }
    }
}
