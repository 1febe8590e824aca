use nix::errno::Errno;
use snafu::Snafu;

use crate::{bs::BsError, core::CoreError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("failed to initialize lvs {}", name))]
    Init {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to load lvs"))]
    Load {
        source: BsError,
    },
    #[snafu(display("invalid lvs metadata: {}", msg))]
    InvalidMetadata {
        msg: String,
    },
    #[snafu(display("invalid argument: {}", msg))]
    Invalid {
        msg: String,
    },
    #[snafu(display("invalid name: {}", msg))]
    InvalidName {
        msg: String,
    },
    #[snafu(display("lvs {} already exists", name))]
    Exists {
        name: String,
    },
    #[snafu(display("lvol {} already exists", name))]
    LvolExists {
        name: String,
    },
    #[snafu(display("{} not found", name))]
    NotFound {
        name: String,
    },
    #[snafu(display("lvs {} is busy", name))]
    LvsBusy {
        name: String,
    },
    #[snafu(display("lvol {} is busy", name))]
    LvolBusy {
        name: String,
    },
    #[snafu(display("lvol {} is not open", name))]
    LvolNotOpen {
        name: String,
    },
    #[snafu(display("failed to create lvol {}", name))]
    LvolCreate {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to open lvol {}", name))]
    LvolOpen {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to destroy lvol {}", name))]
    LvolDestroy {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to sync metadata of {}", name))]
    SyncFailed {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to unload lvs {}", name))]
    Unload {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to destroy lvs {}", name))]
    Destroy {
        source: BsError,
        name: String,
    },
    #[snafu(display("failed to grow lvs"))]
    Grow {
        source: BsError,
    },
    #[snafu(display("invalid bdev {}", name))]
    InvalidBdev {
        source: CoreError,
        name: String,
    },
    #[snafu(display("io failure on lvol {}", name))]
    Io {
        source: BsError,
        name: String,
    },
    #[snafu(display("lvol operation on {} failed", name))]
    BlobOp {
        source: BsError,
        name: String,
    },
}

impl Error {
    /// the errno this error maps onto at the API boundary
    pub fn errno(&self) -> Errno {
        match self {
            Error::Init {
                source, ..
            }
            | Error::Load {
                source,
            }
            | Error::LvolCreate {
                source, ..
            }
            | Error::LvolOpen {
                source, ..
            }
            | Error::LvolDestroy {
                source, ..
            }
            | Error::SyncFailed {
                source, ..
            }
            | Error::Unload {
                source, ..
            }
            | Error::Destroy {
                source, ..
            }
            | Error::Grow {
                source,
            }
            | Error::Io {
                source, ..
            }
            | Error::BlobOp {
                source, ..
            } => source.errno(),
            Error::InvalidMetadata {
                ..
            }
            | Error::Invalid {
                ..
            }
            | Error::InvalidName {
                ..
            } => Errno::EINVAL,
            Error::Exists {
                ..
            }
            | Error::LvolExists {
                ..
            } => Errno::EEXIST,
            Error::NotFound {
                ..
            } => Errno::ENODEV,
            Error::LvsBusy {
                ..
            }
            | Error::LvolBusy {
                ..
            } => Errno::EBUSY,
            Error::LvolNotOpen {
                ..
            } => Errno::EINVAL,
            Error::InvalidBdev {
                source, ..
            } => source.errno(),
        }
    }
}
