//!
//! Block device modules: the in-memory malloc device, the device-backed
//! blobstore back-device, the external-snapshot back-device with its
//! per-thread channel table, the read-only facade, and the wait device.

pub use blob_bdev::BdevBsDev;
pub use esnap::EsnapBsDev;
pub use malloc::create_malloc_bdev;
pub use ro::{
    claim_bdev_shared,
    create_ro_bdev,
    delete_ro_bdev,
    ro_base_bdev,
    ClaimGuard,
    RoBdevOpts,
};
pub use wait::{create_wait_bdev, delete_wait_bdev};

mod blob_bdev;
mod esnap;
mod malloc;
mod ro;
mod wait;
