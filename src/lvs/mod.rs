//!
//! The logical volume store: named, snapshottable, cloneable thin volumes
//! inside one blobstore, with external snapshot (esnap) support and
//! degraded-mode recovery when an esnap device is missing.

pub use lvs_error::Error;
pub use lvs_esnap::{esnap_notify_bdev_add, EsnapMissing};
pub use lvs_lvol::Lvol;
pub use lvs_store::{Lvs, LvsOpts};

mod lvs_error;
mod lvs_esnap;
mod lvs_lvol;
mod lvs_store;

/// maximum lvs name length, terminator included
pub const LVS_NAME_MAX: usize = 64;
/// maximum lvol name length, terminator included
pub const LVOL_NAME_MAX: usize = 64;
/// length of a canonical uuid string, terminator included
pub const UUID_STRING_LEN: usize = 37;

/// the blobstore type tag of a volume store
pub(crate) const LVS_BSTYPE: &str = "LVOLSTORE";

pub(crate) const LVOL_NAME_XATTR: &str = "name";
pub(crate) const LVOL_UUID_XATTR: &str = "uuid";

/// xattr values are stored the way the disk format keeps them: terminated
pub(crate) fn terminated(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

/// decode a terminated xattr value back into a string
pub(crate) fn from_terminated(v: &[u8]) -> Option<String> {
    let bytes = match v.split_last() {
        Some((0, rest)) => rest,
        _ => v,
    };
    String::from_utf8(bytes.to_vec()).ok()
}
