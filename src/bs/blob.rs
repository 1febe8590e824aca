use std::{
    cell::Cell,
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bs::{
    store::BsInner,
    BsDev,
    BsError,
    BsIoChannel,
    Blobstore,
};

pub type BlobId = u64;

/// How a blob's clusters are cleared when the blob is deleted or unmapped.
/// Carried through create and open; the store treats it as policy metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMethod {
    Default,
    None,
    Unmap,
    WriteZeroes,
}

impl Default for ClearMethod {
    fn default() -> Self {
        ClearMethod::Default
    }
}

pub(crate) struct BlobRec {
    pub(crate) id: BlobId,
    pub(crate) state: Mutex<BlobState>,
}

pub(crate) struct BlobState {
    pub(crate) xattrs: HashMap<String, Vec<u8>>,
    pub(crate) clusters: Vec<Option<Box<[u8]>>>,
    pub(crate) thin: bool,
    pub(crate) read_only: bool,
    pub(crate) parent: Option<BlobId>,
    pub(crate) esnap_cookie: Option<Vec<u8>>,
    pub(crate) back: Option<Arc<dyn BsDev>>,
    pub(crate) open_count: u32,
    pub(crate) clear_method: ClearMethod,
}

/// An open handle onto a blob. Handles must be closed; a handle dropped
/// without closing releases its reference but skips back-device teardown.
pub struct Blob {
    pub(crate) bs: Blobstore,
    pub(crate) rec: Arc<BlobRec>,
    pub(crate) closed: Cell<bool>,
}

impl Blob {
    pub fn id(&self) -> BlobId {
        self.rec.id
    }

    pub fn bs(&self) -> &Blobstore {
        &self.bs
    }

    pub fn xattr(&self, name: &str) -> Option<Vec<u8>> {
        self.rec.state.lock().xattrs.get(name).cloned()
    }

    pub fn set_xattr(&self, name: &str, value: &[u8]) {
        self.rec
            .state
            .lock()
            .xattrs
            .insert(name.to_string(), value.to_vec());
    }

    /// Persist the blob's metadata. All in-memory metadata updates become
    /// durable only once this succeeds.
    pub async fn sync_md(&self) -> Result<(), BsError> {
        self.bs.md_sync_point()
    }

    pub async fn close(self) -> Result<(), BsError> {
        self.closed.set(true);
        self.bs.close_blob(&self.rec).await
    }

    pub async fn resize(&self, num_clusters: u64) -> Result<(), BsError> {
        let mut state = self.rec.state.lock();
        if state.read_only {
            return Err(BsError::ReadOnly {
                id: self.rec.id,
            });
        }
        state.clusters.resize(num_clusters as usize, None);
        Ok(())
    }

    pub fn set_read_only(&self) {
        self.rec.state.lock().read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.rec.state.lock().read_only
    }

    pub fn is_thin(&self) -> bool {
        self.rec.state.lock().thin
    }

    pub fn is_clone(&self) -> bool {
        self.rec.state.lock().parent.is_some()
    }

    /// true when this blob's parent is an external device
    pub fn is_esnap_clone(&self) -> bool {
        self.rec.state.lock().esnap_cookie.is_some()
    }

    /// the opaque identifier of the external parent, when there is one
    pub fn external_cookie(&self) -> Option<Vec<u8>> {
        self.rec.state.lock().esnap_cookie.clone()
    }

    pub fn num_clusters(&self) -> u64 {
        self.rec.state.lock().clusters.len() as u64
    }

    pub fn allocated_clusters(&self) -> u64 {
        self.rec
            .state
            .lock()
            .clusters
            .iter()
            .filter(|c| c.is_some())
            .count() as u64
    }

    /// blob ids cloned from this blob
    pub fn clones(&self) -> Vec<BlobId> {
        self.bs.get_clones(self.rec.id)
    }

    /// read `buf.len()` bytes starting at the given io-unit offset
    pub async fn read(
        &self,
        _ch: &BsIoChannel,
        buf: &mut [u8],
        offset_io_units: u64,
    ) -> Result<(), BsError> {
        self.bs.read_blob_inner(self.rec.id, buf, offset_io_units).await
    }

    /// write `buf.len()` bytes starting at the given io-unit offset
    pub async fn write(
        &self,
        _ch: &BsIoChannel,
        buf: &[u8],
        offset_io_units: u64,
    ) -> Result<(), BsError> {
        self.bs.write_blob_inner(&self.rec, buf, offset_io_units).await
    }

    /// Install a new back device on an esnap clone, tearing down the one it
    /// replaces. This is the hotplug entry point.
    pub async fn set_esnap_bs_dev(
        &self,
        dev: Box<dyn BsDev>,
    ) -> Result<(), BsError> {
        let old = {
            let mut state = self.rec.state.lock();
            if state.esnap_cookie.is_none() {
                return Err(BsError::InvalidArgument {
                    msg: format!(
                        "blob {:#x} is not an esnap clone",
                        self.rec.id
                    ),
                });
            }
            state.back.replace(Arc::from(dev))
        };
        if let Some(old) = old {
            old.destroy().await;
        }
        Ok(())
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if !self.closed.get() {
            warn!("blob {:#x} handle dropped without close", self.rec.id);
            self.rec.state.lock().open_count -= 1;
        }
    }
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blob {:#x}", self.rec.id)
    }
}

/// Back device reading from another blob of the same store: the parent of a
/// regular snapshot clone.
pub struct BlobBsDev {
    bs: Weak<BsInner>,
    blob_id: BlobId,
    blocklen: u32,
    blockcnt: u64,
}

impl BlobBsDev {
    pub(crate) fn new(bs: &Blobstore, blob_id: BlobId) -> Self {
        let io_unit = bs.io_unit_size();
        let blockcnt = bs
            .blob_num_clusters(blob_id)
            .unwrap_or(0)
            * (bs.cluster_size() / io_unit as u64);
        Self {
            bs: Arc::downgrade(&bs.0),
            blob_id,
            blocklen: io_unit,
            blockcnt,
        }
    }
}

#[async_trait(?Send)]
impl BsDev for BlobBsDev {
    fn blocklen(&self) -> u32 {
        self.blocklen
    }

    fn blockcnt(&self) -> u64 {
        self.blockcnt
    }

    async fn read(
        &self,
        buf: &mut [u8],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        let bs = match self.bs.upgrade() {
            Some(bs) => Blobstore(bs),
            None => {
                return Err(BsError::ReadError {
                    source: nix::errno::Errno::ENODEV,
                    lba,
                    lba_count: lba_count as u64,
                })
            }
        };
        bs.read_blob_inner(self.blob_id, buf, lba).await
    }

    async fn readv(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        let mut offset = lba;
        let mut left = lba_count as u64;
        for iov in iovs.iter_mut() {
            let units = (iov.len() as u64 / self.blocklen as u64).min(left);
            if units == 0 {
                break;
            }
            let bytes = (units * self.blocklen as u64) as usize;
            self.read(&mut iov[.. bytes], offset, units as u32).await?;
            offset += units;
            left -= units;
        }
        Ok(())
    }
}
