use std::{
    any::Any,
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    bs::{Blob, BlobId, BlobOpenOpts, BlobOpts, ClearMethod},
    core::Bdev,
    lvs::{
        from_terminated,
        lvs_esnap::EsnapMissing,
        terminated,
        Error,
        Lvs,
        LVOL_NAME_MAX,
        LVOL_NAME_XATTR,
        LVOL_UUID_XATTR,
        UUID_STRING_LEN,
    },
};

/// A logical volume: a blob with a name, a uuid and a lifecycle.
pub struct Lvol {
    pub(crate) lvs: Weak<Lvs>,
    pub(crate) name: Mutex<String>,
    /// canonical uuid string, empty when the uuid xattr was unusable
    pub(crate) uuid_str: Mutex<String>,
    pub(crate) unique_id: Mutex<String>,
    pub(crate) blob_id: Mutex<Option<BlobId>>,
    pub(crate) blob: Mutex<Option<Blob>>,
    pub(crate) thin: AtomicBool,
    pub(crate) clear_method: Mutex<ClearMethod>,
    pub(crate) ref_count: AtomicU32,
    pub(crate) action_in_progress: AtomicBool,
    /// set while this lvol waits for its external snapshot device
    pub(crate) missing: Mutex<Option<Arc<EsnapMissing>>>,
}

impl Lvol {
    fn new_with_uuid(
        lvs: &Arc<Lvs>,
        name: &str,
        uuid_str: String,
        unique_id: String,
        blob_id: Option<BlobId>,
        thin: bool,
        clear_method: ClearMethod,
    ) -> Arc<Lvol> {
        Arc::new(Lvol {
            lvs: Arc::downgrade(lvs),
            name: Mutex::new(name.to_string()),
            uuid_str: Mutex::new(uuid_str),
            unique_id: Mutex::new(unique_id),
            blob_id: Mutex::new(blob_id),
            blob: Mutex::new(None),
            thin: AtomicBool::new(thin),
            clear_method: Mutex::new(clear_method),
            ref_count: AtomicU32::new(0),
            action_in_progress: AtomicBool::new(false),
            missing: Mutex::new(None),
        })
    }

    pub(crate) fn from_load(
        lvs: &Arc<Lvs>,
        name: String,
        uuid_str: String,
        unique_id: String,
        blob_id: BlobId,
        thin: bool,
    ) -> Arc<Lvol> {
        Self::new_with_uuid(
            lvs,
            &name,
            uuid_str,
            unique_id,
            Some(blob_id),
            thin,
            ClearMethod::Default,
        )
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn uuid_str(&self) -> String {
        self.uuid_str.lock().clone()
    }

    pub fn unique_id(&self) -> String {
        self.unique_id.lock().clone()
    }

    pub fn blob_id(&self) -> Option<BlobId> {
        *self.blob_id.lock()
    }

    pub fn refs(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub fn is_thin(&self) -> bool {
        self.thin.load(Ordering::Relaxed)
    }

    pub fn clear_method(&self) -> ClearMethod {
        *self.clear_method.lock()
    }

    pub fn action_in_progress(&self) -> bool {
        self.action_in_progress.load(Ordering::Relaxed)
    }

    /// an esnap clone whose device is absent is degraded
    pub fn is_degraded(&self) -> bool {
        self.missing.lock().is_some()
    }

    pub fn lvs(&self) -> Result<Arc<Lvs>, Error> {
        self.lvs.upgrade().ok_or_else(|| Error::NotFound {
            name: "lvol store".to_string(),
        })
    }

    pub fn is_esnap_clone(&self) -> bool {
        match (self.lvs.upgrade(), self.blob_id()) {
            (Some(lvs), Some(id)) => lvs.bs().blob_is_esnap_clone(id),
            _ => false,
        }
    }

    /// size in bytes
    pub fn size(&self) -> u64 {
        match (self.lvs.upgrade(), self.blob_id()) {
            (Some(lvs), Some(id)) => {
                lvs.bs().blob_num_clusters(id).unwrap_or(0)
                    * lvs.bs().cluster_size()
            }
            _ => 0,
        }
    }

    fn blob_id_or(&self) -> Result<BlobId, Error> {
        self.blob_id().ok_or_else(|| Error::NotFound {
            name: self.name(),
        })
    }

    fn with_blob<R>(&self, f: impl FnOnce(&Blob) -> R) -> Result<R, Error> {
        let guard = self.blob.lock();
        match guard.as_ref() {
            Some(blob) => Ok(f(blob)),
            None => Err(Error::LvolNotOpen {
                name: self.name(),
            }),
        }
    }

    pub(crate) fn create_xattrs(&self) -> Vec<(String, Vec<u8>)> {
        vec![
            (LVOL_NAME_XATTR.to_string(), terminated(&self.name())),
            (LVOL_UUID_XATTR.to_string(), terminated(&self.uuid_str())),
        ]
    }

    /// Open the lvol. Opening an already open lvol takes another
    /// reference.
    pub async fn open(self: &Arc<Self>) -> Result<(), Error> {
        if self.action_in_progress() {
            error!("cannot open lvol - operations on lvol pending");
            return Err(Error::LvolBusy {
                name: self.name(),
            });
        }
        if self.refs() > 0 {
            self.ref_count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let lvs = self.lvs()?;
        let blob_id = self.blob_id_or()?;
        let blob = lvs
            .bs()
            .open_blob(
                blob_id,
                BlobOpenOpts {
                    clear_method: Some(self.clear_method()),
                    external_ctx: Some(
                        self.clone() as Arc<dyn Any + Send + Sync>
                    ),
                },
            )
            .await
            .map_err(|e| {
                info!("failed to open lvol {}", self.unique_id());
                Error::LvolOpen {
                    source: e,
                    name: self.name(),
                }
            })?;

        *self.blob.lock() = Some(blob);
        self.ref_count.store(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop one reference; the last close closes the blob.
    pub async fn close(&self) -> Result<(), Error> {
        match self.refs() {
            0 => {
                return Err(Error::LvolNotOpen {
                    name: self.name(),
                })
            }
            1 => {}
            _ => {
                self.ref_count.fetch_sub(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.action_in_progress.store(true, Ordering::Relaxed);
        let blob = self.blob.lock().take();
        let res = match blob {
            Some(blob) => blob.close().await,
            None => Ok(()),
        };
        self.ref_count.store(0, Ordering::Relaxed);
        self.action_in_progress.store(false, Ordering::Relaxed);

        match res {
            Ok(()) => {
                info!("lvol {} closed", self.unique_id());
                Ok(())
            }
            Err(e) => {
                error!("could not close blob on lvol {}", self.unique_id());
                Err(Error::BlobOp {
                    source: e,
                    name: self.name(),
                })
            }
        }
    }

    /// Destroy the lvol: delete its blob and drop it from the catalog. If
    /// the deleted lvol shared its external parent with exactly one other
    /// clone, the wait for a missing device moves to that clone.
    pub async fn destroy(self: &Arc<Self>) -> Result<(), Error> {
        if self.refs() != 0 {
            error!(
                "cannot destroy lvol {} because it is still open",
                self.unique_id()
            );
            return Err(Error::LvolBusy {
                name: self.name(),
            });
        }

        self.action_in_progress.store(true, Ordering::Relaxed);

        let lvs = match self.lvs() {
            Ok(lvs) => lvs,
            Err(e) => {
                self.action_in_progress.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };
        let blob_id = match self.blob_id_or() {
            Ok(id) => id,
            Err(e) => {
                self.action_in_progress.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };

        let bs = lvs.bs();
        let mut sibling = None;
        if bs.blob_is_esnap_clone(blob_id) {
            let clones = bs.get_clones(blob_id);
            if clones.len() == 1 {
                sibling = lvs.lvol_by_blob_id(clones[0]);
            }
        }

        match bs.delete_blob(blob_id).await {
            Err(e) => {
                self.action_in_progress.store(false, Ordering::Relaxed);
                error!("{:?}: could not remove blob", self);
                Err(Error::LvolDestroy {
                    source: e,
                    name: self.name(),
                })
            }
            Ok(()) => {
                lvs.esnap_missing_swap(self, sibling.as_ref());
                lvs.esnap_missing_remove(self);
                lvs.remove_lvol(self);
                self.action_in_progress.store(false, Ordering::Relaxed);
                info!("{:?}: destroyed", self);
                Ok(())
            }
        }
    }

    /// true iff no clones depend on this lvol
    pub fn deletable(&self) -> bool {
        match (self.lvs.upgrade(), self.blob_id()) {
            (Some(lvs), Some(id)) => lvs.bs().get_clones(id).is_empty(),
            _ => true,
        }
    }

    pub async fn resize(&self, size: u64) -> Result<(), Error> {
        let lvs = self.lvs()?;
        let bs = lvs.bs();
        let blob_id = self.blob_id_or()?;
        let new_clusters =
            (size + bs.cluster_size() - 1) / bs.cluster_size();

        bs.resize_blob(blob_id, new_clusters).await.map_err(|e| {
            Error::BlobOp {
                source: e,
                name: self.name(),
            }
        })?;
        bs.sync_blob_md(blob_id).await.map_err(|e| Error::SyncFailed {
            source: e,
            name: self.name(),
        })
    }

    pub async fn set_read_only(&self) -> Result<(), Error> {
        let lvs = self.lvs()?;
        let bs = lvs.bs();
        let blob_id = self.blob_id_or()?;

        bs.set_blob_read_only(blob_id).await.map_err(|e| {
            Error::BlobOp {
                source: e,
                name: self.name(),
            }
        })?;
        bs.sync_blob_md(blob_id).await.map_err(|e| Error::SyncFailed {
            source: e,
            name: self.name(),
        })
    }

    /// Rename the lvol. The in-memory name changes only after the metadata
    /// sync has made the new name durable.
    pub async fn rename(&self, new_name: &str) -> Result<(), Error> {
        let old_name = self.name();
        if old_name == new_name {
            return Ok(());
        }

        let lvs = self.lvs()?;
        if lvs.lookup_lvol(new_name).is_some() {
            error!(
                "lvol {} already exists in lvol store {}",
                new_name,
                lvs.name()
            );
            return Err(Error::LvolExists {
                name: new_name.to_string(),
            });
        }

        self.with_blob(|blob| {
            blob.set_xattr(LVOL_NAME_XATTR, &terminated(new_name))
        })?;

        match lvs.bs().sync_blob_md(self.blob_id_or()?).await {
            Ok(()) => {
                *self.name.lock() = new_name.to_string();
                Ok(())
            }
            Err(e) => {
                error!("lvol rename operation failed");
                // the new name never hit the media
                self.with_blob(|blob| {
                    blob.set_xattr(LVOL_NAME_XATTR, &terminated(&old_name))
                })?;
                Err(Error::SyncFailed {
                    source: e,
                    name: old_name,
                })
            }
        }
    }

    /// allocate all clusters locally, dropping the parent entirely
    pub async fn inflate(&self) -> Result<(), Error> {
        let lvs = self.lvs()?;
        let bs = lvs.bs();
        let ch = bs.alloc_io_channel();
        bs.inflate_blob(&ch, self.blob_id_or()?).await.map_err(|e| {
            error!("could not inflate lvol {}", self.unique_id());
            Error::BlobOp {
                source: e,
                name: self.name(),
            }
        })
    }

    /// take over the clusters of the immediate parent
    pub async fn decouple_parent(&self) -> Result<(), Error> {
        let lvs = self.lvs()?;
        let bs = lvs.bs();
        let ch = bs.alloc_io_channel();
        bs.decouple_parent(&ch, self.blob_id_or()?).await.map_err(|e| {
            Error::BlobOp {
                source: e,
                name: self.name(),
            }
        })
    }

    /// Snapshot this lvol. A degraded original hands the wait for its
    /// missing device over to the snapshot, which now owns the external
    /// parent.
    pub async fn create_snapshot(
        self: &Arc<Self>,
        snap_name: &str,
    ) -> Result<Arc<Lvol>, Error> {
        let lvs = self.lvs()?;
        lvs.verify_lvol_name(snap_name)?;

        let newlvol = lvs.lvol_alloc(snap_name, true, self.clear_method());
        match lvs
            .bs()
            .snapshot(self.blob_id_or()?, newlvol.create_xattrs())
            .await
        {
            Err(e) => {
                lvs.pending_remove(&newlvol);
                Err(Error::LvolCreate {
                    source: e,
                    name: snap_name.to_string(),
                })
            }
            Ok(snap_id) => {
                *newlvol.blob_id.lock() = Some(snap_id);
                lvs.finish_create(newlvol, Some(self)).await
            }
        }
    }

    /// Clone this (read-only) lvol. The clone of an esnap clone is a
    /// regular clone.
    pub async fn create_clone(
        self: &Arc<Self>,
        clone_name: &str,
    ) -> Result<Arc<Lvol>, Error> {
        let lvs = self.lvs()?;
        lvs.verify_lvol_name(clone_name)?;

        let newlvol = lvs.lvol_alloc(clone_name, true, self.clear_method());
        match lvs
            .bs()
            .clone_blob(self.blob_id_or()?, newlvol.create_xattrs())
            .await
        {
            Err(e) => {
                lvs.pending_remove(&newlvol);
                Err(Error::LvolCreate {
                    source: e,
                    name: clone_name.to_string(),
                })
            }
            Ok(clone_id) => {
                *newlvol.blob_id.lock() = Some(clone_id);
                lvs.finish_create(newlvol, None).await
            }
        }
    }

    /// read `buf.len()` bytes at the given io-unit offset
    pub async fn read_at(
        &self,
        offset_io_units: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let lvs = self.lvs()?;
        let bs = lvs.bs();
        let ch = bs.alloc_io_channel();
        bs.read_blob(&ch, self.blob_id_or()?, buf, offset_io_units)
            .await
            .map_err(|e| Error::Io {
                source: e,
                name: self.name(),
            })
    }

    /// write `buf.len()` bytes at the given io-unit offset
    pub async fn write_at(
        &self,
        offset_io_units: u64,
        buf: &[u8],
    ) -> Result<(), Error> {
        let lvs = self.lvs()?;
        let bs = lvs.bs();
        let ch = bs.alloc_io_channel();
        bs.write_blob(&ch, self.blob_id_or()?, buf, offset_io_units)
            .await
            .map_err(|e| Error::Io {
                source: e,
                name: self.name(),
            })
    }
}

impl Debug for Lvol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let store = self
            .lvs
            .upgrade()
            .map(|l| l.name())
            .unwrap_or_else(|| "<gone>".to_string());
        write!(f, "Lvol '{}/{}' [{}]", store, self.name(), self.unique_id())
    }
}

impl Lvs {
    pub(crate) fn verify_lvol_name(&self, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            info!("lvol name not provided");
            return Err(Error::InvalidName {
                msg: "no name specified".to_string(),
            });
        }
        if name.len() >= LVOL_NAME_MAX {
            error!("name has no null terminator");
            return Err(Error::InvalidName {
                msg: format!("'{}' has no null terminator", name),
            });
        }
        if self.lvols.lock().iter().any(|l| l.name() == name) {
            error!("lvol with name {} already exists", name);
            return Err(Error::LvolExists {
                name: name.to_string(),
            });
        }
        if self.pending.lock().iter().any(|l| l.name() == name) {
            error!("lvol with name {} is being already created", name);
            return Err(Error::LvolExists {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn lvol_alloc(
        self: &Arc<Self>,
        name: &str,
        thin: bool,
        clear_method: ClearMethod,
    ) -> Arc<Lvol> {
        let uuid = Uuid::new_v4().to_string();
        let lvol = Lvol::new_with_uuid(
            self,
            name,
            uuid.clone(),
            uuid,
            None,
            thin,
            clear_method,
        );
        self.pending.lock().push(lvol.clone());
        lvol
    }

    pub(crate) fn pending_remove(&self, lvol: &Arc<Lvol>) {
        self.pending.lock().retain(|l| !Arc::ptr_eq(l, lvol));
    }

    pub(crate) fn remove_lvol(&self, lvol: &Arc<Lvol>) {
        self.lvols.lock().retain(|l| !Arc::ptr_eq(l, lvol));
    }

    /// look up an lvol by name
    pub fn lookup_lvol(&self, name: &str) -> Option<Arc<Lvol>> {
        self.lvols.lock().iter().find(|l| l.name() == name).cloned()
    }

    pub(crate) fn lvol_by_blob_id(&self, blob_id: BlobId) -> Option<Arc<Lvol>> {
        self.lvols
            .lock()
            .iter()
            .find(|l| l.blob_id() == Some(blob_id))
            .cloned()
    }

    /// snapshot of the catalog
    pub fn lvols(&self) -> Vec<Arc<Lvol>> {
        self.lvols.lock().clone()
    }

    /// Open the blob belonging to a freshly created lvol and promote it
    /// from pending to the catalog. Ownership of a missing-device wait
    /// moves from `swap_from` before the open, so that an esnap clone
    /// being snapshotted hands its wait to the snapshot.
    pub(crate) async fn finish_create(
        self: &Arc<Self>,
        lvol: Arc<Lvol>,
        swap_from: Option<&Arc<Lvol>>,
    ) -> Result<Arc<Lvol>, Error> {
        self.esnap_missing_swap(&lvol, swap_from);

        let blob_id = match lvol.blob_id() {
            Some(id) => id,
            None => {
                self.pending_remove(&lvol);
                return Err(Error::NotFound {
                    name: lvol.name(),
                });
            }
        };

        let res = self
            .bs()
            .open_blob(
                blob_id,
                BlobOpenOpts {
                    clear_method: Some(lvol.clear_method()),
                    external_ctx: Some(
                        lvol.clone() as Arc<dyn Any + Send + Sync>
                    ),
                },
            )
            .await;

        match res {
            Err(e) => {
                self.pending_remove(&lvol);
                Err(Error::LvolCreate {
                    source: e,
                    name: lvol.name(),
                })
            }
            Ok(blob) => {
                self.pending_remove(&lvol);
                *lvol.blob.lock() = Some(blob);
                lvol.ref_count.store(1, Ordering::Relaxed);
                self.lvols.lock().push(lvol.clone());
                info!("{:?}: created", lvol);
                Ok(lvol)
            }
        }
    }

    /// Create a new lvol on this store.
    pub async fn create_lvol(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        thin: bool,
        clear_method: ClearMethod,
    ) -> Result<Arc<Lvol>, Error> {
        self.verify_lvol_name(name)?;

        let bs = self.bs();
        let num_clusters =
            (size + bs.cluster_size() - 1) / bs.cluster_size();
        let lvol = self.lvol_alloc(name, thin, clear_method);

        match bs
            .create_blob(BlobOpts {
                num_clusters,
                thin_provision: thin,
                clear_method,
                xattrs: lvol.create_xattrs(),
                esnap_cookie: None,
            })
            .await
        {
            Err(e) => {
                self.pending_remove(&lvol);
                Err(Error::LvolCreate {
                    source: e,
                    name: name.to_string(),
                })
            }
            Ok(blob_id) => {
                *lvol.blob_id.lock() = Some(blob_id);
                self.finish_create(lvol, None).await
            }
        }
    }

    /// Create a thin clone whose parent is the named external block
    /// device. The device must exist; its canonical uuid becomes the
    /// clone's stored esnap identifier and its size the clone's size.
    pub async fn create_bdev_clone(
        self: &Arc<Self>,
        backing_name: &str,
        clone_name: &str,
    ) -> Result<Arc<Lvol>, Error> {
        let bdev = Bdev::lookup_by_name(backing_name)
            .or_else(|| Bdev::lookup_by_uuid_str(backing_name))
            .ok_or_else(|| {
                error!("bdev does not exist");
                Error::NotFound {
                    name: backing_name.to_string(),
                }
            })?;

        self.verify_lvol_name(clone_name)?;

        let bs = self.bs();
        let size = bdev.size_in_bytes();
        let num_clusters =
            (size + bs.cluster_size() - 1) / bs.cluster_size();
        let lvol =
            self.lvol_alloc(clone_name, true, ClearMethod::Default);

        match bs
            .create_blob(BlobOpts {
                num_clusters,
                thin_provision: true,
                clear_method: ClearMethod::Default,
                xattrs: lvol.create_xattrs(),
                esnap_cookie: Some(terminated(&bdev.uuid_as_string())),
            })
            .await
        {
            Err(e) => {
                self.pending_remove(&lvol);
                Err(Error::LvolCreate {
                    source: e,
                    name: clone_name.to_string(),
                })
            }
            Ok(blob_id) => {
                *lvol.blob_id.lock() = Some(blob_id);
                self.finish_create(lvol, None).await
            }
        }
    }
}

pub(crate) fn parse_uuid_xattr(value: Option<Vec<u8>>) -> Option<Uuid> {
    let value = value?;
    if value.len() != UUID_STRING_LEN || *value.last()? != 0 {
        return None;
    }
    let s = from_terminated(&value)?;
    let uuid = Uuid::parse_str(&s).ok()?;
    if uuid.to_string() != s {
        return None;
    }
    Some(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_xattr_parsing() {
        let canonical = "a27fd8fe-d4b9-431e-a044-271016228ce4";

        assert!(parse_uuid_xattr(Some(terminated(canonical))).is_some());
        assert!(parse_uuid_xattr(None).is_none());
        // no terminator
        assert!(
            parse_uuid_xattr(Some(canonical.as_bytes().to_vec())).is_none()
        );
        // wrong length
        assert!(
            parse_uuid_xattr(Some(terminated(&canonical[.. 35]))).is_none()
        );
        // not the canonical spelling
        assert!(parse_uuid_xattr(Some(terminated(
            &canonical.to_uppercase()
        )))
        .is_none());
    }

    #[test]
    fn terminated_round_trip() {
        let v = terminated("lvol0");
        assert_eq!(v.last(), Some(&0));
        assert_eq!(from_terminated(&v).unwrap(), "lvol0");
    }
}
