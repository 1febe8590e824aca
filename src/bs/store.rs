use std::{
    any::Any,
    cell::Cell,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
        Weak,
    },
};

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    bs::{
        blob::{Blob, BlobBsDev, BlobId, BlobRec, BlobState, ClearMethod},
        BsDev,
        BsError,
        ZeroesBsDev,
    },
    core::Cores,
};

/// Creates the back device for a blob whose parent is external. Installed
/// by the volume layer before any blob is opened; the blobstore itself has
/// no idea what an lvol is.
#[async_trait(?Send)]
pub trait EsnapDevFactory: Send + Sync {
    async fn create_esnap_dev(
        &self,
        blob: &Blob,
        blob_ctx: Option<&Arc<dyn Any + Send + Sync>>,
    ) -> Result<Option<Box<dyn BsDev>>, BsError>;
}

/// Options for creating or loading a store.
#[derive(Debug, Clone)]
pub struct BsOpts {
    pub cluster_sz: u64,
    pub bstype: String,
    /// reserve a zeroed cluster so that zeroes devices can serve
    /// memory-domain reads from real data
    pub reserve_zero_cluster: bool,
}

impl Default for BsOpts {
    fn default() -> Self {
        Self {
            cluster_sz: 4 * 1024 * 1024,
            bstype: String::new(),
            reserve_zero_cluster: false,
        }
    }
}

/// Options for creating a blob.
#[derive(Default)]
pub struct BlobOpts {
    pub num_clusters: u64,
    pub thin_provision: bool,
    pub clear_method: ClearMethod,
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// opaque identifier of an external parent; present for esnap clones
    pub esnap_cookie: Option<Vec<u8>>,
}

/// Options for opening a blob.
#[derive(Default)]
pub struct BlobOpenOpts {
    pub clear_method: Option<ClearMethod>,
    /// caller context handed to the esnap device factory
    pub external_ctx: Option<Arc<dyn Any + Send + Sync>>,
}

/// A blobstore I/O channel. Data-path operations take one; it pins the
/// operation to the core it was allocated on.
pub struct BsIoChannel {
    core: u32,
}

impl BsIoChannel {
    pub fn core(&self) -> u32 {
        self.core
    }
}

enum Backing {
    Dev(Arc<dyn BsDev>),
    Parent(BlobId),
    /// esnap clone with no device attached (initial load phase)
    Unbound,
    None,
}

pub(crate) struct BsInner {
    device_key: String,
    dev: Mutex<Option<Box<dyn BsDev>>>,
    io_unit_size: u32,
    cluster_sz: u64,
    bstype: String,
    total_clusters: AtomicU64,
    blobs: Mutex<BTreeMap<BlobId, Arc<BlobRec>>>,
    next_id: AtomicU64,
    super_blob: Mutex<Option<BlobId>>,
    esnap_factory: Mutex<Option<Weak<dyn EsnapDevFactory>>>,
    md_fail: AtomicU32,
    zero_cluster: Option<Arc<Vec<u8>>>,
}

/// In-process stand-in for media: state of stores between load cycles,
/// keyed by base device identity. The on-disk format proper is delegated.
struct ParkedBlob {
    xattrs: HashMap<String, Vec<u8>>,
    clusters: Vec<Option<Box<[u8]>>>,
    thin: bool,
    read_only: bool,
    parent: Option<BlobId>,
    esnap_cookie: Option<Vec<u8>>,
    clear_method: ClearMethod,
}

struct ParkedBs {
    io_unit_size: u32,
    cluster_sz: u64,
    bstype: String,
    blobs: BTreeMap<BlobId, ParkedBlob>,
    super_blob: Option<BlobId>,
    next_id: u64,
}

static PARKED: Lazy<Mutex<HashMap<String, ParkedBs>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The store of blobs. Cheap to clone; all clones refer to the same store.
#[derive(Clone)]
pub struct Blobstore(pub(crate) Arc<BsInner>);

impl Blobstore {
    fn device_key(dev: &dyn BsDev) -> String {
        dev.identity().unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Initialize a fresh store on the given device, discarding whatever
    /// the device held before.
    pub async fn init(
        dev: Box<dyn BsDev>,
        opts: &BsOpts,
    ) -> Result<Blobstore, BsError> {
        if opts.cluster_sz < dev.blocklen() as u64 {
            return Err(BsError::InvalidArgument {
                msg: format!(
                    "cluster size {} is smaller than blocklen {}",
                    opts.cluster_sz,
                    dev.blocklen()
                ),
            });
        }

        let key = Self::device_key(dev.as_ref());
        PARKED.lock().remove(&key);

        let io_unit_size = dev.blocklen();
        let total = dev.blockcnt() * dev.blocklen() as u64 / opts.cluster_sz;

        Ok(Blobstore(Arc::new(BsInner {
            device_key: key,
            dev: Mutex::new(Some(dev)),
            io_unit_size,
            cluster_sz: opts.cluster_sz,
            bstype: opts.bstype.clone(),
            total_clusters: AtomicU64::new(total),
            blobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0x1),
            super_blob: Mutex::new(None),
            esnap_factory: Mutex::new(None),
            md_fail: AtomicU32::new(0),
            zero_cluster: opts
                .reserve_zero_cluster
                .then(|| Arc::new(vec![0u8; opts.cluster_sz as usize])),
        })))
    }

    /// Load an existing store from the given device, validating its type
    /// tag.
    pub async fn load(
        dev: Box<dyn BsDev>,
        opts: &BsOpts,
    ) -> Result<Blobstore, BsError> {
        let key = Self::device_key(dev.as_ref());
        let parked = PARKED.lock().remove(&key).ok_or(BsError::BadBsType {
            source: Errno::EILSEQ,
        })?;

        if !opts.bstype.is_empty() && parked.bstype != opts.bstype {
            // put it back; a failed probe must not eat the store
            PARKED.lock().insert(key, parked);
            return Err(BsError::BadBsType {
                source: Errno::EILSEQ,
            });
        }

        let total =
            dev.blockcnt() * dev.blocklen() as u64 / parked.cluster_sz;

        let blobs = parked
            .blobs
            .into_iter()
            .map(|(id, p)| {
                (
                    id,
                    Arc::new(BlobRec {
                        id,
                        state: Mutex::new(BlobState {
                            xattrs: p.xattrs,
                            clusters: p.clusters,
                            thin: p.thin,
                            read_only: p.read_only,
                            parent: p.parent,
                            esnap_cookie: p.esnap_cookie,
                            back: None,
                            open_count: 0,
                            clear_method: p.clear_method,
                        }),
                    }),
                )
            })
            .collect::<BTreeMap<_, _>>();

        Ok(Blobstore(Arc::new(BsInner {
            device_key: key,
            dev: Mutex::new(Some(dev)),
            io_unit_size: parked.io_unit_size,
            cluster_sz: parked.cluster_sz,
            bstype: parked.bstype,
            total_clusters: AtomicU64::new(total),
            blobs: Mutex::new(blobs),
            next_id: AtomicU64::new(parked.next_id),
            super_blob: Mutex::new(parked.super_blob),
            esnap_factory: Mutex::new(None),
            md_fail: AtomicU32::new(0),
            zero_cluster: None,
        })))
    }

    /// Load variant that informs the store its device has expanded.
    pub async fn grow(
        dev: Box<dyn BsDev>,
        opts: &BsOpts,
    ) -> Result<Blobstore, BsError> {
        let bs = Self::load(dev, opts).await?;
        let dev_size = {
            let dev = bs.0.dev.lock();
            let dev = dev.as_ref().unwrap();
            dev.blockcnt() * dev.blocklen() as u64
        };
        bs.0.total_clusters
            .store(dev_size / bs.0.cluster_sz, Ordering::Relaxed);
        Ok(bs)
    }

    /// install the factory consulted for blobs with an external parent
    pub fn set_esnap_factory(&self, factory: Weak<dyn EsnapDevFactory>) {
        *self.0.esnap_factory.lock() = Some(factory);
    }

    pub fn io_unit_size(&self) -> u32 {
        self.0.io_unit_size
    }

    pub fn cluster_size(&self) -> u64 {
        self.0.cluster_sz
    }

    pub fn total_clusters(&self) -> u64 {
        self.0.total_clusters.load(Ordering::Relaxed)
    }

    pub fn used_clusters(&self) -> u64 {
        self.0
            .blobs
            .lock()
            .values()
            .map(|rec| {
                rec.state
                    .lock()
                    .clusters
                    .iter()
                    .filter(|c| c.is_some())
                    .count() as u64
            })
            .sum()
    }

    pub(crate) fn zero_cluster(&self) -> Option<Arc<Vec<u8>>> {
        self.0.zero_cluster.clone()
    }

    /// fail the next `n` metadata syncs with an I/O error
    pub fn fail_md_syncs(&self, n: u32) {
        self.0.md_fail.store(n, Ordering::Relaxed);
    }

    pub(crate) fn md_sync_point(&self) -> Result<(), BsError> {
        let failed = self
            .0
            .md_fail
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok();
        if failed {
            return Err(BsError::MdSync {
                source: Errno::EIO,
            });
        }
        Ok(())
    }

    pub fn alloc_io_channel(&self) -> BsIoChannel {
        BsIoChannel {
            core: Cores::current(),
        }
    }

    /// create a blob, returning its id
    pub async fn create_blob(
        &self,
        opts: BlobOpts,
    ) -> Result<BlobId, BsError> {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let clusters = if opts.thin_provision || opts.esnap_cookie.is_some() {
            vec![None; opts.num_clusters as usize]
        } else {
            (0 .. opts.num_clusters)
                .map(|_| {
                    Some(
                        vec![0u8; self.0.cluster_sz as usize]
                            .into_boxed_slice(),
                    )
                })
                .collect()
        };

        let rec = Arc::new(BlobRec {
            id,
            state: Mutex::new(BlobState {
                xattrs: opts.xattrs.into_iter().collect(),
                clusters,
                thin: opts.thin_provision || opts.esnap_cookie.is_some(),
                read_only: false,
                parent: None,
                esnap_cookie: opts.esnap_cookie,
                back: None,
                open_count: 0,
                clear_method: opts.clear_method,
            }),
        });

        self.0.blobs.lock().insert(id, rec);
        Ok(id)
    }

    fn get_rec(&self, id: BlobId) -> Result<Arc<BlobRec>, BsError> {
        self.0.blobs.lock().get(&id).cloned().ok_or(BsError::BlobNotFound {
            id,
        })
    }

    /// Open a blob. The first open binds the blob's back device: a blob
    /// device for snapshot clones, the esnap factory's answer for external
    /// clones, a zeroes device otherwise.
    pub async fn open_blob(
        &self,
        id: BlobId,
        opts: BlobOpenOpts,
    ) -> Result<Blob, BsError> {
        let rec = self.get_rec(id)?;

        let (first, parent, has_cookie, has_back) = {
            let mut state = rec.state.lock();
            state.open_count += 1;
            if let Some(cm) = opts.clear_method {
                state.clear_method = cm;
            }
            (
                state.open_count == 1,
                state.parent,
                state.esnap_cookie.is_some(),
                state.back.is_some(),
            )
        };

        let blob = Blob {
            bs: self.clone(),
            rec: rec.clone(),
            closed: Cell::new(false),
        };

        if first && !has_back {
            if has_cookie {
                let factory = self
                    .0
                    .esnap_factory
                    .lock()
                    .as_ref()
                    .and_then(|w| w.upgrade());
                if let Some(factory) = factory {
                    match factory
                        .create_esnap_dev(
                            &blob,
                            opts.external_ctx.as_ref(),
                        )
                        .await
                    {
                        Ok(Some(dev)) => {
                            rec.state.lock().back = Some(Arc::from(dev));
                        }
                        // no device: leave the blob unbound for now
                        Ok(None) => {}
                        Err(e) => {
                            blob.closed.set(true);
                            rec.state.lock().open_count -= 1;
                            return Err(e);
                        }
                    }
                }
            } else if let Some(pid) = parent {
                rec.state.lock().back =
                    Some(Arc::new(BlobBsDev::new(self, pid)));
            } else {
                let zeroes = match self.zero_cluster() {
                    Some(cluster) => ZeroesBsDev::cluster_backed(
                        self.0.io_unit_size,
                        cluster,
                    ),
                    None => ZeroesBsDev::new(),
                };
                rec.state.lock().back = Some(Arc::new(zeroes));
            }
        }

        Ok(blob)
    }

    pub(crate) async fn close_blob(
        &self,
        rec: &Arc<BlobRec>,
    ) -> Result<(), BsError> {
        let back = {
            let mut state = rec.state.lock();
            state.open_count -= 1;
            if state.open_count == 0 {
                state.back.take()
            } else {
                None
            }
        };
        if let Some(back) = back {
            back.destroy().await;
        }
        Ok(())
    }

    /// blob ids with the given blob as parent
    pub fn get_clones(&self, id: BlobId) -> Vec<BlobId> {
        self.0
            .blobs
            .lock()
            .values()
            .filter(|rec| rec.state.lock().parent == Some(id))
            .map(|rec| rec.id)
            .collect()
    }

    pub fn blob_num_clusters(&self, id: BlobId) -> Option<u64> {
        self.0
            .blobs
            .lock()
            .get(&id)
            .map(|rec| rec.state.lock().clusters.len() as u64)
    }

    /// resize an existing blob to the given cluster count
    pub async fn resize_blob(
        &self,
        id: BlobId,
        num_clusters: u64,
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        let mut state = rec.state.lock();
        if state.read_only {
            return Err(BsError::ReadOnly {
                id,
            });
        }
        state.clusters.resize(num_clusters as usize, None);
        Ok(())
    }

    /// persist a blob's metadata
    pub async fn sync_blob_md(&self, id: BlobId) -> Result<(), BsError> {
        self.get_rec(id)?;
        self.md_sync_point()
    }

    pub async fn set_blob_read_only(&self, id: BlobId) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        rec.state.lock().read_only = true;
        Ok(())
    }

    pub fn set_blob_xattr(
        &self,
        id: BlobId,
        name: &str,
        value: &[u8],
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        rec.state
            .lock()
            .xattrs
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    pub fn blob_xattr(&self, id: BlobId, name: &str) -> Option<Vec<u8>> {
        self.0
            .blobs
            .lock()
            .get(&id)
            .and_then(|rec| rec.state.lock().xattrs.get(name).cloned())
    }

    pub fn blob_is_thin(&self, id: BlobId) -> bool {
        self.0
            .blobs
            .lock()
            .get(&id)
            .map_or(false, |rec| rec.state.lock().thin)
    }

    pub fn blob_is_esnap_clone(&self, id: BlobId) -> bool {
        self.0
            .blobs
            .lock()
            .get(&id)
            .map_or(false, |rec| rec.state.lock().esnap_cookie.is_some())
    }

    pub fn blob_external_cookie(&self, id: BlobId) -> Option<Vec<u8>> {
        self.0
            .blobs
            .lock()
            .get(&id)
            .and_then(|rec| rec.state.lock().esnap_cookie.clone())
    }

    /// Install a new back device on an open esnap clone, tearing down the
    /// one it replaces.
    pub async fn set_blob_esnap_dev(
        &self,
        id: BlobId,
        dev: Box<dyn BsDev>,
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        let old = {
            let mut state = rec.state.lock();
            if state.esnap_cookie.is_none() {
                return Err(BsError::InvalidArgument {
                    msg: format!("blob {:#x} is not an esnap clone", id),
                });
            }
            state.back.replace(Arc::from(dev))
        };
        if let Some(old) = old {
            old.destroy().await;
        }
        Ok(())
    }

    /// Read from an open blob through a store channel.
    pub async fn read_blob(
        &self,
        _ch: &BsIoChannel,
        id: BlobId,
        buf: &mut [u8],
        offset_io_units: u64,
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        if rec.state.lock().open_count == 0 {
            return Err(BsError::InvalidArgument {
                msg: format!("blob {:#x} is not open", id),
            });
        }
        self.read_blob_inner(id, buf, offset_io_units).await
    }

    /// Write to an open blob through a store channel.
    pub async fn write_blob(
        &self,
        _ch: &BsIoChannel,
        id: BlobId,
        buf: &[u8],
        offset_io_units: u64,
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        if rec.state.lock().open_count == 0 {
            return Err(BsError::InvalidArgument {
                msg: format!("blob {:#x} is not open", id),
            });
        }
        self.write_blob_inner(&rec, buf, offset_io_units).await
    }

    /// all blob ids, in creation order
    pub fn blob_ids(&self) -> Vec<BlobId> {
        self.0.blobs.lock().keys().copied().collect()
    }

    pub async fn set_super(&self, id: BlobId) -> Result<(), BsError> {
        self.get_rec(id)?;
        *self.0.super_blob.lock() = Some(id);
        Ok(())
    }

    pub async fn get_super(&self) -> Result<BlobId, BsError> {
        self.0.super_blob.lock().ok_or(BsError::BlobNotFound {
            id: 0,
        })
    }

    /// Delete a blob. A snapshot with exactly one clone is merged into that
    /// clone, which also inherits an external parent identity; more than
    /// one clone refuses.
    pub async fn delete_blob(&self, id: BlobId) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;

        if rec.state.lock().open_count > 0 {
            return Err(BsError::BlobBusy {
                id,
            });
        }

        let clones = self.get_clones(id);
        if clones.len() > 1 {
            return Err(BsError::HasClones {
                id,
            });
        }

        if let Some(clone_id) = clones.first() {
            let clone_rec = self.get_rec(*clone_id)?;
            let mut state = rec.state.lock();
            let mut clone = clone_rec.state.lock();

            // move clusters the clone has not written over
            for (i, cluster) in state.clusters.iter_mut().enumerate() {
                if cluster.is_some()
                    && clone.clusters.get(i).map_or(false, |c| c.is_none())
                {
                    clone.clusters[i] = cluster.take();
                }
            }

            clone.parent = state.parent;
            clone.esnap_cookie = state.esnap_cookie.take();

            if clone.open_count > 0 {
                let old = clone.back.take();
                clone.back = match state.back.take() {
                    Some(dev) => Some(dev),
                    None => match clone.parent {
                        Some(pid) => {
                            Some(Arc::new(BlobBsDev::new(self, pid)))
                        }
                        None if clone.esnap_cookie.is_some() => None,
                        None => Some(Arc::new(ZeroesBsDev::new())),
                    },
                };
                drop(clone);
                drop(state);
                if let Some(old) = old {
                    old.destroy().await;
                }
            } else {
                // the clone rebinds at its next open
                let orphan = state.back.take();
                drop(clone);
                drop(state);
                if let Some(orphan) = orphan {
                    orphan.destroy().await;
                }
            }
        } else {
            let orphan = rec.state.lock().back.take();
            if let Some(orphan) = orphan {
                orphan.destroy().await;
            }
        }

        self.0.blobs.lock().remove(&id);
        if *self.0.super_blob.lock() == Some(id) {
            *self.0.super_blob.lock() = None;
        }
        Ok(())
    }

    /// Snapshot a blob: the new blob takes over the allocated clusters and
    /// the parent identity (including an external one); the original
    /// becomes a thin clone of the snapshot.
    pub async fn snapshot(
        &self,
        orig: BlobId,
        xattrs: Vec<(String, Vec<u8>)>,
    ) -> Result<BlobId, BsError> {
        let orig_rec = self.get_rec(orig)?;
        let snap_id = self.0.next_id.fetch_add(1, Ordering::Relaxed);

        let snap_rec = {
            let mut state = orig_rec.state.lock();
            let num_clusters = state.clusters.len();
            let clusters = std::mem::replace(
                &mut state.clusters,
                vec![None; num_clusters],
            );
            let snap = Arc::new(BlobRec {
                id: snap_id,
                state: Mutex::new(BlobState {
                    xattrs: xattrs.into_iter().collect(),
                    clusters,
                    thin: true,
                    read_only: true,
                    parent: state.parent.take(),
                    esnap_cookie: state.esnap_cookie.take(),
                    back: state.back.take(),
                    open_count: 0,
                    clear_method: state.clear_method,
                }),
            });
            state.parent = Some(snap_id);
            state.thin = true;
            snap
        };

        self.0.blobs.lock().insert(snap_id, snap_rec);

        // rebind the original's data path onto the snapshot
        let orig_open = orig_rec.state.lock().open_count > 0;
        if orig_open {
            orig_rec.state.lock().back =
                Some(Arc::new(BlobBsDev::new(self, snap_id)));
        }

        Ok(snap_id)
    }

    /// Thin clone of a read-only blob. A clone of an esnap clone is a
    /// regular clone; the external identity stays with its parent.
    pub async fn clone_blob(
        &self,
        orig: BlobId,
        xattrs: Vec<(String, Vec<u8>)>,
    ) -> Result<BlobId, BsError> {
        let orig_rec = self.get_rec(orig)?;
        let num_clusters = {
            let state = orig_rec.state.lock();
            if !state.read_only {
                return Err(BsError::InvalidArgument {
                    msg: format!("blob {:#x} is not a snapshot", orig),
                });
            }
            state.clusters.len()
        };

        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let rec = Arc::new(BlobRec {
            id,
            state: Mutex::new(BlobState {
                xattrs: xattrs.into_iter().collect(),
                clusters: vec![None; num_clusters],
                thin: true,
                read_only: false,
                parent: Some(orig),
                esnap_cookie: None,
                back: None,
                open_count: 0,
                clear_method: ClearMethod::Default,
            }),
        });
        self.0.blobs.lock().insert(id, rec);
        Ok(id)
    }

    /// allocate every cluster locally and drop the parent
    pub async fn inflate_blob(
        &self,
        _ch: &BsIoChannel,
        id: BlobId,
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        let num = rec.state.lock().clusters.len();
        for cidx in 0 .. num {
            self.ensure_cluster(&rec, cidx).await?;
        }

        let (old, open) = {
            let mut state = rec.state.lock();
            state.parent = None;
            state.esnap_cookie = None;
            state.thin = false;
            (state.back.take(), state.open_count > 0)
        };
        if open {
            rec.state.lock().back = Some(Arc::new(ZeroesBsDev::new()));
        }
        if let Some(old) = old {
            old.destroy().await;
        }
        Ok(())
    }

    /// Copy the clusters allocated in the immediate parent and reparent to
    /// the grandparent. An external parent is decoupled by inflating.
    pub async fn decouple_parent(
        &self,
        ch: &BsIoChannel,
        id: BlobId,
    ) -> Result<(), BsError> {
        let rec = self.get_rec(id)?;
        let parent = rec.state.lock().parent;

        let pid = match parent {
            Some(pid) => pid,
            None => return self.inflate_blob(ch, id).await,
        };

        let parent_rec = self.get_rec(pid)?;
        let num = rec.state.lock().clusters.len();
        for cidx in 0 .. num {
            let copied = {
                let parent_state = parent_rec.state.lock();
                parent_state
                    .clusters
                    .get(cidx)
                    .and_then(|c| c.clone())
            };
            if let Some(data) = copied {
                let mut state = rec.state.lock();
                if state.clusters[cidx].is_none() {
                    state.clusters[cidx] = Some(data);
                }
            }
        }

        let grandparent = parent_rec.state.lock().parent;
        let (old, open) = {
            let mut state = rec.state.lock();
            state.parent = grandparent;
            (state.back.take(), state.open_count > 0)
        };
        if open {
            rec.state.lock().back = Some(match grandparent {
                Some(gpid) => Arc::new(BlobBsDev::new(self, gpid)),
                None => Arc::new(ZeroesBsDev::new()),
            });
        }
        if let Some(old) = old {
            old.destroy().await;
        }
        Ok(())
    }

    /// Tear down and park the store against its device. Refuses while any
    /// blob is open.
    pub async fn unload(self) -> Result<(), BsError> {
        self.quiesce(true).await
    }

    /// Tear down and discard the store and its parked state.
    pub async fn destroy(self) -> Result<(), BsError> {
        self.quiesce(false).await
    }

    async fn quiesce(self, park: bool) -> Result<(), BsError> {
        let recs = {
            let blobs = self.0.blobs.lock();
            if let Some(rec) =
                blobs.values().find(|r| r.state.lock().open_count > 0)
            {
                return Err(BsError::BlobBusy {
                    id: rec.id,
                });
            }
            blobs.values().cloned().collect::<Vec<_>>()
        };

        // tear down any back devices still attached to closed blobs
        for rec in &recs {
            let back = rec.state.lock().back.take();
            if let Some(back) = back {
                back.destroy().await;
            }
        }

        if park {
            let blobs = recs
                .into_iter()
                .map(|rec| {
                    let state = rec.state.lock();
                    (
                        rec.id,
                        ParkedBlob {
                            xattrs: state.xattrs.clone(),
                            clusters: state.clusters.clone(),
                            thin: state.thin,
                            read_only: state.read_only,
                            parent: state.parent,
                            esnap_cookie: state.esnap_cookie.clone(),
                            clear_method: state.clear_method,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>();

            PARKED.lock().insert(
                self.0.device_key.clone(),
                ParkedBs {
                    io_unit_size: self.0.io_unit_size,
                    cluster_sz: self.0.cluster_sz,
                    bstype: self.0.bstype.clone(),
                    blobs,
                    super_blob: *self.0.super_blob.lock(),
                    next_id: self.0.next_id.load(Ordering::Relaxed),
                },
            );
        } else {
            PARKED.lock().remove(&self.0.device_key);
        }

        self.0.blobs.lock().clear();
        let dev = self.0.dev.lock().take();
        if let Some(dev) = dev {
            dev.destroy().await;
        }
        Ok(())
    }

    fn backing_state(state: &BlobState) -> Backing {
        if let Some(dev) = &state.back {
            Backing::Dev(dev.clone())
        } else if let Some(pid) = state.parent {
            Backing::Parent(pid)
        } else if state.esnap_cookie.is_some() {
            Backing::Unbound
        } else {
            Backing::None
        }
    }

    async fn backing_dev_read(
        dev: &Arc<dyn BsDev>,
        dst: &mut [u8],
        offset_io_units: u64,
        io_unit: u64,
    ) -> Result<(), BsError> {
        let blocklen = dev.blocklen() as u64;
        let scale = io_unit / blocklen;
        let lba = offset_io_units * scale;
        let cnt = dst.len() as u64 / blocklen;
        let devcnt = dev.blockcnt();

        if lba >= devcnt {
            dst.fill(0);
            return Ok(());
        }
        let avail = (devcnt - lba).min(cnt);
        let bytes = (avail * blocklen) as usize;
        dev.read(&mut dst[.. bytes], lba, avail as u32).await?;
        dst[bytes ..].fill(0);
        Ok(())
    }

    /// Read `buf.len()` bytes from the blob starting at the given io-unit
    /// offset. Unallocated regions are served through the blob's backing.
    pub(crate) fn read_blob_inner<'a>(
        &'a self,
        id: BlobId,
        buf: &'a mut [u8],
        offset_io_units: u64,
    ) -> LocalBoxFuture<'a, Result<(), BsError>> {
        Box::pin(async move {
            let io_unit = self.0.io_unit_size as u64;
            if buf.len() as u64 % io_unit != 0 {
                return Err(BsError::InvalidArgument {
                    msg: "unaligned read length".to_string(),
                });
            }

            let rec = self.get_rec(id)?;
            let units_per_cluster = self.0.cluster_sz / io_unit;
            let total_units = buf.len() as u64 / io_unit;

            let mut done = 0;
            while done < total_units {
                let unit = offset_io_units + done;
                let cidx = (unit / units_per_cluster) as usize;
                let within = unit % units_per_cluster;
                let span = (units_per_cluster - within).min(total_units - done);
                let bytes = (span * io_unit) as usize;
                let dst_off = (done * io_unit) as usize;
                let dst = &mut buf[dst_off .. dst_off + bytes];

                let backing = {
                    let state = rec.state.lock();
                    match state.clusters.get(cidx) {
                        Some(Some(cluster)) => {
                            let off = (within * io_unit) as usize;
                            dst.copy_from_slice(
                                &cluster[off .. off + bytes],
                            );
                            None
                        }
                        Some(None) => Some(Self::backing_state(&state)),
                        None => {
                            return Err(BsError::InvalidArgument {
                                msg: format!(
                                    "read past the end of blob {:#x}",
                                    id
                                ),
                            })
                        }
                    }
                };

                if let Some(backing) = backing {
                    match backing {
                        Backing::Dev(dev) => {
                            Self::backing_dev_read(&dev, dst, unit, io_unit)
                                .await?
                        }
                        Backing::Parent(pid) => {
                            self.read_blob_inner(pid, dst, unit).await?
                        }
                        Backing::Unbound => {
                            return Err(BsError::ReadError {
                                source: Errno::EIO,
                                lba: unit,
                                lba_count: span,
                            })
                        }
                        Backing::None => dst.fill(0),
                    }
                }

                done += span;
            }
            Ok(())
        })
    }

    /// make sure the given cluster is locally allocated, copying it from
    /// the backing when needed
    async fn ensure_cluster(
        &self,
        rec: &Arc<BlobRec>,
        cidx: usize,
    ) -> Result<(), BsError> {
        let backing = {
            let state = rec.state.lock();
            match state.clusters.get(cidx) {
                Some(Some(_)) => return Ok(()),
                Some(None) => Self::backing_state(&state),
                None => {
                    return Err(BsError::InvalidArgument {
                        msg: format!(
                            "write past the end of blob {:#x}",
                            rec.id
                        ),
                    })
                }
            }
        };

        let io_unit = self.0.io_unit_size as u64;
        let units_per_cluster = self.0.cluster_sz / io_unit;
        let offset_units = cidx as u64 * units_per_cluster;
        let mut data = vec![0u8; self.0.cluster_sz as usize];

        match backing {
            Backing::None => {}
            Backing::Dev(dev) => {
                let blocklen = dev.blocklen() as u64;
                let lba = offset_units * (io_unit / blocklen);
                let cnt = self.0.cluster_sz / blocklen;
                if !dev.is_zeroes(lba, cnt) {
                    Self::backing_dev_read(
                        &dev,
                        &mut data,
                        offset_units,
                        io_unit,
                    )
                    .await?;
                }
            }
            Backing::Parent(pid) => {
                self.read_blob_inner(pid, &mut data, offset_units).await?
            }
            Backing::Unbound => {
                return Err(BsError::ReadError {
                    source: Errno::EIO,
                    lba: offset_units,
                    lba_count: units_per_cluster,
                })
            }
        }

        let mut state = rec.state.lock();
        if state.clusters[cidx].is_none() {
            state.clusters[cidx] = Some(data.into_boxed_slice());
        }
        Ok(())
    }

    pub(crate) async fn write_blob_inner(
        &self,
        rec: &Arc<BlobRec>,
        buf: &[u8],
        offset_io_units: u64,
    ) -> Result<(), BsError> {
        let io_unit = self.0.io_unit_size as u64;
        if buf.len() as u64 % io_unit != 0 {
            return Err(BsError::InvalidArgument {
                msg: "unaligned write length".to_string(),
            });
        }
        if rec.state.lock().read_only {
            return Err(BsError::ReadOnly {
                id: rec.id,
            });
        }

        let units_per_cluster = self.0.cluster_sz / io_unit;
        let total_units = buf.len() as u64 / io_unit;

        let mut done = 0;
        while done < total_units {
            let unit = offset_io_units + done;
            let cidx = (unit / units_per_cluster) as usize;
            let within = unit % units_per_cluster;
            let span = (units_per_cluster - within).min(total_units - done);
            let bytes = (span * io_unit) as usize;
            let src_off = (done * io_unit) as usize;

            self.ensure_cluster(rec, cidx).await?;

            {
                let mut state = rec.state.lock();
                let cluster = state.clusters[cidx].as_mut().unwrap();
                let off = (within * io_unit) as usize;
                cluster[off .. off + bytes]
                    .copy_from_slice(&buf[src_off .. src_off + bytes]);
            }

            done += span;
        }
        Ok(())
    }
}
