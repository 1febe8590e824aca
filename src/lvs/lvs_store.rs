use std::{
    collections::BTreeMap,
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    bs::{
        BlobId,
        BlobOpenOpts,
        BlobOpts,
        Blobstore,
        BsDev,
        BsError,
        BsOpts,
        EsnapDevFactory,
    },
    core::Cores,
    lvs::{
        from_terminated,
        lvs_esnap,
        lvs_lvol::parse_uuid_xattr,
        terminated,
        Error,
        EsnapMissing,
        Lvol,
        LVOL_NAME_XATTR,
        LVOL_UUID_XATTR,
        LVS_BSTYPE,
        LVS_NAME_MAX,
        UUID_STRING_LEN,
    },
};

/// process wide list of lvol stores
static LVS_LIST: Lazy<Mutex<Vec<Arc<Lvs>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Options for creating a new lvol store.
#[derive(Debug, Clone)]
pub struct LvsOpts {
    pub name: String,
    pub cluster_sz: u64,
}

impl Default for LvsOpts {
    fn default() -> Self {
        Self {
            name: String::new(),
            cluster_sz: 4 * 1024 * 1024,
        }
    }
}

/// Logical Volume Store (LVS): a blobstore of lvols with a super blob
/// carrying the store's identity.
pub struct Lvs {
    pub(crate) name: Mutex<String>,
    /// scratch slot used only while a rename is in flight
    pub(crate) new_name: Mutex<String>,
    pub(crate) uuid: Uuid,
    /// the reactor that owns this store's catalog and missing-esnap tree
    pub(crate) thread: u32,
    pub(crate) bs: Mutex<Option<Blobstore>>,
    pub(crate) super_blob_id: Mutex<Option<BlobId>>,
    /// false only during the initial blob iteration of a load
    pub(crate) load_esnaps: AtomicBool,
    pub(crate) lvols: Mutex<Vec<Arc<Lvol>>>,
    pub(crate) pending: Mutex<Vec<Arc<Lvol>>>,
    pub(crate) missing: Mutex<BTreeMap<String, Arc<EsnapMissing>>>,
}

impl Debug for Lvs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lvs '{}' [{}] ({}/{} clusters)",
            self.name(),
            self.uuid,
            self.used_clusters(),
            self.total_clusters(),
        )
    }
}

fn verify_lvs_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        error!("no name specified");
        return Err(Error::InvalidName {
            msg: "no name specified".to_string(),
        });
    }
    if name.len() >= LVS_NAME_MAX {
        error!("name has no null terminator");
        return Err(Error::InvalidName {
            msg: format!("'{}' has no null terminator", name),
        });
    }
    Ok(())
}

impl Lvs {
    fn alloc(name: &str, uuid: Uuid, load_esnaps: bool) -> Arc<Lvs> {
        Arc::new(Lvs {
            name: Mutex::new(name.to_string()),
            new_name: Mutex::new(name.to_string()),
            uuid,
            thread: Cores::current(),
            bs: Mutex::new(None),
            super_blob_id: Mutex::new(None),
            load_esnaps: AtomicBool::new(load_esnaps),
            lvols: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            missing: Mutex::new(BTreeMap::new()),
        })
    }

    fn add_to_list(lvs: &Arc<Lvs>) -> Result<(), Error> {
        let mut list = LVS_LIST.lock();
        let name = lvs.name();
        if list.iter().any(|l| l.name() == name) {
            info!("lvolstore with name {} already exists", name);
            return Err(Error::Exists {
                name,
            });
        }
        list.push(lvs.clone());
        Ok(())
    }

    fn remove_from_list(lvs: &Arc<Lvs>) {
        LVS_LIST.lock().retain(|l| !Arc::ptr_eq(l, lvs));
    }

    /// lookup a lvol store by its name
    pub fn lookup(name: &str) -> Option<Arc<Lvs>> {
        LVS_LIST.lock().iter().find(|l| l.name() == name).cloned()
    }

    /// lookup a lvol store by its uuid
    pub fn lookup_by_uuid(uuid: &str) -> Option<Arc<Lvs>> {
        LVS_LIST
            .lock()
            .iter()
            .find(|l| l.uuid.to_string() == uuid)
            .cloned()
    }

    /// snapshot of all registered lvol stores
    pub fn iter() -> Vec<Arc<Lvs>> {
        LVS_LIST.lock().clone()
    }

    /// return the name of the current store
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn scratch_name(&self) -> String {
        self.new_name.lock().clone()
    }

    /// returns the UUID of the lvs
    pub fn uuid(&self) -> String {
        self.uuid.to_string()
    }

    /// the reactor owning this store
    pub fn thread(&self) -> u32 {
        self.thread
    }

    pub(crate) fn bs(&self) -> Blobstore {
        self.bs.lock().clone().expect("lvol store is not loaded")
    }

    /// the blobstore backing this lvol store
    pub fn blobstore(&self) -> Blobstore {
        self.bs()
    }

    pub fn cluster_size(&self) -> u64 {
        self.bs().cluster_size()
    }

    pub fn total_clusters(&self) -> u64 {
        self.bs.lock().as_ref().map_or(0, |bs| bs.total_clusters())
    }

    pub fn used_clusters(&self) -> u64 {
        self.bs.lock().as_ref().map_or(0, |bs| bs.used_clusters())
    }

    /// total capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.cluster_size() * self.total_clusters()
    }

    /// available capacity in bytes
    pub fn available(&self) -> u64 {
        self.cluster_size()
            * self.total_clusters().saturating_sub(self.used_clusters())
    }

    fn bs_opts(cluster_sz: u64) -> BsOpts {
        BsOpts {
            cluster_sz,
            bstype: LVS_BSTYPE.to_string(),
            ..Default::default()
        }
    }

    fn install_factory(lvs: &Arc<Lvs>, bs: &Blobstore) {
        let factory: Arc<dyn EsnapDevFactory> = lvs.clone();
        bs.set_esnap_factory(Arc::downgrade(&factory));
    }

    /// Create a brand new lvol store on the given device.
    pub async fn init(
        bs_dev: Box<dyn BsDev>,
        opts: &LvsOpts,
    ) -> Result<Arc<Lvs>, Error> {
        verify_lvs_name(&opts.name)?;

        if opts.cluster_sz < bs_dev.blocklen() as u64 {
            error!(
                "cluster size {} is smaller than blocklen {}",
                opts.cluster_sz,
                bs_dev.blocklen()
            );
            return Err(Error::Invalid {
                msg: format!(
                    "cluster size {} is smaller than blocklen {}",
                    opts.cluster_sz,
                    bs_dev.blocklen()
                ),
            });
        }

        let lvs = Self::alloc(&opts.name, Uuid::new_v4(), true);
        Self::add_to_list(&lvs)?;
        lvs_esnap::install_examine_hook();

        info!("initializing lvol store");
        let bs = match Blobstore::init(
            bs_dev,
            &Self::bs_opts(opts.cluster_sz),
        )
        .await
        {
            Ok(bs) => bs,
            Err(e) => {
                error!("lvol store init failed: could not initialize blobstore");
                Self::remove_from_list(&lvs);
                return Err(Error::Init {
                    source: e,
                    name: opts.name.clone(),
                });
            }
        };

        Self::install_factory(&lvs, &bs);
        *lvs.bs.lock() = Some(bs.clone());

        let res: Result<(), BsError> = async {
            let super_id = bs.create_blob(BlobOpts::default()).await?;
            let superblob =
                bs.open_blob(super_id, BlobOpenOpts::default()).await?;
            bs.set_super(super_id).await?;
            superblob
                .set_xattr(LVOL_UUID_XATTR, &terminated(&lvs.uuid()));
            superblob.set_xattr(LVOL_NAME_XATTR, &terminated(&opts.name));
            superblob.sync_md().await?;
            *lvs.super_blob_id.lock() = Some(super_id);
            superblob.close().await?;
            Ok(())
        }
        .await;

        if let Err(e) = res {
            error!("lvol store init failed: could not set up super blob");
            Self::remove_from_list(&lvs);
            let bs = lvs.bs.lock().take();
            if let Some(bs) = bs {
                let _ = bs.destroy().await;
            }
            return Err(Error::Init {
                source: e,
                name: opts.name.clone(),
            });
        }

        info!("{:?}: lvol store initialized", lvs);
        Ok(lvs)
    }

    /// Load an existing lvol store from the given device.
    pub async fn load(bs_dev: Box<dyn BsDev>) -> Result<Arc<Lvs>, Error> {
        let bs = Blobstore::load(bs_dev, &Self::bs_opts(0)).await.map_err(
            |e| Error::Load {
                source: e,
            },
        )?;
        Self::attach_loaded(bs).await
    }

    /// Load variant used after the underlying device has been expanded.
    pub async fn grow(bs_dev: Box<dyn BsDev>) -> Result<Arc<Lvs>, Error> {
        let bs = Blobstore::grow(bs_dev, &Self::bs_opts(0)).await.map_err(
            |e| Error::Grow {
                source: e,
            },
        )?;
        Self::attach_loaded(bs).await
    }

    async fn attach_loaded(bs: Blobstore) -> Result<Arc<Lvs>, Error> {
        // validation failures unload the blobstore and surface the first
        // error
        macro_rules! bail {
            ($bs:expr, $err:expr) => {{
                let _ = $bs.unload().await;
                return Err($err);
            }};
        }

        let super_id = match bs.get_super().await {
            Ok(id) => id,
            Err(_) => {
                info!("super blob not found");
                bail!(
                    bs,
                    Error::InvalidMetadata {
                        msg: "super blob not found".to_string(),
                    }
                )
            }
        };

        let superblob =
            match bs.open_blob(super_id, BlobOpenOpts::default()).await {
                Ok(blob) => blob,
                Err(e) => {
                    info!("could not open super blob");
                    bail!(
                        bs,
                        Error::Load {
                            source: e,
                        }
                    )
                }
            };

        let uuid = {
            let value = superblob.xattr(LVOL_UUID_XATTR);
            let valid = value
                .as_ref()
                .map(|v| {
                    v.len() == UUID_STRING_LEN && v.last() == Some(&0)
                })
                .unwrap_or(false);
            match value
                .filter(|_| valid)
                .and_then(|v| from_terminated(&v))
                .and_then(|s| Uuid::parse_str(&s).ok())
            {
                Some(uuid) => uuid,
                None => {
                    info!("missing or incorrect UUID");
                    let _ = superblob.close().await;
                    bail!(
                        bs,
                        Error::InvalidMetadata {
                            msg: "missing or incorrect UUID".to_string(),
                        }
                    )
                }
            }
        };

        let name = match superblob
            .xattr(LVOL_NAME_XATTR)
            .filter(|v| !v.is_empty() && v.len() <= LVS_NAME_MAX)
            .and_then(|v| from_terminated(&v))
        {
            Some(name) => name,
            None => {
                info!("missing or invalid name");
                let _ = superblob.close().await;
                bail!(
                    bs,
                    Error::InvalidMetadata {
                        msg: "missing or invalid name".to_string(),
                    }
                )
            }
        };

        if let Err(e) = superblob.close().await {
            bail!(
                bs,
                Error::Load {
                    source: e,
                }
            )
        }

        let lvs = Self::alloc(&name, uuid, false);
        *lvs.super_blob_id.lock() = Some(super_id);

        if let Err(e) = Self::add_to_list(&lvs) {
            bail!(bs, e)
        }

        lvs_esnap::install_examine_hook();
        Self::install_factory(&lvs, &bs);
        *lvs.bs.lock() = Some(bs.clone());

        // build the catalog without resolving esnaps
        for id in bs.blob_ids() {
            if id == super_id {
                info!("found superblob {:#x}", id);
                continue;
            }
            if let Err(e) = Self::load_one_lvol(&lvs, &bs, id).await {
                lvs.lvols.lock().clear();
                Self::remove_from_list(&lvs);
                lvs.bs.lock().take();
                bail!(bs, e)
            }
        }

        lvs.load_esnaps.store(true, Ordering::Release);
        info!("{:?}: existing lvol store loaded", lvs);
        Ok(lvs)
    }

    async fn load_one_lvol(
        lvs: &Arc<Lvs>,
        bs: &Blobstore,
        id: BlobId,
    ) -> Result<(), Error> {
        let blob =
            bs.open_blob(id, BlobOpenOpts::default()).await.map_err(|e| {
                error!("failed to fetch blob {:#x}", id);
                Error::Load {
                    source: e,
                }
            })?;

        // a missing or corrupt uuid is tolerated; the lvol then goes by a
        // derived unique id
        let (uuid_str, unique_id) =
            match parse_uuid_xattr(blob.xattr(LVOL_UUID_XATTR)) {
                Some(uuid) => (uuid.to_string(), uuid.to_string()),
                None => {
                    info!("missing or corrupt lvol uuid");
                    (String::new(), format!("{}_{}", lvs.uuid, id))
                }
            };

        let name = match blob
            .xattr(LVOL_NAME_XATTR)
            .filter(|v| !v.is_empty() && v.len() <= crate::lvs::LVOL_NAME_MAX)
            .and_then(|v| from_terminated(&v))
        {
            Some(name) => name,
            None => {
                error!("cannot assign lvol name");
                let _ = blob.close().await;
                return Err(Error::InvalidMetadata {
                    msg: "cannot assign lvol name".to_string(),
                });
            }
        };

        let thin = blob.is_thin();
        blob.close().await.map_err(|e| Error::Load {
            source: e,
        })?;

        let lvol =
            Lvol::from_load(lvs, name, uuid_str, unique_id.clone(), id, thin);
        lvs.lvols.lock().push(lvol);
        info!("{}: added lvol {}", lvs.name(), unique_id);
        Ok(())
    }

    fn check_quiesced(&self) -> Result<(), Error> {
        for lvol in self.lvols.lock().iter() {
            if lvol.action_in_progress() {
                error!("operations on lvols pending");
                return Err(Error::LvsBusy {
                    name: self.name(),
                });
            }
            if lvol.refs() != 0 {
                error!("lvols still open on lvol store");
                return Err(Error::LvsBusy {
                    name: self.name(),
                });
            }
        }
        Ok(())
    }

    /// Unload the store, leaving its contents intact on the device. Fails
    /// while any lvol is open or has an operation in flight.
    pub async fn unload(self: &Arc<Self>) -> Result<(), Error> {
        self.check_quiesced()?;

        let lvols = {
            let mut guard = self.lvols.lock();
            std::mem::take(&mut *guard)
        };
        for lvol in &lvols {
            self.esnap_missing_remove(lvol);
        }

        let bs = self.bs.lock().take().ok_or_else(|| Error::NotFound {
            name: self.name(),
        })?;

        info!("unloading lvol store");
        bs.unload().await.map_err(|e| Error::Unload {
            source: e,
            name: self.name(),
        })?;

        Self::remove_from_list(self);
        info!("lvol store {} unloaded", self.name());
        Ok(())
    }

    /// Destroy the store: delete the super blob, then the blobstore.
    /// Same preconditions as unload; refuses immediately when busy.
    pub async fn destroy(self: &Arc<Self>) -> Result<(), Error> {
        self.check_quiesced()?;

        let lvols = {
            let mut guard = self.lvols.lock();
            std::mem::take(&mut *guard)
        };
        for lvol in &lvols {
            self.esnap_missing_remove(lvol);
        }

        let bs = self.bs.lock().take().ok_or_else(|| Error::NotFound {
            name: self.name(),
        })?;

        if let Some(super_id) = self.super_blob_id.lock().take() {
            info!("deleting super blob");
            if let Err(e) = bs.delete_blob(super_id).await {
                return Err(Error::Destroy {
                    source: e,
                    name: self.name(),
                });
            }
        }

        info!("destroying lvol store");
        bs.destroy().await.map_err(|e| Error::Destroy {
            source: e,
            name: self.name(),
        })?;

        Self::remove_from_list(self);
        info!("lvol store {} destroyed", self.name());
        Ok(())
    }

    /// Rename the store. The new name becomes visible in memory only once
    /// the super blob's metadata sync has succeeded; on failure the
    /// scratch slot is reset so another rename can follow.
    pub async fn rename(&self, new_name: &str) -> Result<(), Error> {
        if self.name() == new_name {
            return Ok(());
        }

        {
            let list = LVS_LIST.lock();
            if list
                .iter()
                .any(|l| l.name() == new_name || l.scratch_name() == new_name)
            {
                return Err(Error::Exists {
                    name: new_name.to_string(),
                });
            }
        }

        *self.new_name.lock() = new_name.to_string();

        let bs = self.bs();
        let super_id = self.super_blob_id.lock().ok_or_else(|| {
            Error::NotFound {
                name: self.name(),
            }
        })?;

        let superblob = bs
            .open_blob(super_id, BlobOpenOpts::default())
            .await
            .map_err(|e| Error::BlobOp {
                source: e,
                name: self.name(),
            })?;

        superblob.set_xattr(LVOL_NAME_XATTR, &terminated(new_name));

        let res = superblob.sync_md().await;
        match res {
            Ok(()) => {
                *self.name.lock() = new_name.to_string();
                let _ = superblob.close().await;
                Ok(())
            }
            Err(e) => {
                error!("lvol store rename operation failed");
                // reset the scratch slot so a retry with a different new
                // name is possible
                superblob
                    .set_xattr(LVOL_NAME_XATTR, &terminated(&self.name()));
                *self.new_name.lock() = self.name();
                let _ = superblob.close().await;
                Err(Error::SyncFailed {
                    source: e,
                    name: self.name(),
                })
            }
        }
    }
}
