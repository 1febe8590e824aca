//! External snapshot support for the lvol store.
//!
//! An esnap clone whose device is absent still opens: it gets an all-EIO
//! back device and is recorded in its store's missing-esnap registry,
//! keyed by the device identifier. When a bdev with a matching name or
//! uuid is registered, the registry resolves the record on the store's
//! owning reactor and swaps the placeholder for a real esnap back device.
//!
//! The registry is guarded by the store's own mutex, which is never held
//! across an await. Notification may run on any reactor; the `holds`
//! counter keeps a matched record alive between the notification and the
//! resolution running on the owning reactor, so that a concurrent remove
//! cannot retire it early.
//!
//! There is a window between a failed device lookup and the registry
//! insert in which the device may be registered and examined without
//! finding the record. The binder therefore re-queries the device
//! directory immediately after inserting and, on a hit, resolves inline.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    bdev::EsnapBsDev,
    bs::{
        Blob,
        BlobId,
        BsDev,
        BsError,
        EioBsDev,
        EsnapDevFactory,
    },
    core::{Bdev, Cores, CoreError, Reactors},
    lvs::{Lvol, Lvs, UUID_STRING_LEN},
};

/// One record per missing esnap device, listing the lvols waiting for it.
pub struct EsnapMissing {
    /// device identifier: a uuid string or bdev name
    pub(crate) id: String,
    pub(crate) lvols: Mutex<Vec<Arc<Lvol>>>,
    /// keeps the record alive across cross-reactor notification
    pub(crate) holds: AtomicU32,
}

impl EsnapMissing {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn holds(&self) -> u32 {
        self.holds.load(Ordering::Relaxed)
    }

    pub fn lvol_count(&self) -> usize {
        self.lvols.lock().len()
    }
}

impl Lvs {
    /// Record that `lvol` waits for the device identified by `id`.
    /// Owning-reactor only.
    pub(crate) fn esnap_missing_add(&self, lvol: &Arc<Lvol>, id: &str) {
        debug_assert_eq!(Cores::current(), self.thread);

        let mut tree = self.missing.lock();
        let rec = tree
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(EsnapMissing {
                    id: id.to_string(),
                    lvols: Mutex::new(Vec::new()),
                    holds: AtomicU32::new(0),
                })
            })
            .clone();
        {
            // an lvol reopened while still degraded is already listed
            let mut lvols = rec.lvols.lock();
            if !lvols.iter().any(|l| Arc::ptr_eq(l, lvol)) {
                lvols.push(lvol.clone());
            }
        }
        *lvol.missing.lock() = Some(rec);
    }

    /// Drop `lvol` from its missing record, retiring the record when no
    /// lvol waits on it and no notification holds it. Owning-reactor only.
    pub(crate) fn esnap_missing_remove(&self, lvol: &Arc<Lvol>) {
        let rec = match lvol.missing.lock().take() {
            Some(rec) => rec,
            None => return,
        };

        let mut tree = self.missing.lock();
        let empty = {
            let mut lvols = rec.lvols.lock();
            lvols.retain(|l| !Arc::ptr_eq(l, lvol));
            lvols.is_empty()
        };
        if empty && rec.holds.load(Ordering::Relaxed) == 0 {
            tree.remove(&rec.id);
        }
    }

    /// Exchange missing-record ownership between two lvols; used when a
    /// snapshot or delete shifts which lvol owns the external parent.
    /// Owning-reactor only.
    pub(crate) fn esnap_missing_swap(
        &self,
        lvol1: &Arc<Lvol>,
        lvol2: Option<&Arc<Lvol>>,
    ) {
        let lvol2 = match lvol2 {
            Some(lvol2) => lvol2,
            None => return,
        };

        let _tree = self.missing.lock();
        let mut m1 = lvol1.missing.lock();
        let mut m2 = lvol2.missing.lock();

        if m1.is_none() && m2.is_none() {
            return;
        }

        // exchange both the ownership pointers and the list membership
        if let Some(rec) = m1.as_ref() {
            let mut lvols = rec.lvols.lock();
            if let Some(slot) =
                lvols.iter_mut().find(|l| Arc::ptr_eq(l, lvol1))
            {
                *slot = lvol2.clone();
            }
        }
        if let Some(rec) = m2.as_ref() {
            let mut lvols = rec.lvols.lock();
            if let Some(slot) =
                lvols.iter_mut().find(|l| Arc::ptr_eq(l, lvol2))
            {
                *slot = lvol1.clone();
            }
        }
        std::mem::swap(&mut *m1, &mut *m2);
    }

    /// missing record for the given device id, if any
    pub fn esnap_missing_lookup(&self, id: &str) -> Option<Arc<EsnapMissing>> {
        self.missing.lock().get(id).cloned()
    }

    fn validate_esnap_id(cookie: &[u8]) -> Result<String, BsError> {
        // guard against arbitrary names and unterminated uuid strings
        if cookie.len() != UUID_STRING_LEN || cookie.last() != Some(&0) {
            return Err(BsError::InvalidArgument {
                msg: format!("invalid esnap id length ({})", cookie.len()),
            });
        }
        let id = std::str::from_utf8(&cookie[.. UUID_STRING_LEN - 1])
            .map_err(|_| BsError::InvalidArgument {
                msg: "esnap id is not a string".to_string(),
            })?;
        let uuid =
            Uuid::parse_str(id).map_err(|_| BsError::InvalidArgument {
                msg: "invalid esnap id: not a uuid".to_string(),
            })?;
        // the id must match the way the device directory spells uuids
        if uuid.to_string() != id {
            warn!("esnap id '{}' does not match parsed uuid", id);
            return Err(BsError::InvalidArgument {
                msg: format!("esnap id '{}' is not canonical", id),
            });
        }
        Ok(id.to_string())
    }

    /// The esnap binder: produce the back device for an esnap clone.
    /// Returns the real device when it exists, or an EIO placeholder with
    /// the lvol registered as waiting, which leaves the lvol degraded.
    pub(crate) async fn esnap_dev_create_raw(
        &self,
        blob_id: BlobId,
        cookie: Vec<u8>,
        lvol: Option<Arc<Lvol>>,
    ) -> Result<Option<Box<dyn BsDev>>, BsError> {
        let id = Self::validate_esnap_id(&cookie)?;
        let io_unit_size = self.bs().io_unit_size();

        match EsnapBsDev::create(&id, io_unit_size).await {
            Ok(dev) => return Ok(Some(Box::new(dev))),
            Err(CoreError::BdevNotFound {
                ..
            }) => {}
            Err(e) => {
                error!(
                    "blob {:#x}: failed to create bs_dev from bdev '{}': {}",
                    blob_id, id, e
                );
                return Err(BsError::EsnapCreate {
                    source: e.errno(),
                });
            }
        }

        // the device is missing; open degraded
        let lvol = match lvol.or_else(|| self.lvol_by_blob_id(blob_id)) {
            Some(lvol) => lvol,
            None => {
                error!(
                    "lvstore {}: no lvol for blob {:#x}",
                    self.name(),
                    blob_id
                );
                return Err(BsError::NoDevice {
                    name: id,
                });
            }
        };

        self.esnap_missing_add(&lvol, &id);

        // Close the race with a concurrent registration: if the device
        // appeared between the lookup and the registry insert, resolve
        // inline.
        if Bdev::lookup_by_name(&id)
            .or_else(|| Bdev::lookup_by_uuid_str(&id))
            .is_some()
        {
            self.esnap_missing_remove(&lvol);
            let dev = EsnapBsDev::create(&id, io_unit_size)
                .await
                .map_err(|e| BsError::EsnapCreate {
                    source: e.errno(),
                })?;
            return Ok(Some(Box::new(dev)));
        }

        let eio = EioBsDev::create(&id)?;
        info!("lvol {}: opened in degraded mode", lvol.unique_id());
        Ok(Some(Box::new(eio)))
    }
}

#[async_trait(?Send)]
impl EsnapDevFactory for Lvs {
    async fn create_esnap_dev(
        &self,
        blob: &Blob,
        blob_ctx: Option<&Arc<dyn Any + Send + Sync>>,
    ) -> Result<Option<Box<dyn BsDev>>, BsError> {
        // during the initial blob iteration esnaps stay unresolved
        if !self.load_esnaps.load(Ordering::Acquire) {
            return Ok(None);
        }

        let cookie = match blob.external_cookie() {
            Some(cookie) => cookie,
            None => {
                error!(
                    "blob {:#x}: failed to get external snapshot cookie",
                    blob.id()
                );
                return Err(BsError::InvalidArgument {
                    msg: "no external snapshot cookie".to_string(),
                });
            }
        };

        let lvol = blob_ctx
            .and_then(|ctx| ctx.clone().downcast::<Lvol>().ok());

        self.esnap_dev_create_raw(blob.id(), cookie, lvol).await
    }
}

/// Resolve one matched missing record on the store's owning reactor:
/// rebuild the back device of every waiting lvol against the now-present
/// bdev and install it into the open blob.
async fn esnap_dev_create_on_thread(lvs: Arc<Lvs>, rec: Arc<EsnapMissing>) {
    debug_assert_eq!(Cores::current(), lvs.thread);

    lvs.missing.lock().remove(&rec.id);

    let lvols = {
        let mut list = rec.lvols.lock();
        std::mem::take(&mut *list)
    };

    for lvol in lvols {
        rec.holds.fetch_add(1, Ordering::Relaxed);
        *lvol.missing.lock() = None;

        let blob_id = match lvol.blob_id() {
            Some(id) => id,
            None => {
                rec.holds.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
        };
        let cookie = match lvs.bs().blob_external_cookie(blob_id) {
            Some(cookie) => cookie,
            None => {
                rec.holds.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
        };

        match lvs
            .esnap_dev_create_raw(blob_id, cookie, Some(lvol.clone()))
            .await
        {
            Ok(Some(dev)) => {
                if let Err(e) =
                    lvs.bs().set_blob_esnap_dev(blob_id, dev).await
                {
                    error!(
                        "lvol {}/{}: failed to hotplug bs_dev: {}",
                        lvs.name(),
                        lvol.name(),
                        e
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(
                    "lvol {}/{}: failed to create bs_dev: {}",
                    lvs.name(),
                    lvol.name(),
                    e
                );
            }
        }

        rec.holds.fetch_sub(1, Ordering::Relaxed);
    }

    rec.holds.fetch_sub(1, Ordering::Relaxed);
}

/// Notify every lvol store that a bdev known by any of `names` now exists.
/// Callable from any reactor; resolution is posted to each store's owning
/// reactor. Returns true when any store was waiting for the device, so
/// the caller can keep other users away from it.
pub fn esnap_notify_bdev_add(names: &[&str]) -> bool {
    let mut ret = false;

    for lvs in Lvs::iter() {
        let matched = {
            let tree = lvs.missing.lock();
            names
                .iter()
                .filter_map(|name| tree.get(*name).cloned())
                .collect::<Vec<_>>()
        };

        for rec in matched {
            rec.holds.fetch_add(1, Ordering::Relaxed);
            ret = true;
            match Reactors::get_by_core(lvs.thread) {
                Some(r) => {
                    let lvs = lvs.clone();
                    r.send_future(async move {
                        esnap_dev_create_on_thread(lvs, rec).await;
                    });
                }
                None => {
                    error!(
                        "lvstore {}: missing bdev {}: no reactor to notify",
                        lvs.name(),
                        rec.id
                    );
                    rec.holds.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    ret
}

static EXAMINE_INSTALLED: OnceCell<()> = OnceCell::new();

/// Examine every newly registered bdev for waiting esnap clones.
pub(crate) fn install_examine_hook() {
    EXAMINE_INSTALLED.get_or_init(|| {
        Bdev::register_examine_hook(Arc::new(|bdev: &Bdev| {
            let uuid = bdev.uuid_as_string();
            let names = [bdev.name(), uuid.as_str()];
            if esnap_notify_bdev_add(&names) {
                info!(
                    "bdev {} matched one or more waiting esnap clones",
                    bdev.name()
                );
            }
        }));
    });
}
