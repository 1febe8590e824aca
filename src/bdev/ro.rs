use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{
    Bdev,
    BdevOps,
    BdevParams,
    CoreError,
    Cores,
    DescriptorGuard,
    IoType,
    Reactors,
};

/// One claim per base bdev, shared by every read-only user of it: the
/// read-only view bdevs and the external snapshot back-devices. The claim
/// holds a read-only descriptor and is released on the thread it was
/// created on.
pub(crate) struct RoClaim {
    base: Bdev,
    thread: u32,
    desc: Mutex<Option<DescriptorGuard>>,
    refs: Mutex<u32>,
    views: Mutex<Vec<Bdev>>,
}

static CLAIMS: Lazy<Mutex<BTreeMap<String, Arc<RoClaim>>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

static NEXT_RO_NAME: AtomicU64 = AtomicU64::new(0);

/// A reference on the shared read-only claim of a base bdev. Dropping the
/// last reference releases the claim.
pub struct ClaimGuard(pub(crate) Arc<RoClaim>);

impl ClaimGuard {
    pub fn base(&self) -> Bdev {
        self.0.base.clone()
    }

    pub(crate) fn get_io_channel(
        &self,
    ) -> Result<crate::core::IoChannel, CoreError> {
        let desc = self.0.desc.lock();
        match desc.as_ref() {
            Some(desc) => desc.get_io_channel(),
            None => Err(CoreError::GetIoChannel {
                source: nix::errno::Errno::ENODEV,
            }),
        }
    }
}

/// Take (or reference) the shared read-only claim on the given base bdev.
pub fn claim_bdev_shared(base: &Bdev) -> Result<ClaimGuard, CoreError> {
    let mut tree = CLAIMS.lock();

    // Typical case: increment the existing claim.
    if let Some(claim) = tree.get(base.name()) {
        *claim.refs.lock() += 1;
        return Ok(ClaimGuard(claim.clone()));
    }

    base.claim("ro")?;
    let desc = match base.open(false) {
        Ok(desc) => desc,
        Err(e) => {
            base.release_claim();
            return Err(e);
        }
    };

    let claim = Arc::new(RoClaim {
        base: base.clone(),
        thread: Cores::current(),
        desc: Mutex::new(Some(desc)),
        refs: Mutex::new(1),
        views: Mutex::new(Vec::new()),
    });

    // a removed base takes its read-only views with it
    let hook = claim.clone();
    base.add_remove_listener(Box::new(move |_| {
        let views = std::mem::take(&mut *hook.views.lock());
        for view in views {
            if let Err(e) = view.unregister() {
                error!("failed to unregister ro view: {}", e);
            }
        }
    }));

    tree.insert(base.name().to_string(), claim.clone());
    Ok(ClaimGuard(claim))
}

fn release_claim_now(claim: &RoClaim) {
    claim.desc.lock().take();
    claim.base.release_claim();
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let last = {
            let mut tree = CLAIMS.lock();
            let mut refs = self.0.refs.lock();
            *refs -= 1;
            if *refs == 0 {
                tree.remove(self.0.base.name());
                true
            } else {
                false
            }
        };

        if !last {
            return;
        }

        // Release on the claim's thread; post a message when dropped from
        // another one.
        if Cores::current() == self.0.thread {
            release_claim_now(&self.0);
        } else if let Some(r) = Reactors::get_by_core(self.0.thread) {
            let claim = self.0.clone();
            r.send_future(async move {
                release_claim_now(&claim);
            });
        } else {
            release_claim_now(&self.0);
        }
    }
}

struct RoBdevOps {
    claim: Mutex<Option<ClaimGuard>>,
    view_name: String,
}

#[async_trait(?Send)]
impl BdevOps for RoBdevOps {
    async fn read_blocks(
        &self,
        buf: &mut [u8],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        let ch = {
            let claim = self.claim.lock();
            match claim.as_ref() {
                Some(claim) => claim.get_io_channel()?,
                None => {
                    return Err(CoreError::BdevNotFound {
                        name: self.view_name.clone(),
                    })
                }
            }
        };
        ch.read_blocks(buf, offset_blocks, num_blocks).await
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(io_type, IoType::Read)
    }

    fn destruct(&self) {
        if let Some(guard) = self.claim.lock().take() {
            guard
                .0
                .views
                .lock()
                .retain(|view| view.name() != self.view_name);
        }
    }
}

#[derive(Default)]
pub struct RoBdevOpts {
    pub name: Option<String>,
    pub uuid: Option<Uuid>,
}

/// Create a read-only view over a base bdev identified by exactly one of
/// name or uuid.
pub fn create_ro_bdev(
    base_name: Option<&str>,
    base_uuid: Option<&str>,
    opts: RoBdevOpts,
) -> Result<Bdev, CoreError> {
    let base = match (base_name, base_uuid) {
        (Some(name), None) => Bdev::get_by_name(name)?,
        (None, Some(uuid)) => Bdev::lookup_by_uuid_str(uuid).ok_or_else(|| {
            CoreError::BdevNotFound {
                name: uuid.to_string(),
            }
        })?,
        _ => {
            return Err(CoreError::InvalidParams {
                name: "ro".to_string(),
                msg: "exactly one of base name or base uuid required"
                    .to_string(),
            })
        }
    };

    let claim = claim_bdev_shared(&base)?;

    let name = opts.name.unwrap_or_else(|| {
        format!(
            "ro_{}_{}",
            base.name(),
            NEXT_RO_NAME.fetch_add(1, Ordering::Relaxed)
        )
    });
    let uuid = opts.uuid.unwrap_or_else(Uuid::new_v4);

    let bdev = Bdev::register(
        BdevParams {
            name: name.clone(),
            uuid,
            product_name: "read-only disk".to_string(),
            module: "ro",
            block_len: base.block_len(),
            num_blocks: base.num_blocks(),
        },
        Box::new(RoBdevOps {
            claim: Mutex::new(Some(claim)),
            view_name: name,
        }),
    )?;

    if let Some(claim) = CLAIMS.lock().get(base.name()) {
        claim.views.lock().push(bdev.clone());
    }

    Ok(bdev)
}

/// Delete a read-only view.
pub fn delete_ro_bdev(bdev: &Bdev) -> Result<(), CoreError> {
    if bdev.driver() != "ro" {
        return Err(CoreError::BdevNotFound {
            name: bdev.name().to_string(),
        });
    }
    bdev.unregister()
}

/// The base bdev a read-only view was created over.
pub fn ro_base_bdev(bdev: &Bdev) -> Option<Bdev> {
    CLAIMS
        .lock()
        .values()
        .find(|claim| claim.views.lock().iter().any(|v| v == bdev))
        .map(|claim| claim.base.clone())
}
