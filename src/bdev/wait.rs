use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use nix::errno::Errno;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{Bdev, BdevOps, BdevParams, CoreError, IoType};

/// Called when the bdev a waiter is interested in appears.
pub type WaitAvailableCb = Box<dyn Fn(&Bdev) + Send + Sync>;

struct WaitEntry {
    /// the bdev being waited upon
    target: Uuid,
    available_cb: WaitAvailableCb,
    /// name of the wait bdev itself
    name: String,
}

static WAITERS: Lazy<Mutex<Vec<Arc<WaitEntry>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

static EXAMINE_INSTALLED: OnceCell<()> = OnceCell::new();

static NEXT_WAIT_NAME: AtomicU64 = AtomicU64::new(0);

struct WaitOps {
    name: String,
}

#[async_trait(?Send)]
impl BdevOps for WaitOps {
    async fn read_blocks(
        &self,
        _buf: &mut [u8],
        _offset_blocks: u64,
        _num_blocks: u64,
    ) -> Result<(), CoreError> {
        Err(CoreError::NotSupported {
            source: Errno::ENOTSUP,
        })
    }

    fn io_type_supported(&self, _io_type: IoType) -> bool {
        false
    }

    fn destruct(&self) {
        WAITERS.lock().retain(|w| w.name != self.name);
    }
}

fn install_examine_hook() {
    EXAMINE_INSTALLED.get_or_init(|| {
        Bdev::register_examine_hook(Arc::new(|bdev: &Bdev| {
            // Collect first: a callback may register further bdevs, which
            // would re-enter this hook.
            let matched = WAITERS
                .lock()
                .iter()
                .filter(|w| w.target == bdev.uuid())
                .cloned()
                .collect::<Vec<_>>();
            for waiter in matched {
                debug!(
                    "wait bdev {}: target {} arrived",
                    waiter.name, waiter.target
                );
                (waiter.available_cb)(bdev);
            }
        }));
    });
}

/// Create a zero-capacity bdev whose sole purpose is to invoke
/// `available_cb` when a bdev with uuid `base_uuid` is registered.
pub fn create_wait_bdev(
    new_name: Option<&str>,
    new_uuid: Option<&str>,
    base_uuid: &str,
    available_cb: WaitAvailableCb,
) -> Result<Bdev, CoreError> {
    let target =
        Uuid::parse_str(base_uuid).map_err(|_| CoreError::InvalidParams {
            name: "wait".to_string(),
            msg: format!("invalid uuid '{}'", base_uuid),
        })?;

    let uuid = match new_uuid {
        Some(u) => Uuid::parse_str(u).map_err(|_| CoreError::InvalidParams {
            name: "wait".to_string(),
            msg: format!("invalid uuid '{}'", u),
        })?,
        None => Uuid::new_v4(),
    };

    let name = match new_name {
        Some(n) => n.to_string(),
        None => format!(
            "wait_{}_{}",
            base_uuid,
            NEXT_WAIT_NAME.fetch_add(1, Ordering::Relaxed)
        ),
    };

    install_examine_hook();

    let bdev = Bdev::register(
        BdevParams {
            name: name.clone(),
            uuid,
            product_name: "wait".to_string(),
            module: "wait",
            block_len: 512,
            num_blocks: 0,
        },
        Box::new(WaitOps {
            name: name.clone(),
        }),
    )?;

    WAITERS.lock().push(Arc::new(WaitEntry {
        target,
        available_cb,
        name,
    }));

    Ok(bdev)
}

/// Delete a wait bdev; its callback no longer fires.
pub fn delete_wait_bdev(bdev: &Bdev) -> Result<(), CoreError> {
    if bdev.driver() != "wait" {
        return Err(CoreError::BdevNotFound {
            name: bdev.name().to_string(),
        });
    }
    bdev.unregister()
}
