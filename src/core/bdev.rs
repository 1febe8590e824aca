use std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{CoreError, DescriptorGuard, IoType};

/// Behaviour of a block device is provided by the module that registered it.
#[async_trait(?Send)]
pub trait BdevOps: Send + Sync {
    /// read the given number of blocks into the buffer
    async fn read_blocks(
        &self,
        buf: &mut [u8],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError>;

    /// write the given number of blocks from the buffer
    async fn write_blocks(
        &self,
        _buf: &[u8],
        _offset_blocks: u64,
        _num_blocks: u64,
    ) -> Result<(), CoreError> {
        Err(CoreError::NotSupported {
            source: Errno::ENOTSUP,
        })
    }

    /// whether the device supports the given I/O type
    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(io_type, IoType::Read)
    }

    /// called when the device is unregistered
    fn destruct(&self) {}
}

/// Construction parameters for a block device.
pub struct BdevParams {
    pub name: String,
    pub uuid: Uuid,
    pub product_name: String,
    pub module: &'static str,
    pub block_len: u32,
    pub num_blocks: u64,
}

pub(crate) struct BdevInner {
    name: String,
    uuid: Uuid,
    product_name: String,
    module: &'static str,
    block_len: u32,
    num_blocks: AtomicU64,
    ops: Box<dyn BdevOps>,
    claimed_by: Mutex<Option<&'static str>>,
    descriptors: AtomicU32,
    /// per-core io channel reference counts
    channels: Mutex<HashMap<u32, u32>>,
    remove_listeners: Mutex<Vec<Box<dyn Fn(&Bdev) + Send + Sync>>>,
}

/// Newtype structure that represents a block device. Once the bdev is
/// given out by a lookup, operations on it are safe: the registry hands
/// out shared handles, not raw pointers.
#[derive(Clone)]
pub struct Bdev(Arc<BdevInner>);

/// process wide list of registered bdevs
static BDEV_LIST: Lazy<Mutex<Vec<Bdev>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// examine hooks run against every newly registered bdev
type ExamineHook = Arc<dyn Fn(&Bdev) + Send + Sync>;
static EXAMINE_HOOKS: Lazy<Mutex<Vec<ExamineHook>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

impl Bdev {
    /// Register a new block device. The name must be unique; examine hooks
    /// run against the new device before this returns.
    pub fn register(
        params: BdevParams,
        ops: Box<dyn BdevOps>,
    ) -> Result<Bdev, CoreError> {
        let bdev = {
            let mut list = BDEV_LIST.lock();
            if list.iter().any(|b| b.name() == params.name) {
                return Err(CoreError::BdevExists {
                    name: params.name,
                });
            }
            let bdev = Bdev(Arc::new(BdevInner {
                name: params.name,
                uuid: params.uuid,
                product_name: params.product_name,
                module: params.module,
                block_len: params.block_len,
                num_blocks: AtomicU64::new(params.num_blocks),
                ops,
                claimed_by: Mutex::new(None),
                descriptors: AtomicU32::new(0),
                channels: Mutex::new(HashMap::new()),
                remove_listeners: Mutex::new(Vec::new()),
            }));
            list.push(bdev.clone());
            bdev
        };

        debug!("registered bdev {}", bdev);

        // Hooks may register further bdevs, so run them without any lock.
        let hooks = EXAMINE_HOOKS.lock().clone();
        for hook in hooks {
            hook(&bdev);
        }

        Ok(bdev)
    }

    /// Unregister the device: future lookups fail, remove listeners fire,
    /// and the module's destructor runs.
    pub fn unregister(&self) -> Result<(), CoreError> {
        {
            let mut list = BDEV_LIST.lock();
            match list.iter().position(|b| b == self) {
                Some(idx) => {
                    list.remove(idx);
                }
                None => {
                    return Err(CoreError::BdevNotFound {
                        name: self.name().to_string(),
                    })
                }
            }
        }

        if self.0.descriptors.load(Ordering::Relaxed) > 0 {
            warn!("{}: unregistered with descriptors outstanding", self);
        }

        let listeners =
            std::mem::take(&mut *self.0.remove_listeners.lock());
        for l in listeners {
            l(self);
        }

        self.0.ops.destruct();
        debug!("unregistered bdev {}", self.name());
        Ok(())
    }

    /// install a hook that runs against every bdev registered from now on
    pub fn register_examine_hook(hook: ExamineHook) {
        EXAMINE_HOOKS.lock().push(hook);
    }

    /// run a closure against the base device's removal
    pub fn add_remove_listener(
        &self,
        listener: Box<dyn Fn(&Bdev) + Send + Sync>,
    ) {
        self.0.remove_listeners.lock().push(listener);
    }

    /// Looks up a Bdev by its name.
    pub fn lookup_by_name(name: &str) -> Option<Self> {
        BDEV_LIST.lock().iter().find(|b| b.name() == name).cloned()
    }

    /// Looks up a Bdev by its uuid in canonical string form.
    pub fn lookup_by_uuid_str(uuid: &str) -> Option<Self> {
        BDEV_LIST
            .lock()
            .iter()
            .find(|b| b.uuid_as_string() == uuid.to_lowercase())
            .cloned()
    }

    /// Looks up a Bdev by its name, returning an error if absent.
    pub fn get_by_name(name: &str) -> Result<Self, CoreError> {
        Self::lookup_by_name(name).ok_or_else(|| CoreError::BdevNotFound {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    pub fn uuid_as_string(&self) -> String {
        self.0.uuid.to_string()
    }

    pub fn product_name(&self) -> &str {
        &self.0.product_name
    }

    /// the name of the module that registered this device
    pub fn driver(&self) -> &str {
        self.0.module
    }

    pub fn block_len(&self) -> u32 {
        self.0.block_len
    }

    pub fn num_blocks(&self) -> u64 {
        self.0.num_blocks.load(Ordering::Relaxed)
    }

    /// grow the device; block counts never shrink while installed
    pub fn set_num_blocks(&self, num_blocks: u64) {
        let cur = self.num_blocks();
        if num_blocks >= cur {
            self.0.num_blocks.store(num_blocks, Ordering::Relaxed);
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.num_blocks() * self.block_len() as u64
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        self.0.ops.io_type_supported(io_type)
    }

    /// Take the module-level exclusive claim on this device.
    pub fn claim(&self, module: &'static str) -> Result<(), CoreError> {
        let mut claimed = self.0.claimed_by.lock();
        if let Some(owner) = *claimed {
            return Err(CoreError::BdevClaimed {
                name: self.name().to_string(),
                claimed_by: owner.to_string(),
            });
        }
        *claimed = Some(module);
        Ok(())
    }

    pub fn release_claim(&self) {
        self.0.claimed_by.lock().take();
    }

    pub fn is_claimed(&self) -> bool {
        self.0.claimed_by.lock().is_some()
    }

    /// Opens the device, yielding a descriptor. A claimed device refuses
    /// read-write descriptors.
    pub fn open(&self, read_write: bool) -> Result<DescriptorGuard, CoreError> {
        if read_write
            && (self.is_claimed() || !self.io_type_supported(IoType::Write))
        {
            return Err(CoreError::OpenBdev {
                source: Errno::EPERM,
            });
        }
        self.0.descriptors.fetch_add(1, Ordering::Relaxed);
        Ok(DescriptorGuard::new(self.clone(), read_write))
    }

    /// Opens a device by name.
    pub fn open_by_name(
        name: &str,
        read_write: bool,
    ) -> Result<DescriptorGuard, CoreError> {
        Self::get_by_name(name)?.open(read_write)
    }

    pub(crate) fn close_descriptor(&self) {
        self.0.descriptors.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn channel_get(&self, core: u32) {
        *self.0.channels.lock().entry(core).or_insert(0) += 1;
    }

    pub(crate) fn channel_put(&self, core: u32) {
        let mut channels = self.0.channels.lock();
        if let Some(refs) = channels.get_mut(&core) {
            *refs -= 1;
            if *refs == 0 {
                channels.remove(&core);
            }
        }
    }

    /// number of io channels open on the given core, used to verify
    /// channel teardown
    pub fn channel_count(&self, core: u32) -> u32 {
        self.0.channels.lock().get(&core).copied().unwrap_or(0)
    }

    pub(crate) async fn read_blocks_at(
        &self,
        buf: &mut [u8],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        if offset_blocks + num_blocks > self.num_blocks()
            || buf.len() as u64 != num_blocks * self.block_len() as u64
        {
            return Err(CoreError::ReadFailed {
                source: Errno::EINVAL,
                offset: offset_blocks,
                len: num_blocks,
            });
        }
        self.0.ops.read_blocks(buf, offset_blocks, num_blocks).await
    }

    pub(crate) async fn write_blocks_at(
        &self,
        buf: &[u8],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        if !self.io_type_supported(IoType::Write) {
            return Err(CoreError::WriteFailed {
                source: Errno::EPERM,
                offset: offset_blocks,
                len: num_blocks,
            });
        }
        if offset_blocks + num_blocks > self.num_blocks()
            || buf.len() as u64 != num_blocks * self.block_len() as u64
        {
            return Err(CoreError::WriteFailed {
                source: Errno::EINVAL,
                offset: offset_blocks,
                len: num_blocks,
            });
        }
        self.0
            .ops
            .write_blocks(buf, offset_blocks, num_blocks)
            .await
    }
}

impl PartialEq for Bdev {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Display for Bdev {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name(), self.uuid_as_string())
    }
}

impl Debug for Bdev {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bdev '{}' [{} x {}]",
            self.name(),
            self.num_blocks(),
            self.block_len()
        )
    }
}
