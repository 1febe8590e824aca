//! The external snapshot back-device: reads are forwarded to an underlying
//! bdev through a per-thread channel table.
//!
//! The table is an array of channel slots indexed by core id. The fast path
//! takes no lock: it acquire-loads the published array and reads its own
//! core's slot, which no other core ever writes. When a core finds no slot,
//! it posts a rebind to the device's owning reactor and the read fails with
//! an out-of-memory error so the caller retries.
//!
//! A rebind release-publishes a larger copy of the array, stashes the
//! displaced one, opens channels on every reactor via the all-reactor
//! fan-out, and only then frees the stash: once the fan-out has visited a
//! reactor, that reactor can no longer hold a reference into the old array.

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::{
    bdev::{claim_bdev_shared, ClaimGuard},
    bs::{BsDev, BsError, ExtIoOpts},
    core::{
        Bdev,
        CoreError,
        Cores,
        DescriptorGuard,
        IoChannel,
        Reactors,
    },
};

struct Slot(UnsafeCell<Option<IoChannel>>);

struct ChannelTable {
    slots: Box<[Slot]>,
}

// Slot i is only written by the reactor on core i (during the fan-out) and
// only read by that same reactor; the array pointer itself is published
// with release/acquire.
unsafe impl Send for ChannelTable {}
unsafe impl Sync for ChannelTable {}

impl ChannelTable {
    fn alloc(len: usize) -> Box<ChannelTable> {
        Box::new(ChannelTable {
            slots: (0 .. len)
                .map(|_| Slot(UnsafeCell::new(None)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        })
    }
}

pub(crate) struct EsnapInner {
    bdev: Bdev,
    desc: Mutex<Option<DescriptorGuard>>,
    claim: Mutex<Option<ClaimGuard>>,
    /// the reactor that owns channel table maintenance
    owner: u32,
    channels: AtomicPtr<ChannelTable>,
    /// a displaced table parked here also serializes rebinds
    old: Mutex<Option<Box<ChannelTable>>>,
}

impl Drop for EsnapInner {
    fn drop(&mut self) {
        let ptr = self.channels.load(Ordering::Relaxed);
        if !ptr.is_null() {
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

async fn realloc_channels(inner: Arc<EsnapInner>) {
    debug_assert_eq!(Cores::current(), inner.owner);

    if inner.old.lock().is_some() {
        debug!(
            "{}: channel rebind already in flight",
            inner.bdev.name()
        );
        return;
    }

    let new_count = (Cores::current().max(Cores::count()) + 1) as usize;
    let cur = unsafe { &*inner.channels.load(Ordering::Relaxed) };

    if new_count > cur.slots.len() {
        // The old array may still be referenced from other reactors, so it
        // cannot be freed here. Publish a copy and park the original until
        // the fan-out below has visited every reactor.
        let new_table = ChannelTable::alloc(new_count);
        for (i, slot) in cur.slots.iter().enumerate() {
            let existing = unsafe { (*slot.0.get()).clone() };
            unsafe { *new_table.slots[i].0.get() = existing };
        }
        let displaced = inner
            .channels
            .swap(Box::into_raw(new_table), Ordering::AcqRel);
        *inner.old.lock() = Some(unsafe { Box::from_raw(displaced) });
    }

    // Open a channel on every reactor whose slot is still empty. Some may
    // have been skipped on an earlier pass.
    let fill = inner.clone();
    Reactors::on_each(move || {
        let tid = Cores::current() as usize;
        let table = unsafe { &*fill.channels.load(Ordering::Acquire) };
        if tid >= table.slots.len() {
            // a reactor added after the table was sized; the next read
            // from it triggers another rebind
            return;
        }
        let slot = unsafe { &mut *table.slots[tid].0.get() };
        if slot.is_none() {
            let desc = fill.desc.lock();
            if let Some(desc) = desc.as_ref() {
                match desc.get_io_channel() {
                    Ok(ch) => *slot = Some(ch),
                    Err(e) => error!(
                        "{}: failed to create esnap channel on core {}: {}",
                        fill.bdev.name(),
                        tid,
                        e
                    ),
                }
            }
        }
    })
    .await;

    *inner.old.lock() = None;
}

/// Back-device reading from an external read-only block device.
pub struct EsnapBsDev {
    inner: Arc<EsnapInner>,
}

impl EsnapBsDev {
    /// Open the bdev identified by the given esnap id and build the
    /// back-device, channels included. Runs on the reactor that will own
    /// the channel table.
    pub async fn create(
        id: &str,
        io_unit_size: u32,
    ) -> Result<EsnapBsDev, CoreError> {
        let bdev = Bdev::lookup_by_name(id)
            .or_else(|| Bdev::lookup_by_uuid_str(id))
            .ok_or_else(|| CoreError::BdevNotFound {
                name: id.to_string(),
            })?;

        if bdev.block_len() > io_unit_size
            || io_unit_size % bdev.block_len() != 0
        {
            return Err(CoreError::InvalidParams {
                name: bdev.name().to_string(),
                msg: format!(
                    "block size {} incompatible with io unit size {}",
                    bdev.block_len(),
                    io_unit_size
                ),
            });
        }

        let claim = claim_bdev_shared(&bdev)?;
        let desc = bdev.open(false)?;

        let inner = Arc::new(EsnapInner {
            bdev,
            desc: Mutex::new(Some(desc)),
            claim: Mutex::new(Some(claim)),
            owner: Cores::current(),
            channels: AtomicPtr::new(Box::into_raw(ChannelTable::alloc(0))),
            old: Mutex::new(None),
        });

        realloc_channels(inner.clone()).await;

        Ok(EsnapBsDev {
            inner,
        })
    }

    pub fn bdev(&self) -> Bdev {
        self.inner.bdev.clone()
    }

    /// width of the published channel table
    pub fn channel_table_len(&self) -> usize {
        unsafe { &*self.inner.channels.load(Ordering::Acquire) }
            .slots
            .len()
    }

    fn get_channel(&self) -> Option<IoChannel> {
        let tid = Cores::current() as usize;
        let table =
            unsafe { &*self.inner.channels.load(Ordering::Acquire) };

        if let Some(slot) = table.slots.get(tid) {
            if let Some(ch) = unsafe { (*slot.0.get()).as_ref() } {
                return Some(ch.clone());
            }
        }

        let inner = self.inner.clone();
        if let Some(r) = Reactors::get_by_core(self.inner.owner) {
            r.send_future(async move {
                realloc_channels(inner).await;
            });
        }
        None
    }
}

#[async_trait(?Send)]
impl BsDev for EsnapBsDev {
    fn blocklen(&self) -> u32 {
        self.inner.bdev.block_len()
    }

    fn blockcnt(&self) -> u64 {
        self.inner.bdev.num_blocks()
    }

    async fn read(
        &self,
        buf: &mut [u8],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        let ch = match self.get_channel() {
            Some(ch) => ch,
            None => {
                return Err(BsError::NoChannel {
                    source: Errno::ENOMEM,
                })
            }
        };
        ch.read_blocks(buf, lba, lba_count as u64).await.map_err(|_| {
            BsError::ReadError {
                source: Errno::EIO,
                lba,
                lba_count: lba_count as u64,
            }
        })
    }

    async fn readv(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        let ch = match self.get_channel() {
            Some(ch) => ch,
            None => {
                return Err(BsError::NoChannel {
                    source: Errno::ENOMEM,
                })
            }
        };
        ch.readv_blocks(iovs, lba, lba_count as u64).await.map_err(
            |_| BsError::ReadError {
                source: Errno::EIO,
                lba,
                lba_count: lba_count as u64,
            },
        )
    }

    async fn readv_ext(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
        _opts: &ExtIoOpts,
    ) -> Result<(), BsError> {
        // extended options are forwarded to the device as-is
        self.readv(iovs, lba, lba_count).await
    }

    async fn destroy(&self) {
        let inner = self.inner.clone();
        Reactors::on_each(move || {
            let tid = Cores::current() as usize;
            let table =
                unsafe { &*inner.channels.load(Ordering::Acquire) };
            if tid < table.slots.len() {
                // close this reactor's channel on this reactor
                unsafe { (*table.slots[tid].0.get()).take() };
            }
        })
        .await;

        self.inner.desc.lock().take();
        self.inner.claim.lock().take();
    }
}
