use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::bs::{BsDev, BsDevChannel, BsError};

struct EioState {
    refs: i32,
    destroyed: bool,
    next_channel: u64,
}

struct EioInner {
    name: String,
    state: Mutex<EioState>,
    freed: AtomicBool,
}

/// The degraded back device: every read fails with an I/O error. It stands
/// in for a missing external snapshot and keeps the blob readable for the
/// clusters it owns.
///
/// The device carries one creation reference plus one per open channel.
/// `destroy` drops the creation reference and forbids new channels; the
/// last channel to go releases the device's resources.
#[derive(Clone)]
pub struct EioBsDev(Arc<EioInner>);

impl EioBsDev {
    pub fn create(name: &str) -> Result<EioBsDev, BsError> {
        Ok(EioBsDev(Arc::new(EioInner {
            name: name.to_string(),
            state: Mutex::new(EioState {
                refs: 1,
                destroyed: false,
                next_channel: 0,
            }),
            freed: AtomicBool::new(false),
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// outstanding references: channels plus the creation reference
    pub fn refs(&self) -> i32 {
        self.0.state.lock().refs
    }

    /// whether the device's resources have been released
    pub fn is_freed(&self) -> bool {
        self.0.freed.load(Ordering::Relaxed)
    }

    fn put_ref(&self) {
        let refs = {
            let mut state = self.0.state.lock();
            state.refs -= 1;
            state.refs
        };
        assert!(refs >= 0);
        if refs == 0 {
            self.0.freed.store(true, Ordering::Relaxed);
        }
    }
}

#[async_trait(?Send)]
impl BsDev for EioBsDev {
    fn blocklen(&self) -> u32 {
        // Prevent divide by zero errors calculating LBAs that will never be
        // read.
        512
    }

    fn blockcnt(&self) -> u64 {
        // As large as possible without risk of overflow in byte arithmetic.
        u64::MAX / 512
    }

    async fn read(
        &self,
        _buf: &mut [u8],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        Err(BsError::ReadError {
            source: Errno::EIO,
            lba,
            lba_count: lba_count as u64,
        })
    }

    async fn readv(
        &self,
        _iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        Err(BsError::ReadError {
            source: Errno::EIO,
            lba,
            lba_count: lba_count as u64,
        })
    }

    async fn readv_ext(
        &self,
        _iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
        _opts: &crate::bs::ExtIoOpts,
    ) -> Result<(), BsError> {
        Err(BsError::ReadError {
            source: Errno::EIO,
            lba,
            lba_count: lba_count as u64,
        })
    }

    fn is_zeroes(&self, _lba: u64, _lba_count: u64) -> bool {
        false
    }

    fn create_channel(&self) -> Option<BsDevChannel> {
        let mut state = self.0.state.lock();
        if state.destroyed {
            return None;
        }
        state.refs += 1;
        state.next_channel += 1;
        Some(BsDevChannel(state.next_channel))
    }

    fn destroy_channel(&self, _ch: BsDevChannel) {
        self.put_ref();
    }

    async fn destroy(&self) {
        {
            let mut state = self.0.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        self.put_ref();
    }
}
