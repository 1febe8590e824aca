use async_trait::async_trait;
use nix::errno::Errno;

use crate::bs::BsError;

/// Hint that the caller's buffers live in a foreign memory domain. Only
/// device-backed variants can honour it.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDomain;

/// Extended I/O options, passed to the `_ext` read and write paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtIoOpts {
    pub memory_domain: Option<MemoryDomain>,
}

/// Opaque channel token handed out by a back device. Stateless variants
/// return none; variants that track per-channel state hand out a token and
/// count it.
#[derive(Debug)]
pub struct BsDevChannel(pub(crate) u64);

fn write_denied() -> Result<(), BsError> {
    // It is a programming error for the blobstore to issue writes against a
    // read-only parent; the error is still reported rather than swallowed.
    Err(BsError::WriteProtected {
        source: Errno::EPERM,
    })
}

/// The device a blob reads through for clusters it has not allocated
/// locally. All variants are read-only: the write family fails with a
/// not-permitted error. `blocklen` must always divide the blobstore's
/// io-unit size and `blockcnt` may only grow while the device is installed.
#[async_trait(?Send)]
pub trait BsDev: Send + Sync {
    fn blocklen(&self) -> u32;

    fn blockcnt(&self) -> u64;

    /// contiguous read into `buf`
    async fn read(
        &self,
        buf: &mut [u8],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError>;

    /// scatter read into the list of buffers
    async fn readv(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError>;

    /// scatter read with extended options; variants that cannot honour a
    /// memory domain hint report it as unsupported
    async fn readv_ext(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
        opts: &ExtIoOpts,
    ) -> Result<(), BsError> {
        if opts.memory_domain.is_some() {
            return Err(BsError::ExtOptsUnsupported {
                source: Errno::ENOTSUP,
            });
        }
        self.readv(iovs, lba, lba_count).await
    }

    async fn write(
        &self,
        _buf: &[u8],
        _lba: u64,
        _lba_count: u32,
    ) -> Result<(), BsError> {
        write_denied()
    }

    async fn writev(
        &self,
        _iovs: &[&[u8]],
        _lba: u64,
        _lba_count: u32,
    ) -> Result<(), BsError> {
        write_denied()
    }

    async fn writev_ext(
        &self,
        _iovs: &[&[u8]],
        _lba: u64,
        _lba_count: u32,
        _opts: &ExtIoOpts,
    ) -> Result<(), BsError> {
        write_denied()
    }

    async fn write_zeroes(
        &self,
        _lba: u64,
        _lba_count: u64,
    ) -> Result<(), BsError> {
        write_denied()
    }

    async fn unmap(&self, _lba: u64, _lba_count: u64) -> Result<(), BsError> {
        write_denied()
    }

    /// may answer true only when every byte in the range is known zero
    fn is_zeroes(&self, _lba: u64, _lba_count: u64) -> bool {
        false
    }

    fn create_channel(&self) -> Option<BsDevChannel> {
        None
    }

    fn destroy_channel(&self, _ch: BsDevChannel) {}

    /// Release the device's resources. Must tolerate channels still open on
    /// other threads; the object itself is freed when the last owner drops
    /// it.
    async fn destroy(&self) {}

    /// stable identity of the underlying media, when there is one
    fn identity(&self) -> Option<String> {
        None
    }
}
